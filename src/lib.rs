//! # DMM Telemetry Decoder Library
//!
//! This library contains the core logic for decoding the binary telemetry
//! stream emitted by the BOLYFA 117 digital multimeter over USB serial. It
//! locates the fixed-length frame inside the raw byte stream, decodes the
//! seven-segment digits, unit flags, auxiliary mode flags and bar graph, and
//! produces timestamped measurement records ready for CSV logging.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{info, warn};
use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;

/// Length of one telemetry frame in bytes.
pub const FRAME_LEN: usize = 22;

/// Fixed byte sequence that opens every valid frame.
pub const PREAMBLE: [u8; 6] = [0xAA, 0x55, 0x52, 0x24, 0x01, 0x10];

/// Baud rate the meter transmits at. Not configurable on the hardware.
pub const BAUD_RATE: u32 = 2400;

/// Timeout for a single one-byte poll of the serial port.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

// Custom error types for the two fatal setup failures.
#[derive(Error, Debug)]
pub enum DmmError {
    /// The serial port could not be opened.
    #[error("could not open serial port {path}: {source}")]
    PortOpen {
        path: String,
        source: serialport::Error,
    },
    /// The CSV log file could not be created.
    #[error("could not open log file {path}: {source}")]
    LogOpen { path: String, source: io::Error },
}

/// Serial link settings for the meter connection.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Device path of the serial port.
    pub path: String,
    /// Baud rate; the meter only ever speaks [`BAUD_RATE`].
    pub baud_rate: u32,
    /// Per-read timeout. An expired read is not an error, it just means the
    /// meter had nothing to say this cycle.
    pub timeout: Duration,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            path: default_port().to_string(),
            baud_rate: BAUD_RATE,
            timeout: READ_TIMEOUT,
        }
    }
}

/// Returns the usual device path of the meter's USB serial adapter on the
/// current platform.
pub fn default_port() -> &'static str {
    if cfg!(target_os = "linux") {
        "/dev/ttyACM0"
    } else if cfg!(target_os = "macos") {
        "/dev/tty.usbmodem"
    } else {
        "COM1"
    }
}

/// Opens the serial port described by `config` and flushes its receive
/// buffer so decoding starts from live data.
pub fn open_port(config: &PortConfig) -> Result<Box<dyn SerialPort>, DmmError> {
    let port = serialport::new(&config.path, config.baud_rate)
        .timeout(config.timeout)
        .open()
        .map_err(|source| DmmError::PortOpen {
            path: config.path.clone(),
            source,
        })?;

    if let Err(e) = port.clear(ClearBuffer::Input) {
        warn!("could not flush receive buffer: {}", e);
    }
    info!("opened {} at {} baud", config.path, config.baud_rate);

    Ok(port)
}

/// Sliding window over the incoming byte stream that detects frame starts.
///
/// The window always holds the last [`FRAME_LEN`] bytes received, oldest
/// first, and is zero-filled until the first 22 bytes have arrived.
#[derive(Debug, Clone)]
pub struct FrameSync {
    window: [u8; FRAME_LEN],
}

impl FrameSync {
    pub fn new() -> Self {
        Self {
            window: [0; FRAME_LEN],
        }
    }

    /// Pushes one received byte into the window, dropping the oldest.
    ///
    /// Returns true when the window starts with the frame preamble. The
    /// protocol has no checksum, so a payload that happens to contain the
    /// preamble sequence produces a false synchronization; there is no
    /// recovery mechanism and none is attempted here.
    pub fn feed(&mut self, byte: u8) -> bool {
        self.window.rotate_left(1);
        self.window[FRAME_LEN - 1] = byte;
        self.window[..PREAMBLE.len()] == PREAMBLE
    }

    /// The last [`FRAME_LEN`] bytes received, oldest first.
    pub fn window(&self) -> &[u8; FRAME_LEN] {
        &self.window
    }
}

impl Default for FrameSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a seven-segment driver byte into the character it displays.
///
/// Segment bit order is: (msb) DP E G F D C B A (lsb). The decimal point
/// bit takes no part in the lookup; see [`has_decimal_point`]. Codes the
/// display cannot produce decode to `None` and render as nothing.
pub fn decode_segment(byte: u8) -> Option<char> {
    match byte & 0x7F {
        0x5F => Some('0'),
        0x06 => Some('1'),
        0x6B => Some('2'),
        0x2F => Some('3'),
        0x36 => Some('4'),
        0x3D => Some('5'),
        0x7D => Some('6'),
        0x07 => Some('7'),
        0x7F => Some('8'),
        0x3F => Some('9'),
        0x79 => Some('E'),
        0x58 => Some('L'),
        _ => None,
    }
}

/// True when the digit byte carries a decimal point to its left.
pub fn has_decimal_point(byte: u8) -> bool {
    byte & 0x80 != 0
}

// (window index, bit mask, symbol), checked top to bottom. The output order
// is part of the log format, so this table must not be reordered.
const UNIT_FLAGS: &[(usize, u8, &str)] = &[
    (21, 0x20, "k"),
    (21, 0x10, "M"),
    (21, 0x02, "m"),
    (21, 0x01, "u"),
    (21, 0x80, "Hz"),
    (21, 0x40, "R"),
    (21, 0x08, "V"),
    (21, 0x04, "A"),
    (20, 0x20, "u"),
    (20, 0x40, "n"),
    (20, 0x80, "F"),
    (20, 0x02, "oF"),
    (20, 0x01, "oC"),
    (19, 0x20, "%"),
    (19, 0x40, "hFE"),
    (10, 0x04, " DC"),
    (10, 0x02, " AC"),
];

/// Concatenates the unit symbols whose annunciator bits are lit.
///
/// Several flags may be set at once; every lit symbol is appended in table
/// order, even for combinations the meter cannot physically display.
pub fn decode_units(window: &[u8; FRAME_LEN]) -> String {
    let mut units = String::new();
    for &(index, mask, symbol) in UNIT_FLAGS {
        if window[index] & mask != 0 {
            units.push_str(symbol);
        }
    }
    units
}

/// Collects the auxiliary mode tokens in display order.
///
/// Most tokens carry their own leading comma. MAX/MIN/falling share a single
/// bare comma emitted when either the MAX or MIN bit is set, and the tokens
/// themselves carry none; the output reproduces that bit-for-bit.
pub fn decode_extras(window: &[u8; FRAME_LEN]) -> Vec<&'static str> {
    let mut extras = Vec::new();
    if window[19] & 0x01 != 0 {
        extras.push(",USB");
    }
    if window[18] & 0x20 != 0 {
        extras.push(",AUTO");
    }
    if window[18] & 0x80 != 0 {
        extras.push(",REL");
    }
    if window[19] & 0x0A != 0 {
        extras.push(",");
    }
    if window[19] & 0x02 != 0 {
        extras.push("MAX");
    }
    if window[19] & 0x04 != 0 {
        extras.push("-");
    }
    if window[19] & 0x08 != 0 {
        extras.push("MIN");
    }
    if window[10] & 0x40 != 0 {
        extras.push(",CONT");
    }
    if window[10] & 0x01 != 0 {
        extras.push(",DIODE");
    }
    extras
}

/// Counts the lit segments of the analog bar graph.
///
/// The graph spans the full bytes at indices 11 through 17 plus the low
/// nibble of index 18, for a maximum of 60. Higher counts are impossible
/// under correct framing and are passed through unclamped.
pub fn bar_graph_count(window: &[u8; FRAME_LEN]) -> u32 {
    let full_bytes: u32 = window[11..=17].iter().map(|b| b.count_ones()).sum();
    full_bytes + (window[18] & 0x0F).count_ones()
}

/// One decoded reading from the meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    /// Local date as `YYYY/MM/DD`.
    pub date: String,
    /// Local time as `HH:MM:SS.mmm`.
    pub time: String,
    /// Signed display value, with embedded decimal point if shown.
    pub value: String,
    /// Concatenated unit symbols, e.g. `"mV DC"`.
    pub units: String,
    /// Number of lit bar graph segments, 0 to 60.
    pub bars: u32,
    /// Auxiliary mode tokens, in display order.
    pub extras: Vec<&'static str>,
}

impl Measurement {
    /// Formats the record as one log line: `DATE,TIME,VALUE,UNITS,BAR`
    /// followed directly by the variable-width extras tokens.
    pub fn csv_line(&self) -> String {
        format!(
            "{},{},{},{},{}{}",
            self.date,
            self.time,
            self.value,
            self.units,
            self.bars,
            self.extras.concat()
        )
    }
}

/// Decodes a synchronized window into a [`Measurement`].
///
/// The value is built sign first, then the most significant digit (which has
/// no decimal point segment on the hardware), then the remaining digits at
/// indices 8, 7 and 6, each preceded by a '.' when its decimal point bit is
/// set. Deterministic: the same window and `now` always yield the same
/// record.
pub fn assemble(window: &[u8; FRAME_LEN], now: DateTime<Local>) -> Measurement {
    let mut value = String::new();
    if window[10] & 0x08 != 0 {
        value.push('-');
    }
    if let Some(c) = decode_segment(window[9]) {
        value.push(c);
    }
    for index in [8, 7, 6] {
        if has_decimal_point(window[index]) {
            value.push('.');
        }
        if let Some(c) = decode_segment(window[index]) {
            value.push(c);
        }
    }

    Measurement {
        date: now.format("%Y/%m/%d").to_string(),
        time: now.format("%H:%M:%S%.3f").to_string(),
        value,
        units: decode_units(window),
        bars: bar_graph_count(window),
        extras: decode_extras(window),
    }
}

/// Writes the three-line log header: title, column names, blank line.
pub fn write_header<W: Write>(sink: &mut W) -> io::Result<()> {
    sink.write_all(b"DMM_Log\nDATE,TIME,VALUE,UNITS,BAR,Extras\n\n")
}

/// CSV log file named by the `DMM_Log_<YYYYMMDD>_<HHMMSS>.csv` convention.
#[derive(Debug)]
pub struct CsvLog {
    path: String,
    file: File,
}

impl CsvLog {
    /// Creates the log file in `dir`, stamped with `now`, and writes the
    /// header. An existing file of the same name is truncated.
    pub fn create(dir: &Path, now: DateTime<Local>) -> Result<Self, DmmError> {
        let name = format!("DMM_Log_{}.csv", now.format("%Y%m%d_%H%M%S"));
        let path = dir.join(name).display().to_string();

        let mut file = File::create(&path).map_err(|source| DmmError::LogOpen {
            path: path.clone(),
            source,
        })?;
        write_header(&mut file).map_err(|source| DmmError::LogOpen {
            path: path.clone(),
            source,
        })?;

        Ok(Self { path, file })
    }

    /// Path of the log file as created.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Appends one record line.
    pub fn append(&mut self, measurement: &Measurement) -> io::Result<()> {
        writeln!(self.file, "{}", measurement.csv_line())
    }

    /// Flushes and closes the file.
    pub fn close(mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Polls `source` one byte at a time and invokes `on_record` for every
/// synchronized frame until `stop` is raised or the source is exhausted.
///
/// A read that times out, or is interrupted, leaves the window untouched and
/// the loop carries on; any other read error ends the loop. Errors returned
/// by `on_record` also end the loop and are passed through.
pub fn log_stream<R, F>(source: &mut R, stop: &AtomicBool, mut on_record: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(&Measurement) -> io::Result<()>,
{
    let mut sync = FrameSync::new();
    let mut buf = [0u8; 1];

    while !stop.load(Ordering::Relaxed) {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if sync.feed(buf[0]) {
                    let measurement = assemble(sync.window(), Local::now());
                    on_record(&measurement)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
