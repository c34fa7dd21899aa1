use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use argh::FromArgs;
use chrono::Local;
use dmm_telemetry::{default_port, log_stream, open_port, CsvLog, PortConfig};
use log::{error, warn};

#[derive(FromArgs)]
#[argh(description = "Log readings from a BOLYFA 117 multimeter connected over USB serial")]
struct Args {
    #[argh(option, short = 'p')]
    #[argh(description = "serial port device path")]
    #[argh(default = "default_port().to_string()")]
    port: String,
}

// The main entry point for the data logger application.
fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args: Args = argh::from_env();

    println!("DMM Data Logger");
    println!();

    let config = PortConfig {
        path: args.port,
        ..PortConfig::default()
    };

    let mut port = match open_port(&config) {
        Ok(port) => port,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut log_file = match CsvLog::create(Path::new("."), Local::now()) {
        Ok(log_file) => log_file,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Logging data to {}", log_file.path());
    println!();
    println!("Press CTRL+C to stop logging");
    println!();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed)) {
            warn!("could not install CTRL+C handler: {}", e);
        }
    }

    let result = log_stream(&mut port, &stop, |measurement| {
        let line = measurement.csv_line();
        log_file.append(measurement)?;
        println!("{}", line);
        Ok(())
    });

    if stop.load(Ordering::Relaxed) {
        println!();
        println!("CTRL+C received...");
        println!();
    }

    // Release both resources no matter how the loop ended; a failure closing
    // one must not stop the other from being closed.
    drop(port);
    if let Err(e) = log_file.close() {
        warn!("could not close log file: {}", e);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("serial read failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
