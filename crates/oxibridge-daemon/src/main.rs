//! # oxibridge
//!
//! Streams pulse-oximeter readings from Bluetooth LE into InfluxDB.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! INFLUXDB_TOKEN=... cargo run --package oxibridge-daemon
//!
//! # Production (systemd)
//! oxibridge --production --config /etc/oxibridge/config.toml
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::process::ExitCode;

use clap::Parser;
use oxibridge_daemon::{app, cli::Cli, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.production) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::from(2);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting oxibridge");

    match app::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, code = app::error_code(&e), "oxibridge failed");
            ExitCode::from(app::exit_code(&e))
        }
    }
}
