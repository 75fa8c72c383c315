//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;
use oxibridge_core::{AddressKind, Config};

/// Stream pulse-oximeter readings from Bluetooth LE into InfluxDB.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "oxibridge", version, about)]
pub struct Cli {
    /// Configuration file. Defaults to /etc/oxibridge/config.toml.
    #[arg(short, long, env = "OXIBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Oximeter address, XX:XX:XX:XX:XX:XX.
    #[arg(long)]
    pub address: Option<String>,

    /// Oximeter address type: public or random.
    #[arg(long)]
    pub address_type: Option<AddressKind>,

    /// Local Bluetooth adapter, e.g. hci0.
    #[arg(long)]
    pub adapter: Option<String>,

    /// Log JSON to rolling files as well as stdout.
    #[arg(long, env = "OXIBRIDGE_PRODUCTION")]
    pub production: bool,

    /// Do not serve the status endpoints.
    #[arg(long)]
    pub no_status: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    pub print_config: bool,
}

impl Cli {
    /// Apply flags on top of the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(address) = &self.address {
            config.device.address.clone_from(address);
        }
        if let Some(kind) = self.address_type {
            config.device.address_type = kind;
        }
        if let Some(adapter) = &self.adapter {
            config.device.adapter = Some(adapter.clone());
        }
        if self.no_status {
            config.status.enabled = false;
        }
    }
}
