//! Service bootstrap and initialization
//!
//! Command-line arguments, logging setup, configuration validation mode and
//! bind address resolution.

use std::path::PathBuf;

use clap::Parser;
use common::service_bootstrap::{self, ServiceInfo};
use tracing::info;

use crate::core::config::BridgeConfig;
use crate::error::{BridgeError, Result};

pub const SERVICE_NAME: &str = "edgebridge";
pub const DEFAULT_PORT: u16 = 8000;

/// Command-line arguments for edgebridge
#[derive(Parser, Debug, Clone)]
#[command(
    name = "edgebridge",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus RTU bridge for a home battery inverter",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "EDGEBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", env = "EDGEBRIDGE_LOG_LEVEL")]
    pub log_level: String,

    /// Bind address for the HTTP API, overrides `service.bind_address`
    #[arg(short = 'b', long)]
    pub bind_address: Option<String>,

    /// Directory for log files
    #[arg(long, env = "EDGEBRIDGE_LOG_DIR")]
    pub log_dir: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        SERVICE_NAME,
        env!("CARGO_PKG_VERSION"),
        "Modbus RTU bridge for a home battery inverter",
        DEFAULT_PORT,
    )
}

/// Initialize logging from command-line arguments
pub fn initialize_logging(args: &Args, service: &ServiceInfo) -> Result<()> {
    let level = service_bootstrap::parse_level(&args.log_level);
    service_bootstrap::init_logging(service, level, args.log_dir.as_deref(), !args.no_color)
        .map_err(|e| BridgeError::internal(format!("Failed to init logging: {}", e)))
}

/// Load the configuration and print a summary, without touching hardware
pub fn validate_configuration(args: &Args) -> Result<BridgeConfig> {
    let config = BridgeConfig::load(args.config.as_deref())?;

    info!(
        "Device: {} ({} {})",
        config.device.id, config.device.device_type, config.device.model
    );
    info!(
        "Serial: {} @ {} baud, {}{}{}, slave {}",
        config.modbus.port,
        config.modbus.baud_rate,
        config.modbus.data_bits,
        config
            .modbus
            .parity
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or('N'),
        config.modbus.stop_bits,
        config.modbus.slave_id
    );
    info!(
        "Polling {} block(s) every {:?}",
        config.polling.blocks.len(),
        config.polling.interval
    );
    for block in &config.polling.blocks {
        info!(
            "  {}: {:?} {}..{}",
            block.name,
            block.kind,
            block.address,
            u32::from(block.address) + u32::from(block.count)
        );
    }
    info!("Broker: {}", config.mqtt.broker_url);
    info!("Configuration validation completed successfully");
    Ok(config)
}

/// Determine bind address
/// Priority: CLI > Config
pub fn determine_bind_address(cli_arg: Option<String>, config: &BridgeConfig) -> String {
    if let Some(addr) = cli_arg {
        info!("Using bind address from command line: {}", addr);
        return addr;
    }
    config.service.bind_address.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = Args::parse_from([
            "edgebridge",
            "--config",
            "/etc/edgebridge.yaml",
            "-l",
            "debug",
            "--validate",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/edgebridge.yaml")));
        assert_eq!(args.log_level, "debug");
        assert!(args.validate);
        assert!(args.bind_address.is_none());
    }

    #[test]
    fn cli_bind_address_wins() {
        let config = BridgeConfig::default();
        assert_eq!(
            determine_bind_address(Some("127.0.0.1:9000".into()), &config),
            "127.0.0.1:9000"
        );
        assert_eq!(determine_bind_address(None, &config), "0.0.0.0:8000");
    }
}
