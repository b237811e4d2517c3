//! Edge Bridge service
//!
//! Modbus RTU to message bus bridge for a home battery inverter.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use edgebridge::core::bootstrap::{self, Args};
use edgebridge::core::config::BridgeConfig;
use edgebridge::runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let service_info = bootstrap::service_info();

    bootstrap::initialize_logging(&args, &service_info)?;
    if !args.no_color {
        common::service_bootstrap::print_startup_banner(&service_info);
    }

    // Validation mode: validate and exit
    if args.validate {
        bootstrap::validate_configuration(&args).context("Configuration is invalid")?;
        info!("Validation completed successfully");
        return Ok(());
    }

    // Invalid configuration stops the service before any hardware is touched
    let config =
        BridgeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let bind_address = bootstrap::determine_bind_address(args.bind_address.clone(), &config);

    info!(
        "Starting {} for device {}",
        service_info.name, config.device.id
    );
    runtime::run(config, bind_address)
        .await
        .context("Bridge stopped with an error")?;

    info!("Service shutdown complete");
    Ok(())
}
