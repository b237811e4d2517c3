//! Service bootstrap utilities
//!
//! Startup banner and logging initialisation shared by service binaries.

use crate::logging::{self, LogConfig};
use tracing::{info, Level};

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name (e.g., "edgebridge")
    pub name: String,
    /// Service version
    pub version: String,
    /// Service description
    pub description: String,
    /// Default HTTP port
    pub default_port: u16,
}

impl ServiceInfo {
    /// Create new service info with the given version
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        default_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            default_port,
        }
    }
}

/// Print startup banner for a service
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ███████╗██████╗  ██████╗ ███████╗
 ██╔════╝██╔══██╗██╔════╝ ██╔════╝
 █████╗  ██║  ██║██║  ███╗█████╗
 ██╔══╝  ██║  ██║██║   ██║██╔══╝
 ███████╗██████╔╝╚██████╔╝███████╗
 ╚══════╝╚═════╝  ╚═════╝ ╚══════╝
    "#;

    info!("{}", banner);
    info!("");
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!(" Default Port: {}", service.default_port);
    info!("");
}

/// Parse a level name, falling back to INFO
pub fn parse_level(level: &str) -> Level {
    level.parse::<Level>().unwrap_or(Level::INFO)
}

/// Initialize logging for a service with standard configuration
///
/// Log files go to `<log root>/<service name>/` where the root is
/// `EDGE_LOG_DIR`, then `log_dir`, then `logs`.
pub fn init_logging(
    service: &ServiceInfo,
    console_level: Level,
    log_dir: Option<&str>,
    ansi: bool,
) -> anyhow::Result<()> {
    let log_dir = logging::resolve_log_root(log_dir).join(&service.name);

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: Some(log_dir),
        console_level,
        enable_json: false,
        ansi,
    };

    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}
