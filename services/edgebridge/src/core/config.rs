//! Edge bridge configuration
//!
//! Layered with figment, lowest priority first:
//! 1. built-in defaults
//! 2. YAML file (`config/edgebridge.yaml` unless `--config` is given)
//! 3. `EDGEBRIDGE_` environment variables, nested with `__`
//!    (e.g. `EDGEBRIDGE_MODBUS__BAUD_RATE=19200`)
//!
//! [`BridgeConfig::validate`] reports every problem at once; startup fails
//! on any of them.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::command::{Operation, MAX_READ_BITS, MAX_READ_REGISTERS};
use crate::core::executor::RetryPolicy;
use crate::core::transport::SerialTransportConfig;
use crate::error::{BridgeError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/edgebridge.yaml";
pub const ENV_PREFIX: &str = "EDGEBRIDGE_";

/// Complete bridge configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub service: ServiceConfig,
    pub device: DeviceConfig,
    pub modbus: ModbusConfig,
    pub polling: PollingConfig,
    pub health: HealthConfig,
    pub queue: QueueConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP listen address for `/health` and `/status`
    pub bind_address: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    pub device_type: String,
    pub model: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "inverter-001".to_string(),
            device_type: "inverter".to_string(),
            model: "growatt-spf-5000".to_string(),
        }
    }
}

/// Serial link and retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    /// "none", "even" or "odd"
    pub parity: String,
    pub stop_bits: u8,
    pub slave_id: u8,
    /// Per-call response timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Total attempts per command, including the first
    pub retry_count: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// 1.0 keeps the delay fixed
    pub backoff_multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
            slave_id: 1,
            timeout: Duration::from_secs(3),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

/// Register table to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Holding,
    Input,
    Coils,
    DiscreteInputs,
}

/// One contiguous block read on every poll tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBlock {
    pub name: String,
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
}

impl PollBlock {
    pub fn operation(&self) -> Operation {
        let (address, count) = (self.address, self.count);
        match self.kind {
            RegisterKind::Holding => Operation::ReadHoldingRegisters { address, count },
            RegisterKind::Input => Operation::ReadInputRegisters { address, count },
            RegisterKind::Coils => Operation::ReadCoils { address, count },
            RegisterKind::DiscreteInputs => Operation::ReadDiscreteInputs { address, count },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub blocks: Vec<PollBlock>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            // inverter status map: 3021..=3060
            blocks: vec![PollBlock {
                name: "status".to_string(),
                kind: RegisterKind::Holding,
                address: 3021,
                count: 40,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Heartbeat and recovery-probe period
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    /// Per-attempt timeout for inbound commands that do not set one
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Cumulative time budget per command across retries
    #[serde(with = "humantime_serde")]
    pub command_ceiling: Duration,
    pub history_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            command_timeout: Duration::from_secs(10),
            command_ceiling: Duration::from_secs(30),
            history_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(with = "humantime_serde")]
    pub keepalive: Duration,
    pub qos: u8,
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: "edge-bridge".to_string(),
            username: None,
            password: None,
            keepalive: Duration::from_secs(60),
            qos: 1,
            topic_prefix: "nattery".to_string(),
        }
    }
}

/// Split `mqtt://host:port` (scheme and port optional)
pub fn parse_broker_url(url: &str) -> Option<(String, u16)> {
    let rest = match url.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some(_) => return None,
        None => url,
    };
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None => (rest, 1883),
    };
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

impl BridgeConfig {
    /// Provider stack: defaults, then YAML file, then environment
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(BridgeConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate
    ///
    /// An explicitly given file must exist. The default path may be absent,
    /// in which case defaults and environment apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(explicit) => {
                if !explicit.exists() {
                    return Err(BridgeError::config(format!(
                        "config file {} not found",
                        explicit.display()
                    )));
                }
                explicit
            },
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if !default.exists() {
                    info!(
                        "No config file at {}, using defaults and environment",
                        DEFAULT_CONFIG_PATH
                    );
                }
                default
            },
        };

        let config: BridgeConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting; all problems are reported together
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let mut check = |ok: bool, message: &str| {
            if !ok {
                problems.push(message.to_string());
            }
        };

        check(
            self.service.bind_address.parse::<std::net::SocketAddr>().is_ok(),
            "service.bind_address must be host:port",
        );
        check(!self.device.id.trim().is_empty(), "device.id must not be empty");

        let modbus = &self.modbus;
        check(!modbus.port.trim().is_empty(), "modbus.port must not be empty");
        check(modbus.baud_rate > 0, "modbus.baud_rate must be > 0");
        check(
            (5..=8).contains(&modbus.data_bits),
            "modbus.data_bits must be 5..=8",
        );
        check(
            matches!(
                modbus.parity.to_ascii_lowercase().as_str(),
                "none" | "even" | "odd"
            ),
            "modbus.parity must be none, even or odd",
        );
        check(
            (1..=2).contains(&modbus.stop_bits),
            "modbus.stop_bits must be 1 or 2",
        );
        check(
            (1..=247).contains(&modbus.slave_id),
            "modbus.slave_id must be 1..=247",
        );
        check(!modbus.timeout.is_zero(), "modbus.timeout must be > 0");
        check(modbus.retry_count >= 1, "modbus.retry_count must be >= 1");
        check(
            modbus.backoff_multiplier.is_finite() && modbus.backoff_multiplier >= 1.0,
            "modbus.backoff_multiplier must be >= 1.0",
        );
        check(
            modbus.max_retry_delay >= modbus.retry_delay,
            "modbus.max_retry_delay must be >= modbus.retry_delay",
        );

        check(
            !self.polling.interval.is_zero(),
            "polling.interval must be > 0",
        );

        check(
            !self.health.check_interval.is_zero(),
            "health.check_interval must be > 0",
        );
        check(
            self.health.max_consecutive_failures >= 1,
            "health.max_consecutive_failures must be >= 1",
        );

        let queue = &self.queue;
        check(queue.max_size > 0, "queue.max_size must be > 0");
        check(
            !queue.command_timeout.is_zero(),
            "queue.command_timeout must be > 0",
        );
        check(
            queue.command_ceiling >= queue.command_timeout,
            "queue.command_ceiling must be >= queue.command_timeout",
        );
        check(
            queue.command_ceiling >= modbus.timeout,
            "queue.command_ceiling must be >= modbus.timeout",
        );

        let mqtt = &self.mqtt;
        check(
            parse_broker_url(&mqtt.broker_url).is_some(),
            "mqtt.broker_url must look like mqtt://host:port",
        );
        check(!mqtt.client_id.is_empty(), "mqtt.client_id must not be empty");
        check(mqtt.qos <= 2, "mqtt.qos must be 0, 1 or 2");
        check(
            mqtt.keepalive >= Duration::from_secs(5),
            "mqtt.keepalive must be >= 5s",
        );
        check(
            !mqtt.topic_prefix.trim().is_empty() && !mqtt.topic_prefix.contains(['+', '#']),
            "mqtt.topic_prefix must be non-empty without wildcards",
        );

        for block in &self.polling.blocks {
            let limit = match block.kind {
                RegisterKind::Holding | RegisterKind::Input => MAX_READ_REGISTERS,
                RegisterKind::Coils | RegisterKind::DiscreteInputs => MAX_READ_BITS,
            };
            if block.count == 0 || block.count > limit {
                problems.push(format!(
                    "polling block '{}': count must be 1..={}",
                    block.name, limit
                ));
            } else if block.operation().validate().is_err() {
                problems.push(format!(
                    "polling block '{}': address range overflows 65535",
                    block.name
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::config(problems.join("; ")))
        }
    }

    pub fn serial(&self) -> SerialTransportConfig {
        SerialTransportConfig {
            port: self.modbus.port.clone(),
            baud_rate: self.modbus.baud_rate,
            data_bits: self.modbus.data_bits,
            stop_bits: self.modbus.stop_bits,
            parity: self.modbus.parity.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: self.modbus.retry_delay,
            backoff_multiplier: self.modbus.backoff_multiplier,
            max_delay: self.modbus.max_retry_delay,
            ceiling: self.queue.command_ceiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.modbus.timeout, Duration::from_secs(3));
        assert_eq!(config.queue.max_size, 100);
        assert_eq!(config.polling.blocks[0].address, 3021);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = BridgeConfig::default();
        config.modbus.baud_rate = 0;
        config.modbus.slave_id = 0;
        config.queue.max_size = 0;
        config.mqtt.qos = 3;

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("baud_rate"));
        assert!(message.contains("slave_id"));
        assert!(message.contains("max_size"));
        assert!(message.contains("qos"));
    }

    #[test]
    fn rejects_oversized_poll_block() {
        let mut config = BridgeConfig::default();
        config.polling.blocks.push(PollBlock {
            name: "too-big".to_string(),
            kind: RegisterKind::Input,
            address: 0,
            count: 126,
        });
        config.polling.blocks.push(PollBlock {
            name: "overflow".to_string(),
            kind: RegisterKind::Coils,
            address: 65530,
            count: 10,
        });
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("too-big"));
        assert!(message.contains("overflow"));
    }

    #[test]
    fn ceiling_must_cover_command_timeout() {
        let mut config = BridgeConfig::default();
        config.queue.command_ceiling = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_broker_urls() {
        assert_eq!(
            parse_broker_url("mqtt://broker.local:1884"),
            Some(("broker.local".to_string(), 1884))
        );
        assert_eq!(
            parse_broker_url("mosquitto"),
            Some(("mosquitto".to_string(), 1883))
        );
        assert_eq!(parse_broker_url("http://x:1"), None);
        assert_eq!(parse_broker_url("mqtt://:1883"), None);
        assert_eq!(parse_broker_url("mqtt://host:notaport"), None);
    }

    #[test]
    fn yaml_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bridge.yaml",
                r#"
device:
  id: inverter-xyz
modbus:
  port: /dev/ttyS1
  baud_rate: 19200
  timeout: 500ms
polling:
  interval: 2s
  blocks:
    - name: battery
      kind: input
      address: 100
      count: 10
"#,
            )?;
            jail.set_env("EDGEBRIDGE_MODBUS__SLAVE_ID", "7");
            jail.set_env("EDGEBRIDGE_QUEUE__MAX_SIZE", "5");

            let config = BridgeConfig::load(Some(Path::new("bridge.yaml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.device.id, "inverter-xyz");
            assert_eq!(config.modbus.port, "/dev/ttyS1");
            assert_eq!(config.modbus.baud_rate, 19200);
            assert_eq!(config.modbus.timeout, Duration::from_millis(500));
            assert_eq!(config.modbus.slave_id, 7);
            assert_eq!(config.queue.max_size, 5);
            assert_eq!(config.polling.interval, Duration::from_secs(2));
            assert_eq!(config.polling.blocks.len(), 1);
            assert_eq!(config.polling.blocks[0].kind, RegisterKind::Input);
            // untouched sections keep their defaults
            assert_eq!(config.mqtt.topic_prefix, "nattery");
            Ok(())
        });
    }

    #[test]
    fn invalid_env_value_fails_fast() {
        Jail::expect_with(|jail| {
            jail.set_env("EDGEBRIDGE_MODBUS__SLAVE_ID", "0");
            let result = BridgeConfig::figment(Path::new("missing.yaml"))
                .extract::<BridgeConfig>()
                .map_err(|e| e.to_string())?
                .validate();
            assert!(result.is_err());
            Ok(())
        });
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            BridgeConfig::load(Some(&missing)),
            Err(BridgeError::Config(_))
        ));
    }
}
