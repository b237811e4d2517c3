//! Bus payloads
//!
//! Inbound JSON is parsed into closed types at the edge. A parse failure is a
//! [`MessageError`] that still carries whatever `commandId` could be
//! recovered, so the sender can be answered.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::command::{CommandOutput, CommandResult, Operation, Priority, TelemetryReading};
use crate::core::health::{HealthState, HealthStatus};
use crate::core::protocols::modbus::ExceptionCode;

/// Longest accepted `timeoutSeconds`
pub const MAX_TIMEOUT_SECONDS: f64 = 300.0;

/// Rejected inbound message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct MessageError {
    /// Correlation id, when the payload carried a usable one
    pub command_id: Option<String>,
    pub reason: String,
}

impl MessageError {
    fn new(command_id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            command_id,
            reason: reason.into(),
        }
    }
}

/// A validated inbound command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command_id: String,
    pub device_id: String,
    pub operation: Operation,
    pub priority: Priority,
    /// Per-attempt timeout; the configured default applies when absent
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommand {
    device_id: Option<String>,
    operation: Option<String>,
    address: Option<Value>,
    count: Option<Value>,
    value: Option<Value>,
    priority: Option<String>,
    timeout_seconds: Option<f64>,
    max_retries: Option<u32>,
}

impl CommandRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let json: Value = serde_json::from_slice(payload)
            .map_err(|e| MessageError::new(None, format!("invalid JSON: {}", e)))?;

        let command_id = match json.get("commandId") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => return Err(MessageError::new(None, "commandId must be a non-empty string")),
            None => return Err(MessageError::new(None, "missing commandId")),
        };
        let fail = |reason: String| MessageError::new(Some(command_id.clone()), reason);

        let raw: RawCommand =
            serde_json::from_value(json.clone()).map_err(|e| fail(format!("invalid field: {}", e)))?;

        let device_id = raw
            .device_id
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| fail("missing deviceId".to_string()))?;
        let operation_name = raw
            .operation
            .ok_or_else(|| fail("missing operation".to_string()))?;
        let address = match raw.address {
            Some(value) => as_u16(&value).ok_or_else(|| fail("address must be 0..=65535".into()))?,
            None => return Err(fail("missing address".to_string())),
        };
        let count = match raw.count {
            Some(value) => as_u16(&value).ok_or_else(|| fail("count must be 1..=65535".into()))?,
            None => 1,
        };

        let operation = build_operation(&operation_name, address, count, raw.value.as_ref())
            .map_err(&fail)?;
        operation.validate().map_err(&fail)?;

        let priority = match raw.priority {
            Some(p) => p.parse::<Priority>().map_err(&fail)?,
            None => Priority::Normal,
        };

        let timeout = match raw.timeout_seconds {
            Some(secs) if secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECONDS => {
                Some(Duration::from_secs_f64(secs))
            },
            Some(secs) => {
                return Err(fail(format!(
                    "timeoutSeconds {} outside (0, {}]",
                    secs, MAX_TIMEOUT_SECONDS
                )))
            },
            None => None,
        };

        if raw.max_retries == Some(0) {
            return Err(fail("maxRetries must be >= 1".to_string()));
        }

        Ok(Self {
            command_id,
            device_id,
            operation,
            priority,
            timeout,
            max_retries: raw.max_retries,
        })
    }
}

fn as_u16(value: &Value) -> Option<u16> {
    value.as_u64().and_then(|n| u16::try_from(n).ok())
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

fn build_operation(
    name: &str,
    address: u16,
    count: u16,
    value: Option<&Value>,
) -> Result<Operation, String> {
    let required = || value.ok_or_else(|| format!("{} requires a value", name));

    let operation = match name {
        "read_coils" => Operation::ReadCoils { address, count },
        "read_discrete_inputs" => Operation::ReadDiscreteInputs { address, count },
        "read_holding_registers" => Operation::ReadHoldingRegisters { address, count },
        "read_input_registers" => Operation::ReadInputRegisters { address, count },
        "write_single_coil" => Operation::WriteSingleCoil {
            address,
            value: as_bool(required()?).ok_or("coil value must be true/false or 0/1")?,
        },
        "write_single_register" => Operation::WriteSingleRegister {
            address,
            value: as_u16(required()?).ok_or("register value must be 0..=65535")?,
        },
        "write_multiple_coils" => {
            let items = required()?.as_array().ok_or("value must be an array")?;
            let values = items
                .iter()
                .map(as_bool)
                .collect::<Option<Vec<_>>>()
                .ok_or("coil values must be true/false or 0/1")?;
            Operation::WriteMultipleCoils { address, values }
        },
        "write_multiple_registers" => {
            let items = required()?.as_array().ok_or("value must be an array")?;
            let values = items
                .iter()
                .map(as_u16)
                .collect::<Option<Vec<_>>>()
                .ok_or("register values must be 0..=65535")?;
            Operation::WriteMultipleRegisters { address, values }
        },
        other => return Err(format!("unknown operation '{}'", other)),
    };
    Ok(operation)
}

/// Inbound cancel request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub command_id: String,
}

impl CancelRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let request: CancelRequest = serde_json::from_slice(payload)
            .map_err(|e| MessageError::new(None, format!("invalid cancel request: {}", e)))?;
        if request.command_id.trim().is_empty() {
            return Err(MessageError::new(None, "missing commandId"));
        }
        Ok(request)
    }
}

/// Outcome of a cancel request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAck {
    pub command_id: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One per terminal command, correlated by `commandId`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub command_id: String,
    pub device_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl CommandResponse {
    pub fn from_result(device_id: &str, result: &CommandResult) -> Self {
        Self {
            command_id: result.command_id.clone(),
            device_id: device_id.to_string(),
            success: result.is_success(),
            state: Some(result.state.to_string()),
            result: result.output.clone(),
            error: result.error.clone(),
            exception: result.exception,
            attempts: Some(result.attempts),
            timestamp: result.finished_at,
        }
    }

    /// Synthetic FAILED answer to a message that was never enqueued
    pub fn rejected(command_id: &str, device_id: &str, reason: &str) -> Self {
        Self {
            command_id: command_id.to_string(),
            device_id: device_id.to_string(),
            success: false,
            state: Some("FAILED".to_string()),
            result: None,
            error: Some(format!("validation error: {}", reason)),
            exception: None,
            attempts: Some(0),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub registers: BTreeMap<u16, u16>,
}

impl From<&TelemetryReading> for TelemetryMessage {
    fn from(reading: &TelemetryReading) -> Self {
        Self {
            device_id: reading.device_id.clone(),
            timestamp: reading.timestamp,
            registers: reading.register_values.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub device_id: String,
    pub device_type: String,
    pub status: HealthStatus,
    pub online: bool,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl StatusMessage {
    pub fn from_state(device_id: &str, device_type: &str, state: &HealthState) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            status: state.status,
            online: true,
            consecutive_failures: state.consecutive_failures,
            last_success_at: state.last_success_at,
            timestamp: Utc::now(),
        }
    }

    /// Retained last-will payload, published by the broker if the bridge
    /// disappears
    pub fn last_will(device_id: &str, device_type: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            status: HealthStatus::Offline,
            online: false,
            consecutive_failures: 0,
            last_success_at: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LinkOffline,
    LinkRecovered,
    DeviceException,
    MalformedCommand,
    CommandRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    pub device_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AlertMessage {
    pub fn new(
        device_id: &str,
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            alert_type,
            severity,
            message: message.into(),
            command_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_command(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }
}
