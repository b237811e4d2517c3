//! Command model
//!
//! A [`Command`] is one unit of wire work. It is created by the gateway or
//! the poller, owned by the queue while pending and by the executor while
//! running, and ends as exactly one [`CommandResult`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::protocols::modbus::pdu::ExceptionCode;

/// Maximum registers per read request
pub const MAX_READ_REGISTERS: u16 = 125;
/// Maximum coils/discrete inputs per read request
pub const MAX_READ_BITS: u16 = 2000;
/// Maximum registers per write-multiple request
pub const MAX_WRITE_REGISTERS: u16 = 123;
/// Maximum coils per write-multiple request
pub const MAX_WRITE_COILS: u16 = 1968;

/// Execution priority, highest first: EMERGENCY > CRITICAL > NORMAL > LOW
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Critical,
    Emergency,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::Critical => "CRITICAL",
            Self::Emergency => "EMERGENCY",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "NORMAL" => Ok(Self::Normal),
            "CRITICAL" => Ok(Self::Critical),
            "EMERGENCY" => Ok(Self::Emergency),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Command lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandState {
    Pending,
    Executing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Who created a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Requested over the message bus
    External,
    /// Periodic telemetry read
    Poller,
    /// Recovery probe issued while the link is offline
    Probe,
}

/// Contiguous address span touched by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u16,
    pub count: u16,
}

impl AddressRange {
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// Whether the range stays inside the 16-bit address space
    pub fn fits(&self) -> bool {
        u32::from(self.start) + u32::from(self.count) <= 0x1_0000
    }
}

/// A Modbus operation with its addressing and payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    ReadCoils { address: u16, count: u16 },
    ReadDiscreteInputs { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Operation {
    /// Wire name used in inbound messages and logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadCoils { .. } => "read_coils",
            Self::ReadDiscreteInputs { .. } => "read_discrete_inputs",
            Self::ReadHoldingRegisters { .. } => "read_holding_registers",
            Self::ReadInputRegisters { .. } => "read_input_registers",
            Self::WriteSingleCoil { .. } => "write_single_coil",
            Self::WriteSingleRegister { .. } => "write_single_register",
            Self::WriteMultipleCoils { .. } => "write_multiple_coils",
            Self::WriteMultipleRegisters { .. } => "write_multiple_registers",
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadCoils { .. } => 0x01,
            Self::ReadDiscreteInputs { .. } => 0x02,
            Self::ReadHoldingRegisters { .. } => 0x03,
            Self::ReadInputRegisters { .. } => 0x04,
            Self::WriteSingleCoil { .. } => 0x05,
            Self::WriteSingleRegister { .. } => 0x06,
            Self::WriteMultipleCoils { .. } => 0x0F,
            Self::WriteMultipleRegisters { .. } => 0x10,
        }
    }

    pub fn is_read(&self) -> bool {
        self.function_code() <= 0x04
    }

    pub fn address_range(&self) -> AddressRange {
        match self {
            Self::ReadCoils { address, count }
            | Self::ReadDiscreteInputs { address, count }
            | Self::ReadHoldingRegisters { address, count }
            | Self::ReadInputRegisters { address, count } => AddressRange::new(*address, *count),
            Self::WriteSingleCoil { address, .. } | Self::WriteSingleRegister { address, .. } => {
                AddressRange::new(*address, 1)
            },
            Self::WriteMultipleCoils { address, values } => {
                AddressRange::new(*address, values.len() as u16)
            },
            Self::WriteMultipleRegisters { address, values } => {
                AddressRange::new(*address, values.len() as u16)
            },
        }
    }

    /// Values written by the operation; empty for reads
    pub fn payload(&self) -> Vec<u16> {
        match self {
            Self::WriteSingleCoil { value, .. } => vec![u16::from(*value)],
            Self::WriteSingleRegister { value, .. } => vec![*value],
            Self::WriteMultipleCoils { values, .. } => {
                values.iter().map(|v| u16::from(*v)).collect()
            },
            Self::WriteMultipleRegisters { values, .. } => values.clone(),
            _ => Vec::new(),
        }
    }

    /// Check quantity limits and address overflow
    pub fn validate(&self) -> Result<(), String> {
        let (len, max) = match self {
            Self::ReadCoils { count, .. } | Self::ReadDiscreteInputs { count, .. } => {
                (usize::from(*count), MAX_READ_BITS)
            },
            Self::ReadHoldingRegisters { count, .. } | Self::ReadInputRegisters { count, .. } => {
                (usize::from(*count), MAX_READ_REGISTERS)
            },
            Self::WriteSingleCoil { .. } | Self::WriteSingleRegister { .. } => (1, 1),
            Self::WriteMultipleCoils { values, .. } => (values.len(), MAX_WRITE_COILS),
            Self::WriteMultipleRegisters { values, .. } => (values.len(), MAX_WRITE_REGISTERS),
        };

        if len == 0 || len > usize::from(max) {
            return Err(format!(
                "{} quantity {} outside 1..={}",
                self.name(),
                len,
                max
            ));
        }
        if !self.address_range().fits() {
            return Err(format!(
                "{} range starting at {} exceeds the address space",
                self.name(),
                self.address_range().start
            ));
        }
        Ok(())
    }
}

/// A unit of wire work
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub target_device_id: String,
    pub operation: Operation,
    pub priority: Priority,
    /// Per-attempt timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Total attempts allowed, including the first
    pub max_retries: u32,
    pub origin: Origin,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn new(
        id: impl Into<String>,
        target_device_id: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            id: id.into(),
            target_device_id: target_device_id.into(),
            operation,
            priority: Priority::Normal,
            timeout: Duration::from_secs(3),
            max_retries: 3,
            origin: Origin::External,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Attempts the executor will make at most
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Successful outcome payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    /// Raw values keyed by address (coils as 0/1)
    Registers { registers: BTreeMap<u16, u16> },
    /// Write acknowledged by the device
    Written { address: u16, count: u16 },
}

/// Terminal outcome of one command
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: String,
    pub state: CommandState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CommandOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Device-reported exception that ended the command, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionCode>,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn completed(command_id: impl Into<String>, output: CommandOutput, attempts: u32) -> Self {
        Self {
            command_id: command_id.into(),
            state: CommandState::Completed,
            output: Some(output),
            error: None,
            exception: None,
            attempts,
            finished_at: Utc::now(),
        }
    }

    /// Terminal non-success outcome (`Failed`, `Timeout` or `Cancelled`)
    pub fn unsuccessful(
        command_id: impl Into<String>,
        state: CommandState,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            state,
            output: None,
            error: Some(error.into()),
            exception: None,
            attempts,
            finished_at: Utc::now(),
        }
    }

    pub fn cancelled(command_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::unsuccessful(command_id, CommandState::Cancelled, reason, 0)
    }

    pub fn with_exception(mut self, exception: ExceptionCode) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn is_success(&self) -> bool {
        self.state == CommandState::Completed
    }

    /// Register values when the command was a successful read
    pub fn registers(&self) -> Option<&BTreeMap<u16, u16>> {
        match &self.output {
            Some(CommandOutput::Registers { registers }) => Some(registers),
            _ => None,
        }
    }
}

/// Result of a successful poll cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub register_values: BTreeMap<u16, u16>,
}
