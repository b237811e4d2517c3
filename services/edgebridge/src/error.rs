//! Error handling for the edge bridge
//!
//! Per-concern errors live next to the code that raises them
//! (`TransportError`, `QueueError`, `CancelError`, `MessageError`,
//! `BusError`). `BridgeError` gathers them at service boundaries.

use errors::{EdgeError, EdgeErrorTrait, ErrorCategory};
use thiserror::Error;

use crate::bus::messages::MessageError;
use crate::bus::BusError;
use crate::core::queue::{CancelError, QueueError};
use crate::core::transport::TransportError;

/// Edge bridge error type
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Queue rejected command: {0}")]
    Queue(#[from] QueueError),

    #[error("Cancel rejected: {0}")]
    Cancel(#[from] CancelError),

    #[error("Invalid message: {0}")]
    Message(#[from] MessageError),

    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the edge bridge
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<figment::Error> for BridgeError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl EdgeErrorTrait for BridgeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "BRIDGE_CONFIG_ERROR",
            Self::Transport(TransportError::LinkUnavailable(_)) => "BRIDGE_LINK_UNAVAILABLE",
            Self::Transport(TransportError::Timeout(_)) => "BRIDGE_TIMEOUT",
            Self::Transport(TransportError::FrameCorrupt(_)) => "BRIDGE_FRAME_CORRUPT",
            Self::Transport(TransportError::ProtocolException { .. }) => "BRIDGE_DEVICE_EXCEPTION",
            Self::Transport(TransportError::Io(_)) => "BRIDGE_IO_ERROR",
            Self::Queue(QueueError::QueueFull { .. }) => "BRIDGE_QUEUE_FULL",
            Self::Queue(QueueError::LinkOffline) => "BRIDGE_LINK_OFFLINE",
            Self::Queue(QueueError::Duplicate(_)) => "BRIDGE_DUPLICATE_COMMAND",
            Self::Queue(QueueError::Closed) => "BRIDGE_QUEUE_CLOSED",
            Self::Cancel(CancelError::NotFound(_)) => "BRIDGE_COMMAND_NOT_FOUND",
            Self::Cancel(CancelError::TooLate(_)) => "BRIDGE_CANCEL_TOO_LATE",
            Self::Cancel(CancelError::AlreadyTerminal { .. }) => "BRIDGE_ALREADY_TERMINAL",
            Self::Cancel(CancelError::Closed) => "BRIDGE_QUEUE_CLOSED",
            Self::Message(_) => "BRIDGE_INVALID_MESSAGE",
            Self::Bus(_) => "BRIDGE_BUS_ERROR",
            Self::Io(_) => "BRIDGE_IO_ERROR",
            Self::Internal(_) => "BRIDGE_INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Transport(err) => match err {
                TransportError::LinkUnavailable(_) => ErrorCategory::Connection,
                TransportError::Timeout(_) => ErrorCategory::Timeout,
                TransportError::FrameCorrupt(_) => ErrorCategory::DataCorruption,
                TransportError::ProtocolException { .. } => ErrorCategory::Protocol,
                TransportError::Io(_) => ErrorCategory::Internal,
            },
            Self::Queue(err) => match err {
                QueueError::QueueFull { .. } => ErrorCategory::ResourceExhausted,
                QueueError::LinkOffline => ErrorCategory::ResourceBusy,
                QueueError::Duplicate(_) => ErrorCategory::Conflict,
                QueueError::Closed => ErrorCategory::Internal,
            },
            Self::Cancel(err) => match err {
                CancelError::NotFound(_) => ErrorCategory::NotFound,
                CancelError::TooLate(_) | CancelError::AlreadyTerminal { .. } => {
                    ErrorCategory::Conflict
                },
                CancelError::Closed => ErrorCategory::Internal,
            },
            Self::Message(_) => ErrorCategory::Validation,
            Self::Bus(_) => ErrorCategory::Network,
            Self::Io(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

impl From<BridgeError> for EdgeError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Config(msg) => EdgeError::Configuration(msg),
            BridgeError::Transport(TransportError::Timeout(d)) => {
                EdgeError::Timeout(format!("No response within {d:?}"))
            },
            BridgeError::Transport(TransportError::FrameCorrupt(msg)) => EdgeError::FrameCorrupt(msg),
            BridgeError::Transport(other) => EdgeError::Protocol {
                protocol: "modbus_rtu".to_string(),
                message: other.to_string(),
            },
            BridgeError::Queue(QueueError::QueueFull { capacity }) => {
                EdgeError::ResourceExhausted(format!("Command queue full ({capacity})"))
            },
            BridgeError::Queue(other) => EdgeError::ServiceUnavailable(other.to_string()),
            BridgeError::Cancel(CancelError::NotFound(id)) => EdgeError::NotFound {
                resource: format!("command {id}"),
            },
            BridgeError::Cancel(other) => EdgeError::Conflict(other.to_string()),
            BridgeError::Message(err) => EdgeError::Validation(err.to_string()),
            BridgeError::Bus(err) => EdgeError::ExternalService {
                service: "mqtt".to_string(),
                message: err.to_string(),
            },
            BridgeError::Io(msg) => EdgeError::Io(std::io::Error::other(msg)),
            BridgeError::Internal(msg) => EdgeError::Internal(msg),
        }
    }
}

// ============================================================================
// API Adaptation: BridgeError → AppError conversion
// ============================================================================

impl From<BridgeError> for common::AppError {
    fn from(err: BridgeError) -> Self {
        use common::{AppError, ErrorInfo};

        let status = err.http_status();
        let error_info = ErrorInfo::new(err.to_string())
            .with_code(status.as_u16())
            .with_details(format!(
                "error_code: {}, category: {:?}, retryable: {}",
                err.error_code(),
                err.category(),
                err.is_retryable()
            ));

        AppError::new(status, error_info)
    }
}
