//! Transport layer traits
//!
//! A transport performs one request/response exchange per call over the
//! physical link. Only the transaction executor calls it, which keeps at
//! most one exchange on the wire.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::protocols::modbus::{ExceptionCode, RtuRequest};

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Port not open, or closed by an I/O failure
    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    /// No complete response within the per-call timeout
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// CRC, address or function-code check failed
    #[error("Corrupt frame: {0}")]
    FrameCorrupt(String),

    /// Device answered with an exception response
    #[error("Device exception on function 0x{function:02X}: {exception}")]
    ProtocolException {
        function: u8,
        exception: ExceptionCode,
    },

    /// Port opened but cannot be configured; the link is unusable
    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LinkUnavailable(_) | Self::Timeout(_) | Self::FrameCorrupt(_) => true,
            Self::ProtocolException { exception, .. } => exception.is_retryable(),
            Self::Io(_) => false,
        }
    }

    /// Short label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LinkUnavailable(_) => "link_unavailable",
            Self::Timeout(_) => "timeout",
            Self::FrameCorrupt(_) => "frame_corrupt",
            Self::ProtocolException { .. } => "protocol_exception",
            Self::Io(_) => "io",
        }
    }

    pub fn exception(&self) -> Option<ExceptionCode> {
        match self {
            Self::ProtocolException { exception, .. } => Some(*exception),
            _ => None,
        }
    }
}

/// Core transport trait
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Open the link
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the link; closing an already closed link is a no-op
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Send one request and wait for its response PDU
    ///
    /// A response arriving after `timeout` is discarded before the next
    /// exchange, never returned to a later call.
    async fn execute(
        &mut self,
        request: &RtuRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_error_kind() {
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(TransportError::FrameCorrupt("crc".into()).is_retryable());
        assert!(TransportError::LinkUnavailable("closed".into()).is_retryable());
        assert!(!TransportError::Io("bad parity".into()).is_retryable());

        let illegal = TransportError::ProtocolException {
            function: 0x03,
            exception: ExceptionCode::IllegalDataAddress,
        };
        assert!(!illegal.is_retryable());
        assert_eq!(illegal.exception(), Some(ExceptionCode::IllegalDataAddress));

        let busy = TransportError::ProtocolException {
            function: 0x06,
            exception: ExceptionCode::ServerDeviceBusy,
        };
        assert!(busy.is_retryable());
    }

    #[test]
    fn exception_message_names_function_and_code() {
        let err = TransportError::ProtocolException {
            function: 0x03,
            exception: ExceptionCode::IllegalDataAddress,
        };
        assert_eq!(
            err.to_string(),
            "Device exception on function 0x03: illegal data address (0x02)"
        );
    }
}
