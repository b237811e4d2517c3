//! Unified error handling for edge bridge services
//!
//! Each service keeps its own domain error enum and implements
//! [`EdgeErrorTrait`] to expose a shared code/category vocabulary. [`EdgeError`]
//! is the generic fallback used by the shared libraries and binaries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// HTTP status or custom code
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Generic error type shared by the edge bridge crates
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Field link
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Timeout waiting for response: {0}")]
    Timeout(String),

    #[error("Frame integrity check failed: {0}")]
    FrameCorrupt(String),

    // Requests
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Capacity exhausted: {0}")]
    ResourceExhausted(String),

    // Runtime
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("External service error: {service}: {message}")]
    ExternalService { service: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EdgeResult<T> = Result<T, EdgeError>;

impl EdgeError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::ResourceExhausted(_) => 429,
            Self::Protocol { .. } | Self::FrameCorrupt(_) | Self::ExternalService { .. } => 502,
            Self::ServiceUnavailable(_) => 503,
            Self::Timeout(_) => 504,
            Self::Configuration(_) | Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => {
                500
            },
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new(self.to_string()).with_code(self.status_code());
        match self {
            Self::Validation(msg) => info.with_details(msg.clone()),
            _ => info,
        }
    }
}

impl From<serde_json::Error> for EdgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl EdgeErrorTrait for EdgeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::FrameCorrupt(_) => "FRAME_CORRUPT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::FrameCorrupt(_) => ErrorCategory::DataCorruption,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::ResourceExhausted(_) => ErrorCategory::ResourceExhausted,
            Self::ServiceUnavailable(_) | Self::ExternalService { .. } => ErrorCategory::Network,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

/// Error classification, drives retry hints, HTTP status and log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Timeout,

    Validation,
    NotFound,
    Conflict,

    // Field bus
    Protocol,
    Connection,
    DataCorruption,

    Internal,
    ResourceBusy,
    ResourceExhausted,
}

/// Shared error capability trait
///
/// Only `error_code` and `category` are required; everything else derives
/// from the category.
pub trait EdgeErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Stable error code for API bodies and logs
    fn error_code(&self) -> &'static str;

    fn category(&self) -> ErrorCategory;

    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::ResourceBusy
                | ErrorCategory::Connection
                | ErrorCategory::DataCorruption
        )
    }

    /// Suggested retry delay in milliseconds
    fn retry_delay_ms(&self) -> u64 {
        match self.category() {
            ErrorCategory::Network => 1000,
            ErrorCategory::Timeout => 500,
            ErrorCategory::ResourceBusy => 2000,
            ErrorCategory::Connection => 1500,
            _ => 0,
        }
    }

    #[cfg(feature = "axum-support")]
    fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.category() {
            ErrorCategory::Configuration => StatusCode::BAD_REQUEST,
            ErrorCategory::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCategory::Network | ErrorCategory::ResourceBusy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[cfg(feature = "axum-support")]
    fn into_http_response(self) -> axum::response::Response
    where
        Self: Sized,
    {
        use axum::response::{IntoResponse, Json};

        let body = serde_json::json!({
            "error_code": self.error_code(),
            "message": self.to_string(),
            "category": format!("{:?}", self.category()),
            "retryable": self.is_retryable(),
            "retry_delay_ms": self.retry_delay_ms(),
        });
        (self.http_status(), Json(body)).into_response()
    }

    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::DataCorruption => Level::ERROR,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }

    /// Whether an operator alert should be raised
    fn should_alert(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}
