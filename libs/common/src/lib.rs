//! Shared service plumbing for the edge bridge
//!
//! Provides the pieces every service binary needs:
//! - logging initialisation with runtime level reload
//! - startup banner and service metadata
//! - graceful shutdown signal handling
//! - standard API response envelopes

pub mod api_types;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use api_types::{ErrorResponse, SuccessResponse};

#[cfg(feature = "axum")]
pub use api_types::AppError;

pub use errors::ErrorInfo;
