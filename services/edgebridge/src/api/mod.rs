//! Local status API
//!
//! Read-only probes: `GET /health`, `GET /status`, `GET /commands/{id}`.
//! `/api/admin/logs/level` reads or swaps the tracing filter at runtime.

pub mod handlers;
pub mod routes;

pub use routes::{create_router, AppState, DeviceInfo};
