//! API route configuration

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{get_command, get_log_level, get_status, health_check, set_log_level};
use crate::core::health::HealthHandle;
use crate::core::queue::CommandQueue;
use crate::gateway::GatewayStats;

/// Static facts about the bridged device, shown in `/status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: String,
    pub model: String,
    pub serial_port: String,
    pub baud_rate: u32,
    pub slave_id: u8,
}

/// Shared state for the handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub health: HealthHandle,
    pub queue: Arc<CommandQueue>,
    pub gateway: Arc<GatewayStats>,
    pub device: Arc<DeviceInfo>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at)
            .num_seconds()
            .max(0)
            .try_into()
            .unwrap_or(0)
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/commands/{id}", get(get_command))
        .route(
            "/api/admin/logs/level",
            get(get_log_level).post(set_log_level),
        )
        .layer(middleware::from_fn(common::logging::http_request_logger))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
