//! Health, status and admin handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use common::{AppError, SuccessResponse};
use serde::{Deserialize, Serialize};

use crate::api::routes::{AppState, DeviceInfo};
use crate::core::health::{HealthState, HealthStatus};
use crate::core::queue::{CommandRecord, QueueStats};
use crate::gateway::GatewayStatsSnapshot;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub device: DeviceInfo,
    pub health: HealthState,
    pub queue: QueueStats,
    pub bus: GatewayStatsSnapshot,
}

/// Link health
///
/// @route GET /health
/// @status 200 - HEALTHY or DEGRADED
/// @status 503 - OFFLINE
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<SuccessResponse<HealthReport>>) {
    let health = state.health.snapshot();
    let code = match health.status {
        HealthStatus::Offline => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };

    let report = HealthReport {
        status: health.status,
        consecutive_failures: health.consecutive_failures,
        last_success_at: health.last_success_at,
        last_failure_at: health.last_failure_at,
        uptime_seconds: state.uptime_seconds(),
    };
    (code, Json(SuccessResponse::new(report)))
}

/// Health, queue and bus statistics
///
/// @route GET /status
pub async fn get_status(State(state): State<AppState>) -> Json<SuccessResponse<StatusReport>> {
    let report = StatusReport {
        service: crate::core::bootstrap::SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        started_at: state.started_at,
        device: (*state.device).clone(),
        health: state.health.snapshot(),
        queue: state.queue.stats(),
        bus: state.gateway.snapshot(),
    };
    Json(SuccessResponse::new(report))
}

/// Lifecycle record of a recent command
///
/// @route GET /commands/{id}
/// @status 404 - unknown or evicted from history
pub async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse<CommandRecord>>, AppError> {
    state
        .queue
        .record(&id)
        .map(|record| Json(SuccessResponse::new(record)))
        .ok_or_else(|| AppError::not_found(format!("command {} not found", id)))
}

/// Active tracing filter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLevel {
    pub level: String,
}

/// Current log filter
///
/// @route GET /api/admin/logs/level
pub async fn get_log_level() -> Json<SuccessResponse<LogLevel>> {
    Json(SuccessResponse::new(LogLevel {
        level: common::logging::get_log_level(),
    }))
}

/// Swap the log filter without a restart
///
/// @route POST /api/admin/logs/level
/// @body {"level": "debug"} or a full filter such as "info,edgebridge=trace"
/// @status 400 - invalid filter or logging not reloadable
pub async fn set_log_level(
    Json(request): Json<LogLevel>,
) -> Result<Json<SuccessResponse<LogLevel>>, AppError> {
    common::logging::set_log_level(&request.level).map_err(AppError::bad_request)?;
    Ok(Json(SuccessResponse::new(LogLevel {
        level: common::logging::get_log_level(),
    })))
}
