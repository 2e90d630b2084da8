use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::controller::{AppState, Lifecycle};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    scheduler: Lifecycle,
    devices_online: usize,
    devices_total: usize,
}

/// GET /healthz
///
/// Unhealthy once the scheduler stops; devices being offline is reported but
/// does not fail the check.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = state.scheduler.lifecycle();
    let devices = state.registry().snapshot();
    let online = devices.iter().filter(|d| d.state.online).count();
    let healthy = matches!(scheduler, Lifecycle::Initialized | Lifecycle::Running);

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        timestamp: chrono::Utc::now(),
        scheduler,
        devices_online: online,
        devices_total: devices.len(),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}
