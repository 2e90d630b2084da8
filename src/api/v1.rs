use axum::{
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use super::{fleet, schedule};
use crate::controller::AppState;

/// `/api/v1` routes. Fleet writes and discovery report per-device results and
/// are not subject to the request timeout.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let unbounded = Router::new()
        .route("/fleet/mode", post(fleet::set_fleet_mode))
        .route("/discovery", post(fleet::trigger_discovery));

    Router::new()
        .route("/devices", get(fleet::list_devices))
        .route("/fleet/status", get(fleet::get_fleet_status))
        .route("/fleet/decision", get(fleet::get_decision))
        .route("/schedule", get(schedule::get_schedule_state))
        .route("/schedule/:job/run", post(schedule::run_job))
        .layer(TimeoutLayer::new(request_timeout))
        .merge(unbounded)
        .with_state(state)
}
