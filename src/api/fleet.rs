use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    controller::{AppState, FleetReport, PollOutcome},
    domain::{Device, DeviceDescriptor, DeviceId, Mode, ModeDecision, ModeParams},
};

/// POST /api/v1/fleet/mode body, e.g. `{"mode":"precharge","charge_w":2500}`
#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    #[serde(flatten)]
    pub mode: Mode,
    #[serde(default)]
    pub params: Option<ModeParams>,
}

#[derive(Debug, Serialize)]
pub struct SetModeResponse {
    /// Per-device success, keyed by device id
    pub results: BTreeMap<DeviceId, bool>,
    pub report: FleetReport,
}

/// GET /api/v1/devices
pub async fn list_devices(State(state): State<AppState>) -> Json<ApiResponse<Vec<Device>>> {
    Json(ApiResponse::success(state.registry().snapshot()))
}

/// GET /api/v1/fleet/status
pub async fn get_fleet_status(
    State(state): State<AppState>,
) -> Json<ApiResponse<BTreeMap<DeviceId, PollOutcome>>> {
    Json(ApiResponse::success(state.get_fleet_status().await))
}

/// GET /api/v1/fleet/decision - what the schedule wants right now
pub async fn get_decision(State(state): State<AppState>) -> Json<ApiResponse<ModeDecision>> {
    Json(ApiResponse::success(state.current_decision().await))
}

/// POST /api/v1/fleet/mode - operator override
pub async fn set_fleet_mode(
    State(state): State<AppState>,
    Json(req): Json<SetModeRequest>,
) -> Result<Json<ApiResponse<SetModeResponse>>, ApiError> {
    if let Some(params) = &req.params {
        params.validate()?;
    }
    let report = state.set_fleet_mode(req.mode, req.params).await?;
    Ok(Json(ApiResponse::success(SetModeResponse {
        results: report.as_bool_map(),
        report,
    })))
}

/// POST /api/v1/discovery
pub async fn trigger_discovery(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<DeviceDescriptor>>>, ApiError> {
    let found = state.trigger_discovery().await?;
    Ok(Json(ApiResponse::success(found)))
}
