use axum::{
    extract::{Path, State},
    Json,
};
use std::str::FromStr;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    controller::{AppState, FireResult, JobDescriptor},
    domain::JobId,
};

/// GET /api/v1/schedule
pub async fn get_schedule_state(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<JobDescriptor>>> {
    Json(ApiResponse::success(state.get_schedule_state()))
}

/// POST /api/v1/schedule/:job/run
///
/// Goes through the same overlap guard as the timer, so a run already in
/// progress answers `skipped`.
pub async fn run_job(
    State(state): State<AppState>,
    Path(job): Path<String>,
) -> Result<Json<ApiResponse<FireResult>>, ApiError> {
    let id = JobId::from_str(&job).map_err(|_| ApiError::NotFound(format!("job {job}")))?;
    let fired = state.run_job(id).await?;
    Ok(Json(ApiResponse::success(fired)))
}
