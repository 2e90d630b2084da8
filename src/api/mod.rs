pub mod error;
pub mod fleet;
pub mod health;
pub mod response;
pub mod schedule;
pub mod v1;

use axum::{routing::get, Router};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{config::Config, controller::AppState};

pub fn router(state: AppState, cfg: &Config) -> Router {
    let request_timeout = Duration::from_secs(cfg.server.request_timeout_secs);
    Router::new()
        .route("/healthz", get(health::health_check))
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state.clone())
        .nest("/api/v1", v1::router(state, request_timeout))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::extract::DefaultBodyLimit::max(64 * 1024)),
        )
}
