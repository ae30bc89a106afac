use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: String,
    /// Seconds since the process started serving.
    uptime: f64,
    active_games: usize,
}

/// Health check endpoint
///
/// Liveness only: the bus is exercised by real traffic, not here.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            uptime: state.started_at.elapsed().as_secs_f64(),
            active_games: state.gateway.active_games(),
        }),
    )
}
