//! Game bootstrap and inspection.
//!
//! GET  /api/games/:id/status -> `{exists, ended?, winner?, players?}`
//! POST /api/games/:id/init   -> fresh game, 409 when one already exists

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::common::GameId;
use crate::kernel::bus::BusError;
use crate::server::app::AppState;

type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

fn parse_game_id(raw: String) -> Result<GameId, (StatusCode, Json<Value>)> {
    GameId::parse(raw)
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))))
}

fn bus_failure(game_id: &GameId, e: BusError) -> (StatusCode, Json<Value>) {
    warn!(game_id = %game_id, error = %e, "Bus request failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "Bus unavailable" })),
    )
}

pub async fn game_status_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let game_id = parse_game_id(id)?;
    let snapshot = state
        .gateway
        .bus()
        .load_snapshot(&game_id)
        .await
        .map_err(|e| bus_failure(&game_id, e))?;

    let Some(session) = snapshot else {
        return Ok((StatusCode::OK, Json(json!({ "exists": false }))));
    };

    let players = state
        .gateway
        .roles()
        .owners(&game_id)
        .await
        .map_err(|e| bus_failure(&game_id, e))?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "exists": true,
            "ended": session.ended,
            "winner": session.winner,
            "players": players,
        })),
    ))
}

pub async fn init_game_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let game_id = parse_game_id(id)?;
    let (session, created) = state
        .gateway
        .init_game(&game_id)
        .await
        .map_err(|e| bus_failure(&game_id, e))?;

    if !created {
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({ "error": "Game already exists", "gameId": game_id })),
        ));
    }
    Ok((
        StatusCode::OK,
        Json(json!({ "ok": true, "gameId": game_id, "state": session })),
    ))
}
