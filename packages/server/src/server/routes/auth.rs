//! Token issuing for players.
//!
//! POST /api/auth/register `{userId, gameId, role}` -> `{token}`

use axum::{extract::Extension, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::common::{GameId, Identity};
use crate::domains::game::Role;
use crate::server::app::AppState;

const REGISTER_USAGE: &str = "userId, gameId, role(X|O) are required";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    user_id: Option<String>,
    game_id: Option<String>,
    role: Option<String>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    token: String,
}

impl RegisterRequest {
    fn validate(self) -> Option<(Identity, GameId, Role)> {
        let identity = Identity::parse(self.user_id?).ok()?;
        let game_id = GameId::parse(self.game_id?).ok()?;
        let role = self.role?.parse().ok()?;
        Some((identity, game_id, role))
    }
}

pub async fn register_handler(
    Extension(state): Extension<AppState>,
    body: Option<Json<RegisterRequest>>,
) -> Result<Json<RegisterResponse>, (StatusCode, Json<Value>)> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let (identity, game_id, role) = request
        .validate()
        .ok_or_else(|| (StatusCode::BAD_REQUEST, Json(json!({ "error": REGISTER_USAGE }))))?;

    let token = state
        .jwt_service
        .create_token(&identity, &game_id, role)
        .map_err(|e| {
            error!(error = %e, "Failed to issue token");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to issue token" })),
            )
        })?;

    info!(game_id = %game_id, role = %role, identity = %identity, "Issued player token");
    Ok(Json(RegisterResponse { token }))
}
