//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domains::auth::JwtService;
use crate::domains::session::SessionGateway;
use crate::kernel::ServerDeps;
use crate::server::routes::{
    game_status_handler, health_handler, init_game_handler, register_handler, ws_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: SessionGateway,
    pub jwt_service: Arc<JwtService>,
    pub started_at: Instant,
}

/// Build the Axum application router
///
/// Returns the router and this process's gateway.
pub fn build_app(deps: &ServerDeps) -> (Router, SessionGateway) {
    let gateway = deps.gateway();

    let app_state = AppState {
        gateway: gateway.clone(),
        jwt_service: deps.jwt_service.clone(),
        started_at: Instant::now(),
    };

    // CORS configuration - allow any origin for development
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let app = Router::new()
        // Game connections
        .route("/ws", get(ws_handler))
        // REST API
        .route("/api/auth/register", post(register_handler))
        .route("/api/health", get(health_handler))
        .route("/api/games/:id/status", get(game_status_handler))
        .route("/api/games/:id/init", post(init_game_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(app_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    (app, gateway)
}
