// HTTP server setup (Axum + WebSocket)
pub mod app;
pub mod routes;

pub use app::*;
