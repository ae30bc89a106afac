//! Integration tests for the HTTP surface.
//!
//! Requests go straight into the router with `oneshot`; no socket is bound.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::{game, TestHarness};
use serde_json::{json, Value};
use test_context::test_context;
use tictactoe_core::domains::auth::Authenticator;
use tictactoe_core::domains::game::Mark;
use tictactoe_core::server::build_app;
use tower::ServiceExt;

fn router(ctx: &TestHarness) -> Router {
    build_app(&ctx.deps.process()).0
}

async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[test_context(TestHarness)]
#[tokio::test]
async fn health_reports_ok(ctx: &TestHarness) {
    let (status, body) = call(router(ctx), get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["uptime"].as_f64().unwrap() >= 0.0);
    assert_eq!(body["activeGames"], 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn register_issues_a_usable_token(ctx: &TestHarness) {
    let (status, body) = call(
        router(ctx),
        post_json(
            "/api/auth/register",
            json!({"userId": "alice", "gameId": "g1", "role": "O"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let token = body["token"].as_str().unwrap();
    let principal = ctx.deps.jwt_service.verify(Some(token)).unwrap();
    assert_eq!(principal.identity.as_str(), "alice");
    assert_eq!(principal.game_id, game("g1"));
    assert_eq!(principal.role, Mark::O);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn register_rejects_incomplete_requests(ctx: &TestHarness) {
    let bad_bodies = [
        json!({"gameId": "g1", "role": "X"}),
        json!({"userId": "alice", "role": "X"}),
        json!({"userId": "alice", "gameId": "g1", "role": "Z"}),
        json!({"userId": "", "gameId": "g1", "role": "X"}),
    ];
    for bad in bad_bodies {
        let (status, body) = call(router(ctx), post_json("/api/auth/register", bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "userId, gameId, role(X|O) are required");
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn init_creates_once_then_conflicts(ctx: &TestHarness) {
    let (status, body) = call(router(ctx), post_json("/api/games/g1/init", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["gameId"], "g1");
    assert_eq!(body["state"]["nextTurn"], "X");

    // A second process sees the same store.
    let (status, body) = call(router(ctx), post_json("/api/games/g1/init", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Game already exists");

    assert!(ctx.backend().snapshots().get(&game("g1")).is_some());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn status_reflects_snapshot_and_players(ctx: &TestHarness) {
    let (status, body) = call(router(ctx), get("/api/games/g1/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"exists": false}));

    let x = ctx.join(&ctx.a, "alice", "g1", Mark::X).await;
    x.quit().await.unwrap();
    let _o = ctx.join(&ctx.b, "bob", "g1", Mark::O).await;

    let (status, body) = call(router(ctx), get("/api/games/g1/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exists"], true);
    assert_eq!(body["ended"], true);
    assert_eq!(body["winner"], Value::Null);
    assert_eq!(body["players"], json!({"X": null, "O": "bob"}));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn store_outage_surfaces_as_unavailable(ctx: &TestHarness) {
    ctx.backend().snapshots().set_fail_writes(true);
    let (status, _) = call(router(ctx), post_json("/api/games/g1/init", json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
