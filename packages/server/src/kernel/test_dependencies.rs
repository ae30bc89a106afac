// TestDependencies - in-memory wiring for tests
//
// One shared MemoryBackend stands in for the bus; every call to `process()`
// yields dependencies for one more server process attached to it.

use anyhow::Result;
use std::sync::Arc;

use super::bus::MemoryBackend;
use super::deps::{ServerDeps, DEFAULT_MOVE_RETRY_LIMIT};
use super::event_sink::RecordingEventSink;
use crate::common::{GameId, Identity};
use crate::domains::auth::JwtService;
use crate::domains::game::Role;

pub const TEST_JWT_SECRET: &str = "test_secret_key";
pub const TEST_JWT_ISSUER: &str = "tictactoe-test";

pub struct TestDependencies {
    pub backend: MemoryBackend,
    pub jwt_service: Arc<JwtService>,
    pub events: Arc<RecordingEventSink>,
    pub move_retry_limit: usize,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            backend: MemoryBackend::new(),
            jwt_service: Arc::new(JwtService::new(
                TEST_JWT_SECRET,
                TEST_JWT_ISSUER.to_string(),
            )),
            events: Arc::new(RecordingEventSink::new()),
            move_retry_limit: DEFAULT_MOVE_RETRY_LIMIT,
        }
    }

    /// Set the conflict retry budget for processes built afterwards
    pub fn with_retry_limit(mut self, limit: usize) -> Self {
        self.move_retry_limit = limit;
        self
    }

    /// Dependencies for one more process on the shared bus
    pub fn process(&self) -> ServerDeps {
        let mut deps =
            ServerDeps::in_memory(&self.backend, self.jwt_service.clone(), self.events.clone());
        deps.move_retry_limit = self.move_retry_limit;
        deps
    }

    /// Issue a valid token for the shared JWT service
    pub fn token(&self, identity: &str, game_id: &str, role: Role) -> Result<String> {
        let identity = Identity::parse(identity)?;
        let game_id = GameId::parse(game_id)?;
        self.jwt_service.create_token(&identity, &game_id, role)
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
