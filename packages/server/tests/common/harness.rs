//! Test harness modelling a small cluster on one in-memory bus.
//!
//! Every gateway built by the harness stands for one server process. They
//! share the snapshot store, claims and channel through a single
//! `MemoryBackend`, exactly as separate processes share NATS.

use std::sync::Arc;
use test_context::AsyncTestContext;
use tictactoe_core::common::GameId;
use tictactoe_core::domains::game::Role;
use tictactoe_core::domains::session::{GatewayError, SessionGateway};
use tictactoe_core::kernel::{MemoryBackend, RecordingEventSink, TestDependencies};

use super::TestClient;

/// Test harness with two processes, `a` and `b`, on one bus.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let mut x = ctx.join(&ctx.a, "alice", "g1", Mark::X).await;
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    pub deps: TestDependencies,
    pub a: SessionGateway,
    pub b: SessionGateway,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::with_deps(TestDependencies::new())
    }

    async fn teardown(self) {
        // Gateways and the in-memory bus are dropped with the harness
    }
}

impl TestHarness {
    pub fn with_deps(deps: TestDependencies) -> Self {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let a = deps.process().gateway();
        let b = deps.process().gateway();
        Self { deps, a, b }
    }

    /// One more process on the same bus.
    pub fn spawn_process(&self) -> SessionGateway {
        self.deps.process().gateway()
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.deps.backend
    }

    pub fn events(&self) -> &Arc<RecordingEventSink> {
        &self.deps.events
    }

    pub fn token(&self, identity: &str, game_id: &str, role: Role) -> String {
        self.deps
            .token(identity, game_id, role)
            .expect("Failed to issue test token")
    }

    /// Connect through `gateway`, returning the error on rejection.
    pub async fn try_join(
        &self,
        gateway: &SessionGateway,
        identity: &str,
        game_id: &str,
        role: Role,
    ) -> Result<TestClient, GatewayError> {
        let token = self.token(identity, game_id, role);
        let connection = gateway.connect(Some(&token)).await?;
        Ok(TestClient::new(gateway.clone(), connection))
    }

    /// Connect and consume the initial `update`.
    pub async fn join(
        &self,
        gateway: &SessionGateway,
        identity: &str,
        game_id: &str,
        role: Role,
    ) -> TestClient {
        let mut client = self
            .try_join(gateway, identity, game_id, role)
            .await
            .expect("Join should succeed");
        client.recv_update().await;
        client
    }

    /// Wait for bus fan-out to settle.
    pub async fn settle(&self) {
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    }
}

pub fn game(id: &str) -> GameId {
    GameId::parse(id).expect("valid game id")
}
