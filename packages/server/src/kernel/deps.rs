//! Server dependencies (using traits for testability)
//!
//! This module provides the central dependency container the server is built
//! from. Backends sit behind traits so tests can run several gateways on one
//! in-memory bus.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{BusBackend, Config};
use crate::domains::auth::JwtService;
use crate::domains::roles::RoleRegistry;
use crate::domains::session::SessionGateway;
use crate::kernel::bus::{ClaimStore, MemoryBackend, NatsBackend, ReplicationBus};
use crate::kernel::event_sink::{EventSink, TracingEventSink};

/// Default retry budget when none is configured.
pub const DEFAULT_MOVE_RETRY_LIMIT: usize = 3;

/// Server dependencies shared by the gateway and the HTTP routes
#[derive(Clone)]
pub struct ServerDeps {
    pub bus: ReplicationBus,
    pub claims: Arc<dyn ClaimStore>,
    /// JWT service for token creation and connection authentication
    pub jwt_service: Arc<JwtService>,
    pub event_sink: Arc<dyn EventSink>,
    pub move_retry_limit: usize,
}

impl ServerDeps {
    /// Create new ServerDeps with the given dependencies
    pub fn new(
        bus: ReplicationBus,
        claims: Arc<dyn ClaimStore>,
        jwt_service: Arc<JwtService>,
        event_sink: Arc<dyn EventSink>,
        move_retry_limit: usize,
    ) -> Self {
        Self {
            bus,
            claims,
            jwt_service,
            event_sink,
            move_retry_limit,
        }
    }

    /// Connect the configured bus backend and wire everything up.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let (bus, claims) = match config.bus_backend {
            BusBackend::Nats => NatsBackend::connect(config).await?.into_parts(),
            BusBackend::Memory => {
                warn!("Using in-memory bus; state is not shared with other processes");
                let backend = MemoryBackend::new();
                (backend.bus(), backend.claim_store())
            }
        };
        info!(backend = ?config.bus_backend, "Replication bus ready");

        Ok(Self::new(
            bus,
            claims,
            Arc::new(JwtService::new(&config.jwt_secret, config.jwt_issuer.clone())),
            Arc::new(TracingEventSink),
            config.move_retry_limit,
        ))
    }

    /// Dependencies on a shared in-memory backend. Each call models one
    /// process attached to the same bus.
    pub fn in_memory(
        backend: &MemoryBackend,
        jwt_service: Arc<JwtService>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::new(
            backend.bus(),
            backend.claim_store(),
            jwt_service,
            event_sink,
            DEFAULT_MOVE_RETRY_LIMIT,
        )
    }

    pub fn role_registry(&self) -> RoleRegistry {
        RoleRegistry::new(self.claims.clone())
    }

    /// Build this process's session gateway.
    pub fn gateway(&self) -> SessionGateway {
        SessionGateway::new(
            self.bus.clone(),
            self.role_registry(),
            self.jwt_service.clone(),
            self.event_sink.clone(),
            self.move_retry_limit,
        )
    }
}
