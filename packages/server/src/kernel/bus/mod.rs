//! Replication bus: the only way processes learn about each other's changes.
//!
//! Three infrastructure traits, each keyed by game id:
//! - [`SnapshotStore`]: latest committed [`GameSession`] per game, written
//!   with compare-and-set on the session `version`.
//! - [`EventChannel`]: per-game pub/sub. Every subscriber, the publishing
//!   process included, receives every event.
//! - [`ClaimStore`]: atomic role-claim records consumed by the role registry.
//!
//! [`ReplicationBus`] combines store and channel and enforces the ordering
//! contract: a state change is saved before it is published, so any process
//! that reads the store after receiving an event sees that event's content.
//!
//! Backends: [`memory`] (tests, single node) and [`nats`] (production).

pub mod keys;
pub mod memory;
pub mod nats;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::common::{GameId, Identity};
use crate::domains::game::{GameSession, Mark, Role};

pub use memory::MemoryBackend;
pub use nats::NatsBackend;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Unavailable(anyhow::Error),

    /// The stored snapshot moved on since the caller's base was read.
    #[error("Snapshot changed concurrently (stored version {})", .current.version)]
    Conflict { current: Box<GameSession> },

    /// The snapshot was saved but the change notification was not delivered.
    #[error("Snapshot version {} saved but not published", .committed.version)]
    Unpublished { committed: Box<GameSession> },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BusError {
    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        Self::Unavailable(err.into())
    }
}

// =============================================================================
// Events
// =============================================================================

/// Message carried on a game's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    /// Full successor state, for moves and quits alike.
    #[serde(rename = "state")]
    StateChanged {
        #[serde(rename = "gameId")]
        game_id: GameId,
        state: GameSession,
    },
    /// Informational notice that a move was accepted.
    #[serde(rename = "move")]
    MoveMade {
        #[serde(rename = "gameId")]
        game_id: GameId,
        row: u8,
        col: u8,
        by: Mark,
    },
}

impl BusEvent {
    pub fn state_changed(game_id: &GameId, state: GameSession) -> Self {
        Self::StateChanged {
            game_id: game_id.clone(),
            state,
        }
    }

    pub fn game_id(&self) -> &GameId {
        match self {
            Self::StateChanged { game_id, .. } | Self::MoveMade { game_id, .. } => game_id,
        }
    }
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(BusEvent),
    /// The subscriber fell behind and `missed` events were dropped; the
    /// snapshot store is the way to catch up. `missed` is 0 when the backend
    /// cannot count them.
    Lagged { missed: u64 },
}

pub type EventStream = BoxStream<'static, Delivery>;

// =============================================================================
// Traits
// =============================================================================

/// Result of a create-if-absent on the snapshot store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Exists(GameSession),
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, game_id: &GameId) -> Result<Option<GameSession>, BusError>;

    /// Store `session` only if the game has no snapshot yet. Safe to race
    /// against other processes and the bootstrap API doing the same.
    async fn create(
        &self,
        game_id: &GameId,
        session: &GameSession,
    ) -> Result<CreateOutcome, BusError>;

    /// Compare-and-set: succeeds when no snapshot exists or the stored
    /// version is exactly `session.version - 1`; otherwise
    /// [`BusError::Conflict`] carrying the stored snapshot.
    async fn save(&self, game_id: &GameId, session: &GameSession) -> Result<(), BusError>;
}

#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, event: &BusEvent) -> Result<(), BusError>;

    async fn subscribe(&self, game_id: &GameId) -> Result<EventStream, BusError>;
}

/// Result of an atomic claim attempt on one (game, role) record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Held(Identity),
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Record `identity` for the role unless someone already holds it.
    async fn put_if_absent(
        &self,
        game_id: &GameId,
        role: Role,
        identity: &Identity,
    ) -> Result<PutOutcome, BusError>;

    async fn holder(&self, game_id: &GameId, role: Role) -> Result<Option<Identity>, BusError>;

    /// Remove the claim only if `identity` holds it. Returns whether it did.
    async fn remove_if_held_by(
        &self,
        game_id: &GameId,
        role: Role,
        identity: &Identity,
    ) -> Result<bool, BusError>;
}

/// Reject a stored session that contradicts its own board. Decoded records
/// are already checked; this also covers stores that hold sessions directly.
fn checked(game_id: &GameId, session: GameSession) -> Result<GameSession, BusError> {
    match session.check() {
        Ok(()) => Ok(session),
        Err(e) => {
            warn!(game_id = %game_id, version = session.version, error = %e, "Inconsistent snapshot");
            Err(BusError::Codec(serde::de::Error::custom(e)))
        }
    }
}

/// Used by the CAS check in every store implementation.
pub(crate) fn check_base_version(
    stored: Option<&GameSession>,
    incoming: &GameSession,
) -> Result<(), BusError> {
    match stored {
        Some(current) if current.version + 1 != incoming.version => Err(BusError::Conflict {
            current: Box::new(current.clone()),
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// ReplicationBus
// =============================================================================

/// Snapshot store plus channel, with the save-before-publish contract.
#[derive(Clone)]
pub struct ReplicationBus {
    store: Arc<dyn SnapshotStore>,
    channel: Arc<dyn EventChannel>,
}

impl ReplicationBus {
    pub fn new(store: Arc<dyn SnapshotStore>, channel: Arc<dyn EventChannel>) -> Self {
        Self { store, channel }
    }

    pub async fn load_snapshot(&self, game_id: &GameId) -> Result<Option<GameSession>, BusError> {
        self.store
            .load(game_id)
            .await?
            .map(|session| checked(game_id, session))
            .transpose()
    }

    pub async fn save_snapshot(
        &self,
        game_id: &GameId,
        session: &GameSession,
    ) -> Result<(), BusError> {
        self.store.save(game_id, session).await
    }

    pub async fn publish(&self, event: &BusEvent) -> Result<(), BusError> {
        self.channel.publish(event).await
    }

    pub async fn subscribe(&self, game_id: &GameId) -> Result<EventStream, BusError> {
        self.channel.subscribe(game_id).await
    }

    /// Create a fresh game if none exists and announce it.
    ///
    /// Returns `(fresh, true)` when this call created the snapshot and
    /// `(existing, false)` otherwise.
    pub async fn create_game(&self, game_id: &GameId) -> Result<(GameSession, bool), BusError> {
        let fresh = GameSession::new();
        match self.store.create(game_id, &fresh).await? {
            CreateOutcome::Created => {
                if let Err(e) = self
                    .channel
                    .publish(&BusEvent::state_changed(game_id, fresh.clone()))
                    .await
                {
                    // Joiners read the stored snapshot.
                    warn!(game_id = %game_id, error = %e, "Failed to announce new game");
                }
                Ok((fresh, true))
            }
            CreateOutcome::Exists(existing) => Ok((checked(game_id, existing)?, false)),
        }
    }

    /// Latest snapshot, creating a fresh game when the store has none.
    pub async fn load_or_create(&self, game_id: &GameId) -> Result<(GameSession, bool), BusError> {
        match self.load_snapshot(game_id).await? {
            Some(existing) => Ok((existing, false)),
            None => self.create_game(game_id).await,
        }
    }

    /// Persist `next` as the successor of `base` and publish it.
    ///
    /// Assigns `next.version = base.version + 1`. A stale base yields
    /// [`BusError::Conflict`]; a failed publish after a successful save yields
    /// [`BusError::Unpublished`] with the committed state.
    pub async fn commit(
        &self,
        game_id: &GameId,
        base: &GameSession,
        mut next: GameSession,
    ) -> Result<GameSession, BusError> {
        next.version = base.version + 1;
        match self.store.save(game_id, &next).await {
            Ok(()) => {}
            Err(BusError::Conflict { current }) => {
                return Err(BusError::Conflict {
                    current: Box::new(checked(game_id, *current)?),
                })
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self
            .channel
            .publish(&BusEvent::state_changed(game_id, next.clone()))
            .await
        {
            warn!(game_id = %game_id, version = next.version, error = %e, "Publish after save failed");
            return Err(BusError::Unpublished {
                committed: Box::new(next),
            });
        }

        debug!(game_id = %game_id, version = next.version, "Committed snapshot");
        Ok(next)
    }

    /// Informational move notice. Failures are logged, never surfaced.
    pub async fn publish_move(&self, game_id: &GameId, row: u8, col: u8, by: Mark) {
        let event = BusEvent::MoveMade {
            game_id: game_id.clone(),
            row,
            col,
            by,
        };
        if let Err(e) = self.channel.publish(&event).await {
            warn!(game_id = %game_id, error = %e, "Failed to publish move notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn game(id: &str) -> GameId {
        GameId::parse(id).unwrap()
    }

    #[test]
    fn test_state_event_wire_format() {
        let event = BusEvent::state_changed(&game("g1"), GameSession::new());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "state");
        assert_eq!(value["gameId"], "g1");
        assert_eq!(value["state"]["nextTurn"], "X");

        let back: BusEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_move_event_wire_format() {
        let raw = json!({"type": "move", "gameId": "g1", "row": 1, "col": 2, "by": "O"});
        let event: BusEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(
            event,
            BusEvent::MoveMade {
                game_id: game("g1"),
                row: 1,
                col: 2,
                by: Mark::O
            }
        );
        assert_eq!(event.game_id().as_str(), "g1");
    }

    #[tokio::test]
    async fn test_inconsistent_snapshot_is_a_codec_error() {
        let backend = MemoryBackend::new();
        let bus = backend.bus();
        let id = game("g1");

        let mut corrupt = GameSession::new();
        corrupt.move_count = 255;
        corrupt.version = 3;
        backend.snapshots().force(&id, corrupt);

        assert!(matches!(
            bus.load_snapshot(&id).await,
            Err(BusError::Codec(_))
        ));
        assert!(matches!(
            bus.load_or_create(&id).await,
            Err(BusError::Codec(_))
        ));
        assert!(matches!(
            bus.commit(&id, &GameSession::new(), GameSession::new()).await,
            Err(BusError::Codec(_))
        ));
    }

    #[test]
    fn test_check_base_version() {
        let mut stored = GameSession::new();
        stored.version = 4;

        let mut next = stored.clone();
        next.version = 5;
        assert!(check_base_version(Some(&stored), &next).is_ok());
        assert!(check_base_version(None, &next).is_ok());

        next.version = 4;
        match check_base_version(Some(&stored), &next) {
            Err(BusError::Conflict { current }) => assert_eq!(current.version, 4),
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}
