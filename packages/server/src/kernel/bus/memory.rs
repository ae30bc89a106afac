//! In-memory replication backend.
//!
//! One [`MemoryBackend`] shared between several gateways behaves like several
//! processes attached to the same bus: each gateway gets its own channel
//! receivers while the snapshot and claim maps are common. Used by tests and
//! by `BUS_BACKEND=memory` single-node deployments.
//!
//! Publishes and snapshot writes are recorded, and both can be made to fail,
//! so callers can assert on bus traffic without a real broker.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    check_base_version, BusError, BusEvent, ClaimStore, CreateOutcome, Delivery, EventChannel,
    EventStream, PutOutcome, ReplicationBus, SnapshotStore,
};
use crate::common::{GameId, Identity};
use crate::domains::game::{GameSession, Role};

/// Default per-game channel capacity.
const CHANNEL_CAPACITY: usize = 256;

fn injected_failure(what: &str) -> BusError {
    BusError::unavailable(anyhow::anyhow!("{} unavailable (injected)", what))
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<GameId, GameSession>>,
    fail_writes: AtomicBool,
}

impl MemorySnapshotStore {
    /// Make every subsequent create/save fail with `BusError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite the stored snapshot, bypassing the version check.
    pub fn force(&self, game_id: &GameId, session: GameSession) {
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(game_id.clone(), session);
    }

    pub fn get(&self, game_id: &GameId) -> Option<GameSession> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(game_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, game_id: &GameId) -> Result<Option<GameSession>, BusError> {
        Ok(self.get(game_id))
    }

    async fn create(
        &self,
        game_id: &GameId,
        session: &GameSession,
    ) -> Result<CreateOutcome, BusError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected_failure("snapshot store"));
        }
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = snapshots.get(game_id) {
            return Ok(CreateOutcome::Exists(existing.clone()));
        }
        snapshots.insert(game_id.clone(), session.clone());
        Ok(CreateOutcome::Created)
    }

    async fn save(&self, game_id: &GameId, session: &GameSession) -> Result<(), BusError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected_failure("snapshot store"));
        }
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        check_base_version(snapshots.get(game_id), session)?;
        snapshots.insert(game_id.clone(), session.clone());
        Ok(())
    }
}

// =============================================================================
// Channel
// =============================================================================

type Channels = Arc<RwLock<HashMap<GameId, broadcast::Sender<BusEvent>>>>;

/// Topic-keyed broadcast channels, one per game. A game's channel lives as
/// long as it has a subscription.
pub struct MemoryChannel {
    channels: Channels,
    capacity: usize,
    published: RwLock<Vec<BusEvent>>,
    fail_publishes: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            published: RwLock::new(Vec::new()),
            fail_publishes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Every event published so far, in publish order.
    pub fn published_events(&self) -> Vec<BusEvent> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Published events for one game.
    pub fn events_for(&self, game_id: &GameId) -> Vec<BusEvent> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|event| event.game_id() == game_id)
            .cloned()
            .collect()
    }

    pub fn publish_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Number of live subscriptions for a game, across all attached gateways.
    pub fn subscriber_count(&self, game_id: &GameId) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(game_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of games with an open channel.
    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// A game's event stream. Dropping the last one for a game removes the
/// game's channel.
struct Subscription {
    deliveries: BoxStream<'static, Delivery>,
    channels: Channels,
    game_id: GameId,
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.deliveries.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Swap in an empty stream to release the receiver before counting.
        self.deliveries = futures::stream::empty().boxed();
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        if matches!(channels.get(&self.game_id), Some(tx) if tx.receiver_count() == 0) {
            channels.remove(&self.game_id);
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventChannel for MemoryChannel {
    async fn publish(&self, event: &BusEvent) -> Result<(), BusError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(injected_failure("channel"));
        }
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());

        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = channels.get(event.game_id()) {
            // Ignore send errors (no active receivers)
            let _ = tx.send(event.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, game_id: &GameId) -> Result<EventStream, BusError> {
        let rx = {
            let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
            channels
                .entry(game_id.clone())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let deliveries = BroadcastStream::new(rx).map(|result| match result {
            Ok(event) => Delivery::Event(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Delivery::Lagged { missed },
        });
        Ok(Box::pin(Subscription {
            deliveries: deliveries.boxed(),
            channels: self.channels.clone(),
            game_id: game_id.clone(),
        }))
    }
}

// =============================================================================
// Claims
// =============================================================================

#[derive(Default)]
pub struct MemoryClaimStore {
    claims: RwLock<HashMap<(GameId, Role), Identity>>,
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn put_if_absent(
        &self,
        game_id: &GameId,
        role: Role,
        identity: &Identity,
    ) -> Result<PutOutcome, BusError> {
        let mut claims = self.claims.write().unwrap_or_else(|e| e.into_inner());
        let key = (game_id.clone(), role);
        if let Some(holder) = claims.get(&key) {
            return Ok(PutOutcome::Held(holder.clone()));
        }
        claims.insert(key, identity.clone());
        Ok(PutOutcome::Inserted)
    }

    async fn holder(&self, game_id: &GameId, role: Role) -> Result<Option<Identity>, BusError> {
        Ok(self
            .claims
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(game_id.clone(), role))
            .cloned())
    }

    async fn remove_if_held_by(
        &self,
        game_id: &GameId,
        role: Role,
        identity: &Identity,
    ) -> Result<bool, BusError> {
        let mut claims = self.claims.write().unwrap_or_else(|e| e.into_inner());
        let key = (game_id.clone(), role);
        if claims.get(&key) == Some(identity) {
            claims.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Shared in-memory bus. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    snapshots: Arc<MemorySnapshotStore>,
    channel: Arc<MemoryChannel>,
    claims: Arc<MemoryClaimStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(&self) -> ReplicationBus {
        ReplicationBus::new(self.snapshots.clone(), self.channel.clone())
    }

    pub fn claim_store(&self) -> Arc<dyn ClaimStore> {
        self.claims.clone()
    }

    pub fn snapshots(&self) -> &MemorySnapshotStore {
        &self.snapshots
    }

    pub fn channel(&self) -> &MemoryChannel {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::game::{validate_and_apply, Mark};

    fn game(id: &str) -> GameId {
        GameId::parse(id).unwrap()
    }

    async fn next_event(stream: &mut EventStream) -> BusEvent {
        match tokio::time::timeout(std::time::Duration::from_secs(1), stream.next()).await {
            Ok(Some(Delivery::Event(event))) => event,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let backend = MemoryBackend::new();
        let bus = backend.bus();
        let id = game("g1");

        let (fresh, created) = bus.load_or_create(&id).await.unwrap();
        assert!(created);
        assert_eq!(bus.load_snapshot(&id).await.unwrap(), Some(fresh.clone()));

        let next = validate_and_apply(&fresh, 1, 1, Mark::X).unwrap();
        let committed = bus.commit(&id, &fresh, next).await.unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(bus.load_snapshot(&id).await.unwrap(), Some(committed));
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let backend = MemoryBackend::new();
        let bus = backend.bus();
        let id = game("g1");

        let (first, created) = bus.create_game(&id).await.unwrap();
        assert!(created);
        let (second, created_again) = bus.load_or_create(&id).await.unwrap();
        assert!(!created_again);
        assert_eq!(first, second);
        assert_eq!(backend.channel().events_for(&id).len(), 1);
    }

    #[tokio::test]
    async fn test_commit_on_stale_base_conflicts() {
        let backend = MemoryBackend::new();
        let bus = backend.bus();
        let id = game("g1");
        let (base, _) = bus.load_or_create(&id).await.unwrap();

        let ours = validate_and_apply(&base, 0, 0, Mark::X).unwrap();
        let theirs = validate_and_apply(&base, 2, 2, Mark::X).unwrap();
        let winner = bus.commit(&id, &base, theirs).await.unwrap();

        match bus.commit(&id, &base, ours).await {
            Err(BusError::Conflict { current }) => assert_eq!(*current, winner),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(bus.load_snapshot(&id).await.unwrap(), Some(winner));
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_publish() {
        let backend = MemoryBackend::new();
        let bus = backend.bus();
        let id = game("g1");
        let mut a = bus.subscribe(&id).await.unwrap();
        let mut b = bus.subscribe(&id).await.unwrap();
        assert_eq!(backend.channel().subscriber_count(&id), 2);

        bus.publish_move(&id, 0, 1, Mark::O).await;

        let expected = BusEvent::MoveMade {
            game_id: id.clone(),
            row: 0,
            col: 1,
            by: Mark::O,
        };
        assert_eq!(next_event(&mut a).await, expected);
        assert_eq!(next_event(&mut b).await, expected);
    }

    #[tokio::test]
    async fn test_channels_are_per_game() {
        let backend = MemoryBackend::new();
        let bus = backend.bus();
        let mut g1 = bus.subscribe(&game("g1")).await.unwrap();

        bus.publish_move(&game("g2"), 0, 0, Mark::X).await;
        bus.publish_move(&game("g1"), 1, 1, Mark::X).await;

        assert_eq!(next_event(&mut g1).await.game_id(), &game("g1"));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_is_told() {
        let channel = MemoryChannel::with_capacity(1);
        let id = game("g1");
        let mut stream = channel.subscribe(&id).await.unwrap();

        for row in 0..3 {
            channel
                .publish(&BusEvent::MoveMade {
                    game_id: id.clone(),
                    row,
                    col: 0,
                    by: Mark::X,
                })
                .await
                .unwrap();
        }

        assert_eq!(stream.next().await, Some(Delivery::Lagged { missed: 2 }));
    }

    #[tokio::test]
    async fn test_publish_failure_after_save_reports_committed_state() {
        let backend = MemoryBackend::new();
        let bus = backend.bus();
        let id = game("g1");
        let (base, _) = bus.load_or_create(&id).await.unwrap();

        backend.channel().set_fail_publishes(true);
        let next = validate_and_apply(&base, 0, 0, Mark::X).unwrap();
        match bus.commit(&id, &base, next).await {
            Err(BusError::Unpublished { committed }) => {
                assert_eq!(committed.version, 1);
                assert_eq!(backend.snapshots().get(&id), Some(*committed));
            }
            other => panic!("expected unpublished, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_removed_with_last_subscription() {
        let channel = MemoryChannel::new();
        let id = game("g1");
        let first = channel.subscribe(&id).await.unwrap();
        let second = channel.subscribe(&id).await.unwrap();
        let other = channel.subscribe(&game("g2")).await.unwrap();
        assert_eq!(channel.channel_count(), 2);

        drop(first);
        assert_eq!(channel.subscriber_count(&id), 1);
        drop(second);
        assert_eq!(channel.subscriber_count(&id), 0);
        assert_eq!(channel.channel_count(), 1);

        // Resubscribing builds a fresh channel that still delivers.
        let mut again = channel.subscribe(&id).await.unwrap();
        let event = BusEvent::state_changed(&id, GameSession::new());
        channel.publish(&event).await.unwrap();
        assert_eq!(next_event(&mut again).await, event);

        drop(other);
        drop(again);
        assert_eq!(channel.channel_count(), 0);
    }
}
