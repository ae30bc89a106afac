//! NATS replication backend.
//!
//! - Channel: core NATS subject per game (`{prefix}.{encoded id}`). Every
//!   process subscribed to the subject, the publisher included, receives
//!   each message. Publishes are flushed before returning.
//! - Snapshots and claims: JetStream key-value buckets. `create` only
//!   succeeds when the key has no live value and `update` only when the
//!   caller's revision is current, which gives the atomic claim and the
//!   snapshot compare-and-set without a coordinator.
//!
//! Core NATS drops messages for a slow consumer without telling the
//! subscription. The connection reports it as an event, which every open
//! subscription then yields as [`Delivery::Lagged`] so listeners reload the
//! snapshot.

use anyhow::{Context, Result};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use super::keys::{channel_subject, claim_key, snapshot_key};
use super::{
    check_base_version, BusError, BusEvent, ClaimStore, CreateOutcome, Delivery, EventChannel,
    EventStream, PutOutcome, ReplicationBus, SnapshotStore,
};
use crate::common::{GameId, Identity};
use crate::config::Config;
use crate::domains::game::{GameSession, Role};

/// Claims race between a failed `create` and the follow-up read when the
/// holder deletes in between; bounded so a flapping key cannot spin forever.
const CLAIM_ATTEMPTS: usize = 3;

/// Slow-consumer notices buffered per subscription; extra ones collapse into
/// a lag of the notice stream itself, which reads the same.
const LAG_NOTICE_CAPACITY: usize = 16;

/// Connected NATS backend.
pub struct NatsBackend {
    pub snapshots: NatsSnapshotStore,
    pub channel: NatsChannel,
    pub claims: NatsClaimStore,
}

impl NatsBackend {
    pub async fn connect(config: &Config) -> Result<Self> {
        info!(url = %config.nats_url, "Connecting to NATS");
        let (lag_notices, _) = broadcast::channel(LAG_NOTICE_CAPACITY);
        let notices = lag_notices.clone();
        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let notices = notices.clone();
                async move { on_connection_event(event, &notices) }
            })
            .connect(&config.nats_url)
            .await
            .context("Failed to connect to NATS")?;
        let js = jetstream::new(client.clone());

        let snapshots = open_bucket(&js, &config.snapshot_bucket).await?;
        let claims = open_bucket(&js, &config.claims_bucket).await?;
        info!(
            snapshot_bucket = %config.snapshot_bucket,
            claims_bucket = %config.claims_bucket,
            "NATS key-value buckets ready"
        );

        Ok(Self {
            snapshots: NatsSnapshotStore { kv: snapshots },
            channel: NatsChannel {
                client,
                prefix: config.channel_prefix.clone(),
                lag_notices,
            },
            claims: NatsClaimStore { kv: claims },
        })
    }

    pub fn into_parts(self) -> (ReplicationBus, std::sync::Arc<dyn ClaimStore>) {
        let bus = ReplicationBus::new(
            std::sync::Arc::new(self.snapshots),
            std::sync::Arc::new(self.channel),
        );
        (bus, std::sync::Arc::new(self.claims))
    }
}

fn on_connection_event(event: async_nats::Event, lag_notices: &broadcast::Sender<()>) {
    match event {
        async_nats::Event::SlowConsumer(sid) => {
            warn!(sid, "NATS dropped messages for a slow subscription");
            // No receivers just means no subscription is open.
            let _ = lag_notices.send(());
        }
        other => info!(event = ?other, "NATS connection event"),
    }
}

/// Merge a subscription's deliveries with the connection's slow-consumer
/// notices. NATS does not say how many messages went missing.
fn with_lag_notices(
    deliveries: impl Stream<Item = Delivery> + Send + 'static,
    notices: broadcast::Receiver<()>,
) -> EventStream {
    let lags = BroadcastStream::new(notices).map(|_| Delivery::Lagged { missed: 0 });
    futures::stream::select(deliveries, lags).boxed()
}

/// Open a bucket, creating it on first use. Another process may win the
/// creation race, so a failed create falls back to opening again.
async fn open_bucket(js: &jetstream::Context, bucket: &str) -> Result<kv::Store> {
    if let Ok(store) = js.get_key_value(bucket).await {
        return Ok(store);
    }
    let created = js
        .create_key_value(kv::Config {
            bucket: bucket.to_string(),
            history: 1,
            ..Default::default()
        })
        .await;
    match created {
        Ok(store) => Ok(store),
        Err(e) => js
            .get_key_value(bucket)
            .await
            .with_context(|| format!("Failed to open key-value bucket {} ({})", bucket, e)),
    }
}

/// Live value and revision of a key; delete markers read as absent.
async fn live_entry(store: &kv::Store, key: &str) -> Result<Option<(Bytes, u64)>, BusError> {
    let entry = store.entry(key).await.map_err(BusError::unavailable)?;
    Ok(entry
        .filter(|e| e.operation == kv::Operation::Put)
        .map(|e| (e.value, e.revision)))
}

fn decode_session(raw: &[u8]) -> Result<GameSession, BusError> {
    Ok(serde_json::from_slice(raw)?)
}

fn decode_identity(raw: &[u8]) -> Result<Identity, BusError> {
    let text = std::str::from_utf8(raw).map_err(BusError::unavailable)?;
    Identity::parse(text).map_err(BusError::unavailable)
}

// =============================================================================
// Snapshots
// =============================================================================

pub struct NatsSnapshotStore {
    kv: kv::Store,
}

#[async_trait]
impl SnapshotStore for NatsSnapshotStore {
    async fn load(&self, game_id: &GameId) -> Result<Option<GameSession>, BusError> {
        match live_entry(&self.kv, &snapshot_key(game_id)).await? {
            Some((raw, _)) => Ok(Some(decode_session(&raw)?)),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        game_id: &GameId,
        session: &GameSession,
    ) -> Result<CreateOutcome, BusError> {
        let key = snapshot_key(game_id);
        let payload = Bytes::from(serde_json::to_vec(session)?);
        match self.kv.create(&key, payload).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(create_err) => match live_entry(&self.kv, &key).await? {
                Some((raw, _)) => Ok(CreateOutcome::Exists(decode_session(&raw)?)),
                None => Err(BusError::unavailable(create_err)),
            },
        }
    }

    async fn save(&self, game_id: &GameId, session: &GameSession) -> Result<(), BusError> {
        let key = snapshot_key(game_id);
        let payload = Bytes::from(serde_json::to_vec(session)?);

        let Some((raw, revision)) = live_entry(&self.kv, &key).await? else {
            return match self.kv.create(&key, payload).await {
                Ok(_) => Ok(()),
                Err(create_err) => match self.load(game_id).await? {
                    Some(current) => Err(BusError::Conflict {
                        current: Box::new(current),
                    }),
                    None => Err(BusError::unavailable(create_err)),
                },
            };
        };

        let stored = decode_session(&raw)?;
        check_base_version(Some(&stored), session)?;

        match self.kv.update(&key, payload, revision).await {
            Ok(_) => Ok(()),
            Err(update_err) => match live_entry(&self.kv, &key).await? {
                // Someone wrote between our read and our update.
                Some((raw, current_revision)) if current_revision != revision => {
                    Err(BusError::Conflict {
                        current: Box::new(decode_session(&raw)?),
                    })
                }
                _ => Err(BusError::unavailable(update_err)),
            },
        }
    }
}

// =============================================================================
// Channel
// =============================================================================

pub struct NatsChannel {
    client: async_nats::Client,
    prefix: String,
    lag_notices: broadcast::Sender<()>,
}

#[async_trait]
impl EventChannel for NatsChannel {
    async fn publish(&self, event: &BusEvent) -> Result<(), BusError> {
        let subject = channel_subject(&self.prefix, event.game_id());
        let payload = Bytes::from(serde_json::to_vec(event)?);
        self.client
            .publish(subject, payload)
            .await
            .map_err(BusError::unavailable)?;
        self.client.flush().await.map_err(BusError::unavailable)?;
        Ok(())
    }

    async fn subscribe(&self, game_id: &GameId) -> Result<EventStream, BusError> {
        let subject = channel_subject(&self.prefix, game_id);
        let notices = self.lag_notices.subscribe();
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(BusError::unavailable)?;

        let stream = subscriber.filter_map(move |message| {
            let subject = subject.clone();
            async move {
                match serde_json::from_slice::<BusEvent>(&message.payload) {
                    Ok(event) => Some(Delivery::Event(event)),
                    Err(e) => {
                        warn!(subject = %subject, error = %e, "Dropping undecodable bus message");
                        None
                    }
                }
            }
        });
        Ok(with_lag_notices(stream, notices))
    }
}

// =============================================================================
// Claims
// =============================================================================

pub struct NatsClaimStore {
    kv: kv::Store,
}

#[async_trait]
impl ClaimStore for NatsClaimStore {
    async fn put_if_absent(
        &self,
        game_id: &GameId,
        role: Role,
        identity: &Identity,
    ) -> Result<PutOutcome, BusError> {
        let key = claim_key(game_id, role);
        let mut last_err = None;
        for _ in 0..CLAIM_ATTEMPTS {
            let payload = Bytes::from(identity.as_str().to_string());
            match self.kv.create(&key, payload).await {
                Ok(_) => return Ok(PutOutcome::Inserted),
                Err(e) => {
                    if let Some((raw, _)) = live_entry(&self.kv, &key).await? {
                        return Ok(PutOutcome::Held(decode_identity(&raw)?));
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(BusError::unavailable(anyhow::anyhow!(
            "claim {} kept failing: {:?}",
            key,
            last_err
        )))
    }

    async fn holder(&self, game_id: &GameId, role: Role) -> Result<Option<Identity>, BusError> {
        match live_entry(&self.kv, &claim_key(game_id, role)).await? {
            Some((raw, _)) => Ok(Some(decode_identity(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove_if_held_by(
        &self,
        game_id: &GameId,
        role: Role,
        identity: &Identity,
    ) -> Result<bool, BusError> {
        let key = claim_key(game_id, role);
        let Some((raw, revision)) = live_entry(&self.kv, &key).await? else {
            return Ok(false);
        };
        if decode_identity(&raw)? != *identity {
            return Ok(false);
        }
        match self.kv.delete_expect_revision(&key, Some(revision)).await {
            Ok(()) => Ok(true),
            Err(delete_err) => match live_entry(&self.kv, &key).await? {
                Some((_, current)) if current == revision => {
                    Err(BusError::unavailable(delete_err))
                }
                // Changed hands or vanished in between; not ours to remove.
                _ => Ok(false),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slow_consumer_event_surfaces_as_lag() {
        let (lag_notices, _) = broadcast::channel(LAG_NOTICE_CAPACITY);
        let mut stream = with_lag_notices(futures::stream::pending(), lag_notices.subscribe());

        on_connection_event(async_nats::Event::Connected, &lag_notices);
        on_connection_event(async_nats::Event::SlowConsumer(7), &lag_notices);

        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert_eq!(delivery, Some(Delivery::Lagged { missed: 0 }));
    }

    #[tokio::test]
    async fn test_events_pass_through_alongside_notices() {
        let (lag_notices, _) = broadcast::channel(LAG_NOTICE_CAPACITY);
        let event = BusEvent::state_changed(&GameId::parse("g1").unwrap(), GameSession::new());
        let deliveries = futures::stream::iter(vec![Delivery::Event(event.clone())]);
        let mut stream = with_lag_notices(deliveries, lag_notices.subscribe());

        assert_eq!(stream.next().await, Some(Delivery::Event(event)));
    }
}
