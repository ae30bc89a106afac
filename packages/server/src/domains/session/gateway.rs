//! Session gateway - one per process.
//!
//! Turns transport connections into game participants: authenticates,
//! claims the role, attaches the connection to the local game slot, and
//! runs moves and quits through the rules engine and the replication bus.
//!
//! Moves and quits are committed to the snapshot store before anything is
//! shown to clients. Local connections learn about a committed state the
//! same way remote ones do, from the game's bus channel, so every process
//! fans out identical messages in version order.

use futures::StreamExt;
use serde_json::json;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, MutexGuard};
use tracing::{debug, info, warn};

use super::errors::GatewayError;
use super::local::{GameSlot, LocalConnection, LocalGames, SlotState};
use super::protocol::{ClientMessage, ServerMessage};
use crate::common::{ConnectionId, GameId, Identity};
use crate::domains::auth::Authenticator;
use crate::domains::game::{validate_and_apply, GameSession, MoveError, Role};
use crate::domains::roles::{ClaimOutcome, RoleRegistry};
use crate::kernel::bus::{BusError, BusEvent, Delivery, EventStream, ReplicationBus};
use crate::kernel::event_sink::{EventSink, GameLogEvent, GameLogKind};

/// Identifies an active connection to the gateway.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub game_id: GameId,
    pub role: Role,
    pub identity: Identity,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    slot: Arc<GameSlot>,
}

impl ConnectionHandle {
    fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("game_id", &self.game_id)
            .field("role", &self.role)
            .field("identity", &self.identity)
            .finish()
    }
}

/// An accepted connection: its handle plus the stream of messages for it.
pub struct Connection {
    pub handle: ConnectionHandle,
    pub outbound: mpsc::UnboundedReceiver<ServerMessage>,
}

#[derive(Clone)]
pub struct SessionGateway {
    bus: ReplicationBus,
    roles: RoleRegistry,
    authenticator: Arc<dyn Authenticator>,
    events: Arc<dyn EventSink>,
    games: LocalGames,
    retry_limit: usize,
}

impl SessionGateway {
    pub fn new(
        bus: ReplicationBus,
        roles: RoleRegistry,
        authenticator: Arc<dyn Authenticator>,
        events: Arc<dyn EventSink>,
        retry_limit: usize,
    ) -> Self {
        Self {
            bus,
            roles,
            authenticator,
            events,
            games: LocalGames::new(),
            retry_limit,
        }
    }

    // =========================================================================
    // Connect
    // =========================================================================

    /// Authenticate, claim the role and join the game.
    ///
    /// On success the first outbound message is an `update` with the current
    /// board. An `Unauthorized` result touches no state at all.
    pub async fn connect(&self, credential: Option<&str>) -> Result<Connection, GatewayError> {
        let principal = self.authenticator.verify(credential).map_err(|e| {
            info!(error = %e, "Rejected unauthenticated connection");
            GatewayError::Unauthorized(e)
        })?;

        let game_id = principal.game_id;
        let role = principal.role;
        let identity = principal.identity;

        match self.roles.claim(&game_id, role, &identity).await? {
            ClaimOutcome::Accepted { first } => {
                debug!(game_id = %game_id, role = %role, first, "Role accepted");
            }
            ClaimOutcome::Rejected { owner } => {
                return Err(GatewayError::RoleConflict { role, owner });
            }
        }

        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = LocalConnection {
            role,
            identity: identity.clone(),
            outbound: tx.clone(),
        };

        let slot = self.attach(&game_id, id, conn).await?;

        info!(
            game_id = %game_id,
            role = %role,
            identity = %identity,
            connection_id = %id,
            "Player connected"
        );

        Ok(Connection {
            handle: ConnectionHandle {
                id,
                game_id,
                role,
                identity,
                outbound: tx,
                slot,
            },
            outbound: rx,
        })
    }

    /// Register the connection in the game's slot, building the slot if this
    /// is the first local connection, and send it the current board.
    async fn attach(
        &self,
        game_id: &GameId,
        id: ConnectionId,
        conn: LocalConnection,
    ) -> Result<Arc<GameSlot>, GatewayError> {
        loop {
            let slot = self.games.open(game_id);
            let mut state = slot.state.lock().await;
            if state.closed {
                // Lost a race with the last disconnect; build anew.
                drop(state);
                self.games.forget(&slot);
                continue;
            }

            // Whoever takes the lock first on a new slot sets it up, whether
            // or not it registered the slot.
            let session = if state.is_initialised() {
                match state.session.clone() {
                    Some(session) => session,
                    None => self.load_session(game_id).await?,
                }
            } else {
                match self.initialise_slot(&slot, &mut state).await {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(game_id = %game_id, error = %e, "Failed to open game");
                        self.games.evict(&slot, &mut state);
                        return Err(e.into());
                    }
                }
            };
            state.remember(&session);
            let _ = conn.outbound.send(ServerMessage::update(&session));
            state.connections.insert(id, conn);
            drop(state);
            return Ok(slot);
        }
    }

    /// Subscribe to the game's channel, then load or create its snapshot.
    ///
    /// Subscribing first means no state committed after the load can be
    /// missed by this process.
    async fn initialise_slot(
        &self,
        slot: &Arc<GameSlot>,
        state: &mut SlotState,
    ) -> Result<GameSession, BusError> {
        let events = self.bus.subscribe(&slot.game_id).await?;
        let listener = tokio::spawn(run_listener(
            Arc::downgrade(slot),
            events,
            self.bus.clone(),
        ));
        state.listener = Some(listener.abort_handle());

        let session = self.load_session(&slot.game_id).await?;
        state.remember(&session);
        // The joiner is about to receive this version directly.
        state.last_broadcast_version = Some(session.version);
        Ok(session)
    }

    async fn load_session(&self, game_id: &GameId) -> Result<GameSession, BusError> {
        let (session, created) = self.bus.load_or_create(game_id).await?;
        if created {
            self.log_created(game_id);
        }
        Ok(session)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Process one inbound message from an active connection.
    ///
    /// Rejections are sent to the sender as an `error` message and also
    /// returned; none of them end the connection.
    pub async fn handle_message(
        &self,
        handle: &ConnectionHandle,
        text: &str,
    ) -> Result<(), GatewayError> {
        let result = match ClientMessage::parse(text) {
            Ok(ClientMessage::Move { row, col }) => self.handle_move(handle, row, col).await,
            Ok(ClientMessage::Quit) => self.handle_quit(handle).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = &result {
            debug!(
                game_id = %handle.game_id,
                connection_id = %handle.id,
                error = %e,
                "Message rejected"
            );
            if let Some(message) = e.client_message() {
                handle.send(ServerMessage::error(message));
            }
        }
        result
    }

    async fn handle_move(
        &self,
        handle: &ConnectionHandle,
        row: i64,
        col: i64,
    ) -> Result<(), GatewayError> {
        let slot = &handle.slot;
        let mut state = slot.state.lock().await;
        if !state.connections.contains_key(&handle.id) {
            warn!(connection_id = %handle.id, "Move from detached connection ignored");
            return Ok(());
        }

        let mut base = self.cached_or_load(&handle.game_id, &mut state).await?;
        let mut attempt = 0;
        let committed = loop {
            let next = match validate_and_apply(&base, row, col, handle.role) {
                Ok(next) => next,
                Err(e) => {
                    self.log_invalid_move(handle, row, col, e);
                    return Err(e.into());
                }
            };

            match self.bus.commit(&handle.game_id, &base, next).await {
                Ok(committed) => {
                    state.remember(&committed);
                    break committed;
                }
                Err(BusError::Conflict { current }) if attempt < self.retry_limit => {
                    attempt += 1;
                    debug!(
                        game_id = %handle.game_id,
                        stored_version = current.version,
                        attempt,
                        "Snapshot moved on, re-validating move"
                    );
                    state.remember(&current);
                    base = *current;
                }
                Err(BusError::Unpublished { committed }) => {
                    // Saved but unannounced: show it locally ourselves.
                    state.fan_out(&committed);
                    break *committed;
                }
                Err(e) => return Err(e.into()),
            }
        };
        drop(state);

        // Coordinates passed the rules engine, so they fit the board.
        let (row, col) = (row as u8, col as u8);
        self.bus
            .publish_move(&handle.game_id, row, col, handle.role)
            .await;
        self.events.record(GameLogEvent::new(
            GameLogKind::Move,
            &handle.game_id,
            Some(handle.role),
            json!({ "row": row, "col": col, "version": committed.version }),
        ));
        Ok(())
    }

    async fn handle_quit(&self, handle: &ConnectionHandle) -> Result<(), GatewayError> {
        let slot = &handle.slot;
        let mut state = slot.state.lock().await;
        if !state.connections.contains_key(&handle.id) {
            warn!(connection_id = %handle.id, "Quit from detached connection ignored");
            return Ok(());
        }

        let mut base = self.cached_or_load(&handle.game_id, &mut state).await?;
        let mut attempt = 0;
        let (committed, published) = loop {
            let next = base.quit(handle.role)?;
            match self.bus.commit(&handle.game_id, &base, next).await {
                Ok(committed) => break (committed, true),
                Err(BusError::Conflict { current }) if attempt < self.retry_limit => {
                    attempt += 1;
                    state.remember(&current);
                    base = *current;
                }
                Err(BusError::Unpublished { committed }) => break (*committed, false),
                Err(e) => return Err(e.into()),
            }
        };

        state.remember(&committed);
        state.send_to(&handle.id, ServerMessage::YouQuit);
        state.broadcast_except(
            &handle.id,
            &ServerMessage::OpponentQuit { by: handle.role },
        );
        state.quit_announced = true;
        if !published {
            state.fan_out(&committed);
        }
        drop(state);

        if let Err(e) = self
            .roles
            .release(&handle.game_id, handle.role, &handle.identity)
            .await
        {
            warn!(game_id = %handle.game_id, role = %handle.role, error = %e, "Failed to release role");
        }

        self.events.record(GameLogEvent::new(
            GameLogKind::Quit,
            &handle.game_id,
            Some(handle.role),
            json!({ "by": handle.role, "version": committed.version }),
        ));
        info!(game_id = %handle.game_id, role = %handle.role, "Player quit");
        Ok(())
    }

    async fn cached_or_load(
        &self,
        game_id: &GameId,
        state: &mut MutexGuard<'_, SlotState>,
    ) -> Result<GameSession, GatewayError> {
        if let Some(session) = &state.session {
            return Ok(session.clone());
        }
        let session = self.load_session(game_id).await?;
        state.remember(&session);
        Ok(session)
    }

    // =========================================================================
    // Disconnect
    // =========================================================================

    /// Detach the connection. The game slot is evicted with its last local
    /// connection; role claims are kept so the player can reconnect.
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        let slot = &handle.slot;
        let mut state = slot.state.lock().await;
        if state.connections.remove(&handle.id).is_none() {
            return;
        }
        info!(
            game_id = %handle.game_id,
            role = %handle.role,
            connection_id = %handle.id,
            "Player disconnected"
        );
        if state.connections.is_empty() && !state.closed {
            self.games.evict(slot, &mut state);
        }
    }

    // =========================================================================
    // Bootstrap and inspection
    // =========================================================================

    /// Create a fresh game if none exists. Returns the stored session and
    /// whether this call created it.
    pub async fn init_game(&self, game_id: &GameId) -> Result<(GameSession, bool), BusError> {
        let (session, created) = self.bus.create_game(game_id).await?;
        if created {
            self.log_created(game_id);
        }
        Ok((session, created))
    }

    /// Cached session of a locally served game.
    pub async fn cached_session(&self, game_id: &GameId) -> Option<GameSession> {
        let slot = self.games.get(game_id)?;
        let state = slot.state.lock().await;
        state.session.clone()
    }

    pub async fn local_connection_count(&self, game_id: &GameId) -> usize {
        match self.games.get(game_id) {
            Some(slot) => slot.state.lock().await.connections.len(),
            None => 0,
        }
    }

    pub fn active_games(&self) -> usize {
        self.games.len()
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn bus(&self) -> &ReplicationBus {
        &self.bus
    }

    // =========================================================================
    // Logging
    // =========================================================================

    fn log_created(&self, game_id: &GameId) {
        info!(game_id = %game_id, "Game created");
        self.events.record(GameLogEvent::new(
            GameLogKind::GameCreated,
            game_id,
            None,
            json!({}),
        ));
    }

    fn log_invalid_move(&self, handle: &ConnectionHandle, row: i64, col: i64, err: MoveError) {
        self.events.record(GameLogEvent::new(
            GameLogKind::InvalidMove,
            &handle.game_id,
            Some(handle.role),
            json!({ "row": row, "col": col, "err": err.to_string() }),
        ));
    }
}

// =============================================================================
// Bus listener
// =============================================================================

/// Apply a game's bus events to its slot until the slot goes away.
async fn run_listener(slot: Weak<GameSlot>, mut events: EventStream, bus: ReplicationBus) {
    while let Some(delivery) = events.next().await {
        let Some(slot) = slot.upgrade() else {
            break;
        };
        let mut state = slot.state.lock().await;
        if state.closed {
            break;
        }

        match delivery {
            Delivery::Event(BusEvent::StateChanged { state: session, .. }) => {
                state.fan_out(&session);
            }
            Delivery::Event(BusEvent::MoveMade { row, col, by, .. }) => {
                debug!(game_id = %slot.game_id, row, col, by = %by, "Move notice");
            }
            Delivery::Lagged { missed } => {
                warn!(game_id = %slot.game_id, missed, "Bus listener lagged, reloading snapshot");
                match bus.load_snapshot(&slot.game_id).await {
                    Ok(Some(session)) => {
                        state.fan_out(&session);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(game_id = %slot.game_id, error = %e, "Snapshot reload failed");
                    }
                }
            }
        }
    }
    debug!("Bus listener stopped");
}
