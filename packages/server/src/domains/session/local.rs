//! Per-process game registry.
//!
//! A [`GameSlot`] exists for every game with at least one local connection.
//! It owns the cached session, the local connection set and the bus
//! listener task. All of that sits behind one async mutex, so the connection
//! path and the listener path never interleave on the same game.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::AbortHandle;
use tracing::debug;

use super::protocol::ServerMessage;
use crate::common::{ConnectionId, GameId, Identity};
use crate::domains::game::{GameSession, Role};

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// One live connection attached to a slot.
#[derive(Debug, Clone)]
pub struct LocalConnection {
    pub role: Role,
    pub identity: Identity,
    pub outbound: Outbound,
}

#[derive(Debug, Default)]
pub struct SlotState {
    /// Latest session this process knows of.
    pub session: Option<GameSession>,
    pub connections: HashMap<ConnectionId, LocalConnection>,
    /// Highest version every local connection has been shown.
    pub last_broadcast_version: Option<u64>,
    /// This process already sent the quit notices for the session.
    pub quit_announced: bool,
    /// Evicted; joiners must build a new slot.
    pub closed: bool,
    pub(crate) listener: Option<AbortHandle>,
}

impl SlotState {
    pub fn send_to(&self, id: &ConnectionId, message: ServerMessage) {
        if let Some(conn) = self.connections.get(id) {
            // A closed receiver means the transport is going away; its
            // disconnect will clean up.
            let _ = conn.outbound.send(message);
        }
    }

    pub fn broadcast(&self, message: &ServerMessage) {
        for conn in self.connections.values() {
            let _ = conn.outbound.send(message.clone());
        }
    }

    pub fn broadcast_except(&self, except: &ConnectionId, message: &ServerMessage) {
        for (id, conn) in &self.connections {
            if id != except {
                let _ = conn.outbound.send(message.clone());
            }
        }
    }

    /// Keep whichever of the cached and given session is newer.
    pub fn remember(&mut self, session: &GameSession) {
        let newer = match &self.session {
            Some(cached) => session.version >= cached.version,
            None => true,
        };
        if newer {
            self.session = Some(session.clone());
        }
    }

    /// Show `session` to every local connection unless they have already
    /// seen this version or a later one.
    ///
    /// Sends `update`, then the terminal notice when the session has ended.
    /// The quit notice goes out at most once per process. Returns whether
    /// anything was sent.
    pub fn fan_out(&mut self, session: &GameSession) -> bool {
        if matches!(self.last_broadcast_version, Some(seen) if session.version <= seen) {
            debug!(version = session.version, "Dropping stale or duplicate state");
            return false;
        }
        self.remember(session);
        self.last_broadcast_version = Some(session.version);

        self.broadcast(&ServerMessage::update(session));
        match ServerMessage::outcome(session) {
            Some(notice @ ServerMessage::OpponentQuit { .. }) => {
                if !self.quit_announced {
                    self.quit_announced = true;
                    self.broadcast(&notice);
                }
            }
            Some(notice) => self.broadcast(&notice),
            None => {}
        }
        true
    }

    /// The bus listener is running and the session was loaded once.
    pub fn is_initialised(&self) -> bool {
        self.listener.is_some()
    }

    fn stop_listener(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }
}

pub struct GameSlot {
    pub game_id: GameId,
    pub state: AsyncMutex<SlotState>,
}

impl GameSlot {
    fn new(game_id: GameId) -> Self {
        Self {
            game_id,
            state: AsyncMutex::new(SlotState::default()),
        }
    }
}

impl Drop for GameSlot {
    fn drop(&mut self) {
        self.state.get_mut().stop_listener();
    }
}

/// Game slots of this process, keyed by game id.
#[derive(Clone, Default)]
pub struct LocalGames {
    slots: Arc<Mutex<HashMap<GameId, Arc<GameSlot>>>>,
}

impl LocalGames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, game_id: &GameId) -> Option<Arc<GameSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(game_id)
            .cloned()
    }

    /// Current slot for `game_id`, registering a new one when there is none.
    ///
    /// A new slot is uninitialised. The first caller to lock it must start
    /// its listener and load the session before unlocking, or call
    /// [`LocalGames::evict`].
    pub fn open(&self, game_id: &GameId) -> Arc<GameSlot> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(game_id.clone())
            .or_insert_with(|| Arc::new(GameSlot::new(game_id.clone())))
            .clone()
    }

    /// Close the slot and forget it. The caller holds the slot's lock.
    pub fn evict(&self, slot: &Arc<GameSlot>, state: &mut SlotState) {
        state.closed = true;
        state.stop_listener();
        state.session = None;
        self.forget(slot);
        debug!(game_id = %slot.game_id, "Evicted local game");
    }

    /// Remove `slot` from the registry if it is still the registered one.
    pub fn forget(&self, slot: &Arc<GameSlot>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(slots.get(&slot.game_id), Some(current) if Arc::ptr_eq(current, slot)) {
            slots.remove(&slot.game_id);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::game::Mark;

    fn connect(state: &mut SlotState) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        state.connections.insert(
            id,
            LocalConnection {
                role: Mark::X,
                identity: Identity::parse("alice").unwrap(),
                outbound: tx,
            },
        );
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_fan_out_drops_stale_versions() {
        let mut state = SlotState::default();
        let (_, mut rx) = connect(&mut state);

        let mut v2 = GameSession::new();
        v2.version = 2;
        let mut v1 = GameSession::new();
        v1.version = 1;

        assert!(state.fan_out(&v2));
        assert!(!state.fan_out(&v2));
        assert!(!state.fan_out(&v1));
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(state.session.as_ref().map(|s| s.version), Some(2));
    }

    #[test]
    fn test_quit_notice_sent_once() {
        let mut state = SlotState::default();
        let (_, mut rx) = connect(&mut state);

        let mut quit = GameSession::new().quit(Mark::O).unwrap();
        quit.version = 1;
        state.fan_out(&quit);
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::update(&quit),
                ServerMessage::OpponentQuit { by: Mark::O }
            ]
        );

        state.quit_announced = true;
        let mut again = quit.clone();
        again.version = 2;
        state.fan_out(&again);
        assert_eq!(drain(&mut rx), vec![ServerMessage::update(&again)]);
    }

    #[test]
    fn test_remember_keeps_newest() {
        let mut state = SlotState::default();
        let mut newer = GameSession::new();
        newer.version = 3;
        state.remember(&newer);
        state.remember(&GameSession::new());
        assert_eq!(state.session.map(|s| s.version), Some(3));
    }

    #[tokio::test]
    async fn test_open_and_evict() {
        let games = LocalGames::new();
        let game_id = GameId::parse("g1").unwrap();

        let slot = games.open(&game_id);
        assert!(Arc::ptr_eq(&slot, &games.open(&game_id)));
        assert_eq!(games.len(), 1);

        let mut state = slot.state.lock().await;
        assert!(!state.is_initialised());
        games.evict(&slot, &mut state);
        assert!(state.closed);
        assert!(games.is_empty());

        // A later open builds a new slot.
        drop(state);
        assert!(!Arc::ptr_eq(&slot, &games.open(&game_id)));
    }
}
