//! Structured game event log.
//!
//! The gateway reports every game-level occurrence here. Production writes
//! them through `tracing`; tests record them for inspection.

use serde::Serialize;
use serde_json::Value;
use std::sync::RwLock;
use tracing::info;

use crate::common::GameId;
use crate::domains::game::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameLogKind {
    GameCreated,
    Move,
    InvalidMove,
    Quit,
}

impl GameLogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GameCreated => "game-created",
            Self::Move => "move",
            Self::InvalidMove => "invalid-move",
            Self::Quit => "quit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameLogEvent {
    pub event: GameLogKind,
    pub game_id: GameId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub detail: Value,
}

impl GameLogEvent {
    pub fn new(event: GameLogKind, game_id: &GameId, role: Option<Role>, detail: Value) -> Self {
        Self {
            event,
            game_id: game_id.clone(),
            role,
            detail,
        }
    }
}

/// Receives game events. Must not block; called with per-game state locked.
pub trait EventSink: Send + Sync {
    fn record(&self, event: GameLogEvent);
}

/// Writes events as structured `tracing` records.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: GameLogEvent) {
        info!(
            event = event.event.as_str(),
            game_id = %event.game_id,
            role = event.role.map(|r| r.as_str()),
            detail = %event.detail,
            "game event"
        );
    }
}

/// Keeps every event in memory for assertions.
#[derive(Default)]
pub struct RecordingEventSink {
    events: RwLock<Vec<GameLogEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GameLogEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events_of(&self, kind: GameLogKind) -> Vec<GameLogEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.event == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: GameLogKind) -> usize {
        self.events_of(kind).len()
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, event: GameLogEvent) {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::game::Mark;
    use serde_json::json;

    #[test]
    fn test_event_serializes_with_kebab_kind() {
        let game_id = GameId::parse("g1").unwrap();
        let event = GameLogEvent::new(
            GameLogKind::InvalidMove,
            &game_id,
            Some(Mark::O),
            json!({"reason": "Not your turn"}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "invalid-move");
        assert_eq!(value["gameId"], "g1");
        assert_eq!(value["role"], "O");
    }

    #[test]
    fn test_recording_sink_filters_by_kind() {
        let sink = RecordingEventSink::new();
        let game_id = GameId::parse("g1").unwrap();
        sink.record(GameLogEvent::new(GameLogKind::GameCreated, &game_id, None, json!({})));
        sink.record(GameLogEvent::new(GameLogKind::Move, &game_id, Some(Mark::X), json!({})));
        sink.record(GameLogEvent::new(GameLogKind::Move, &game_id, Some(Mark::O), json!({})));

        assert_eq!(sink.count(GameLogKind::Move), 2);
        assert_eq!(sink.count(GameLogKind::Quit), 0);
        assert_eq!(sink.events().len(), 3);

        sink.clear();
        assert!(sink.events().is_empty());
    }
}
