//! Protocol module - JSON messages exchanged over a game connection
//!
//! Every message is an object tagged by `type`. Clients send `move` and
//! `quit`; the server sends `update`, `win`, `draw`, `you_quit`,
//! `opponent_quit` and `error`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domains::game::{Board, GameSession, Mark};

// ============== Client -> Server Messages ==============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Coordinates are kept signed so out-of-range input reaches the rules
    /// engine and is reported as "Out of bounds".
    Move { row: i64, col: i64 },
    Quit,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Bad JSON")]
    BadJson,

    #[error("Unknown type")]
    UnknownType,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if let Ok(message) = serde_json::from_str::<ClientMessage>(text) {
            return Ok(message);
        }

        // Known type with a broken body is malformed; anything else is an
        // unrecognized type.
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| ProtocolError::BadJson)?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("move") | Some("quit") => Err(ProtocolError::BadJson),
            _ => Err(ProtocolError::UnknownType),
        }
    }
}

// ============== Server -> Client Messages ==============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Update {
        board: Board,
        #[serde(rename = "nextTurn")]
        next_turn: Mark,
    },
    Win {
        winner: Mark,
    },
    Draw,
    YouQuit,
    OpponentQuit {
        by: Mark,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn update(session: &GameSession) -> Self {
        Self::Update {
            board: session.board,
            next_turn: session.next_turn,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Terminal notice for an ended session, `None` while it is in play.
    pub fn outcome(session: &GameSession) -> Option<Self> {
        if !session.ended {
            return None;
        }
        if let Some(winner) = session.winner {
            return Some(Self::Win { winner });
        }
        match session.quit_by {
            Some(by) if session.was_quit() => Some(Self::OpponentQuit { by }),
            _ => Some(Self::Draw),
        }
    }

    pub fn to_json(&self) -> String {
        // Plain enums of strings and arrays; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"type":"error"}"#))
    }
}
