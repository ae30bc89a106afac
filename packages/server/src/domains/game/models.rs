//! Game session data model.
//!
//! The JSON shape is the snapshot record shared with the bootstrap API, so
//! field names follow that record (`moves`, `reason`, `by`) rather than the
//! Rust names.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::rules::check_winner;

/// A player's mark. Each of the two roles in a game plays one mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mark {
    X,
    O,
}

/// Roles are the two fixed participant slots; each owns one mark.
pub type Role = Mark;

impl Mark {
    pub const ALL: [Mark; 2] = [Mark::X, Mark::O];

    pub fn other(self) -> Mark {
        match self {
            Mark::X => Mark::O,
            Mark::O => Mark::X,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mark::X => "X",
            Mark::O => "O",
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mark {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "X" => Ok(Mark::X),
            "O" => Ok(Mark::O),
            other => Err(format!("invalid role '{}', expected X or O", other)),
        }
    }
}

pub const BOARD_SIZE: usize = 3;
pub const CELL_COUNT: u8 = (BOARD_SIZE * BOARD_SIZE) as u8;

/// 3x3 grid, serialized as rows of `""`, `"X"` or `"O"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Board(pub [[Option<Mark>; BOARD_SIZE]; BOARD_SIZE]);

impl Board {
    pub fn get(&self, row: usize, col: usize) -> Option<Mark> {
        self.0[row][col]
    }

    pub fn occupied(&self) -> usize {
        self.0.iter().flatten().filter(|cell| cell.is_some()).count()
    }
}

impl Serialize for Board {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut rows = serializer.serialize_seq(Some(BOARD_SIZE))?;
        for row in &self.0 {
            let cells: [&str; BOARD_SIZE] =
                std::array::from_fn(|c| row[c].map(Mark::as_str).unwrap_or(""));
            rows.serialize_element(&cells)?;
        }
        rows.end()
    }
}

impl<'de> Deserialize<'de> for Board {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = <[[String; BOARD_SIZE]; BOARD_SIZE]>::deserialize(deserializer)?;
        let mut board = Board::default();
        for (r, row) in raw.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                board.0[r][c] = match cell.as_str() {
                    "" => None,
                    "X" => Some(Mark::X),
                    "O" => Some(Mark::O),
                    _ => return Err(serde::de::Error::custom("invalid board cell")),
                };
            }
        }
        Ok(board)
    }
}

/// Why a game ended when it was not decided on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Quit,
}

/// A decoded session whose fields contradict its board.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InconsistentSession {
    #[error("moves is {moves} but {occupied} cells are occupied")]
    MoveCount { moves: u8, occupied: usize },

    #[error("winner does not match the board")]
    Winner,

    #[error("ended flag does not match the board")]
    Ended,
}

/// Authoritative game state. Each process caches one per active game; the
/// snapshot store holds the latest committed copy.
///
/// Decoding checks the record against its board, see [`GameSession::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SessionRecord")]
pub struct GameSession {
    pub board: Board,
    #[serde(rename = "nextTurn")]
    pub next_turn: Mark,
    pub winner: Option<Mark>,
    pub ended: bool,
    #[serde(rename = "moves")]
    pub move_count: u8,
    #[serde(rename = "reason", default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(rename = "by", default, skip_serializing_if = "Option::is_none")]
    pub quit_by: Option<Mark>,
    /// Replication version; records written before versioning read as 0.
    #[serde(default)]
    pub version: u64,
}

impl GameSession {
    /// Fresh game: empty board, X to move.
    pub fn new() -> Self {
        Self {
            board: Board::default(),
            next_turn: Mark::X,
            winner: None,
            ended: false,
            move_count: 0,
            end_reason: None,
            quit_by: None,
            version: 0,
        }
    }

    pub fn is_draw(&self) -> bool {
        self.ended && self.winner.is_none() && self.end_reason.is_none()
    }

    pub fn was_quit(&self) -> bool {
        self.end_reason == Some(EndReason::Quit)
    }

    /// Verify that the move count, winner and ended flag follow from the
    /// board. Every session produced by the rules passes.
    pub fn check(&self) -> Result<(), InconsistentSession> {
        let occupied = self.board.occupied();
        if usize::from(self.move_count) != occupied {
            return Err(InconsistentSession::MoveCount {
                moves: self.move_count,
                occupied,
            });
        }
        let line_winner = check_winner(&self.board);
        if self.winner != line_winner {
            return Err(InconsistentSession::Winner);
        }
        let finished = line_winner.is_some()
            || occupied == usize::from(CELL_COUNT)
            || self.was_quit();
        if self.ended != finished {
            return Err(InconsistentSession::Ended);
        }
        Ok(())
    }
}

/// Wire form of [`GameSession`], checked before it becomes one.
#[derive(Deserialize)]
struct SessionRecord {
    board: Board,
    #[serde(rename = "nextTurn")]
    next_turn: Mark,
    winner: Option<Mark>,
    ended: bool,
    moves: u8,
    #[serde(default)]
    reason: Option<EndReason>,
    #[serde(default)]
    by: Option<Mark>,
    #[serde(default)]
    version: u64,
}

impl TryFrom<SessionRecord> for GameSession {
    type Error = InconsistentSession;

    fn try_from(record: SessionRecord) -> Result<Self, Self::Error> {
        let session = GameSession {
            board: record.board,
            next_turn: record.next_turn,
            winner: record.winner,
            ended: record.ended,
            move_count: record.moves,
            end_reason: record.reason,
            quit_by: record.by,
            version: record.version,
        };
        session.check()?;
        Ok(session)
    }
}

impl Default for GameSession {
    fn default() -> Self {
        Self::new()
    }
}
