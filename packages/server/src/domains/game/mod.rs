//! Game domain - tic-tac-toe data model and rules
//!
//! Everything here is pure: sessions go in, successor sessions come out.
//! Replication and fan-out live in the session domain and the kernel bus.

pub mod models;
pub mod rules;

pub use models::{Board, EndReason, GameSession, InconsistentSession, Mark, Role};
pub use rules::{check_winner, validate_and_apply, winning_line, MoveError};
