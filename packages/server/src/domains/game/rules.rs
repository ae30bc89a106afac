//! Pure tic-tac-toe rules. No I/O here, just data in and data out.

use thiserror::Error;

use super::models::{Board, EndReason, GameSession, Mark, BOARD_SIZE, CELL_COUNT};

/// Why a move (or quit) was refused. Messages are shown to the player.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveError {
    #[error("Game ended")]
    GameEnded,

    #[error("Not your turn")]
    WrongTurn,

    #[error("Out of bounds")]
    OutOfBounds,

    #[error("Cell occupied")]
    CellOccupied,
}

/// Rows, then columns, then the two diagonals.
const LINES: [[(usize, usize); 3]; 8] = [
    [(0, 0), (0, 1), (0, 2)],
    [(1, 0), (1, 1), (1, 2)],
    [(2, 0), (2, 1), (2, 2)],
    [(0, 0), (1, 0), (2, 0)],
    [(0, 1), (1, 1), (2, 1)],
    [(0, 2), (1, 2), (2, 2)],
    [(0, 0), (1, 1), (2, 2)],
    [(0, 2), (1, 1), (2, 0)],
];

/// First line holding three equal marks, if any.
pub fn winning_line(board: &Board) -> Option<(Mark, [(usize, usize); 3])> {
    LINES.iter().find_map(|line| {
        let [a, b, c] = *line;
        let (a, b, c) = (board.get(a.0, a.1), board.get(b.0, b.1), board.get(c.0, c.1));
        match a {
            Some(mark) if b == a && c == a => Some((mark, *line)),
            _ => None,
        }
    })
}

pub fn check_winner(board: &Board) -> Option<Mark> {
    winning_line(board).map(|(mark, _)| mark)
}

fn cell_index(value: i64) -> Option<usize> {
    usize::try_from(value).ok().filter(|&v| v < BOARD_SIZE)
}

/// Validate a move and return the successor session.
///
/// Checks run in a fixed order (ended, turn, bounds, occupancy) so the same
/// input always produces the same rejection. `version` is left untouched; the
/// replication bus assigns it on commit.
pub fn validate_and_apply(
    session: &GameSession,
    row: i64,
    col: i64,
    mark: Mark,
) -> Result<GameSession, MoveError> {
    if session.ended {
        return Err(MoveError::GameEnded);
    }
    if mark != session.next_turn {
        return Err(MoveError::WrongTurn);
    }
    let (r, c) = match (cell_index(row), cell_index(col)) {
        (Some(r), Some(c)) => (r, c),
        _ => return Err(MoveError::OutOfBounds),
    };
    if session.board.get(r, c).is_some() {
        return Err(MoveError::CellOccupied);
    }

    let mut next = session.clone();
    next.board.0[r][c] = Some(mark);
    // The board is the source of truth; occupied() never exceeds CELL_COUNT.
    next.move_count = next.board.occupied() as u8;

    if let Some(winner) = check_winner(&next.board) {
        next.winner = Some(winner);
        next.ended = true;
    } else if next.move_count == CELL_COUNT {
        next.ended = true;
    } else {
        next.next_turn = mark.other();
    }
    Ok(next)
}

impl GameSession {
    /// Successor in which `by` has walked away from the game.
    pub fn quit(&self, by: Mark) -> Result<GameSession, MoveError> {
        if self.ended {
            return Err(MoveError::GameEnded);
        }
        let mut next = self.clone();
        next.ended = true;
        next.end_reason = Some(EndReason::Quit);
        next.quit_by = Some(by);
        Ok(next)
    }
}
