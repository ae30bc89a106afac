use thiserror::Error;

use super::protocol::ProtocolError;
use crate::common::Identity;
use crate::domains::auth::AuthError;
use crate::domains::game::{MoveError, Role};
use crate::kernel::bus::BusError;

/// Shown to the sender whenever the bus rejects an operation.
pub const BUSY_MESSAGE: &str = "Server busy, try again";

/// WebSocket close codes used by the gateway.
pub mod close_code {
    pub const UNAUTHORIZED: u16 = 4001;
    pub const ROLE_TAKEN: u16 = 4003;
    /// Standard "internal error" code, used when the bus fails during join.
    pub const INTERNAL: u16 = 1011;
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Role {role} already taken by {owner}")]
    RoleConflict { role: Role, owner: Identity },

    #[error("Invalid move: {0}")]
    InvalidMove(#[from] MoveError),

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] ProtocolError),

    #[error("Bus unavailable: {0}")]
    BusUnavailable(#[from] BusError),
}

impl GatewayError {
    /// Fatal errors end the connection; the rest only reject one message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::RoleConflict { .. })
    }

    /// Text of the `error` message sent to the client, if any.
    pub fn client_message(&self) -> Option<String> {
        match self {
            Self::Unauthorized(_) => None,
            Self::RoleConflict { role, .. } => {
                Some(format!("Role {} already taken by another player", role))
            }
            Self::InvalidMove(e) => Some(e.to_string()),
            Self::MalformedMessage(e) => Some(e.to_string()),
            Self::BusUnavailable(_) => Some(BUSY_MESSAGE.to_string()),
        }
    }

    /// Close frame for errors raised while joining.
    pub fn close_frame(&self) -> (u16, &'static str) {
        match self {
            Self::Unauthorized(_) => (close_code::UNAUTHORIZED, "Unauthorized"),
            Self::RoleConflict { .. } => (close_code::ROLE_TAKEN, "Role already taken"),
            _ => (close_code::INTERNAL, "Server busy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::game::Mark;

    #[test]
    fn test_fatal_classification() {
        assert!(GatewayError::Unauthorized(AuthError::InvalidToken).is_fatal());
        assert!(GatewayError::RoleConflict {
            role: Mark::X,
            owner: Identity::parse("alice").unwrap(),
        }
        .is_fatal());
        assert!(!GatewayError::InvalidMove(MoveError::WrongTurn).is_fatal());
        assert!(!GatewayError::MalformedMessage(ProtocolError::BadJson).is_fatal());
    }

    #[test]
    fn test_client_messages() {
        assert_eq!(
            GatewayError::Unauthorized(AuthError::MissingCredential).client_message(),
            None
        );
        assert_eq!(
            GatewayError::InvalidMove(MoveError::CellOccupied)
                .client_message()
                .as_deref(),
            Some("Cell occupied")
        );
        assert_eq!(
            GatewayError::RoleConflict {
                role: Mark::O,
                owner: Identity::parse("bob").unwrap(),
            }
            .client_message()
            .as_deref(),
            Some("Role O already taken by another player")
        );
        assert_eq!(
            GatewayError::MalformedMessage(ProtocolError::UnknownType)
                .client_message()
                .as_deref(),
            Some("Unknown type")
        );
    }

    #[test]
    fn test_close_frames() {
        assert_eq!(
            GatewayError::Unauthorized(AuthError::InvalidToken).close_frame(),
            (4001, "Unauthorized")
        );
        assert_eq!(
            GatewayError::RoleConflict {
                role: Mark::X,
                owner: Identity::parse("alice").unwrap(),
            }
            .close_frame(),
            (4003, "Role already taken")
        );
    }
}
