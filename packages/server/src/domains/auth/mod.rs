//! Authentication boundary.
//!
//! The gateway only sees [`Authenticator`]: a credential goes in, a
//! [`Principal`] (who, which game, which role) comes out. [`JwtService`] is
//! the production implementation and also issues tokens for the register
//! route.

pub mod errors;
pub mod jwt;

pub use errors::AuthError;
pub use jwt::{Claims, JwtService};

use crate::common::{GameId, Identity};
use crate::domains::game::Role;

/// Verified connection identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub identity: Identity,
    pub game_id: GameId,
    pub role: Role,
}

pub trait Authenticator: Send + Sync {
    /// Verify a credential. `None` means the client presented nothing.
    fn verify(&self, credential: Option<&str>) -> Result<Principal, AuthError>;
}
