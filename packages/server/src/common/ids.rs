//! Typed identifiers for games, participants and local connections.
//!
//! Game ids and identities are opaque strings chosen outside this system
//! (by the bootstrap API and the token issuer). Wrapping them keeps a game id
//! from being passed where an identity was expected.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on opaque id length, keeps bus keys and subjects bounded.
const MAX_ID_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidId {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} is longer than 128 characters")]
    TooLong(&'static str),

    #[error("{0} contains control characters")]
    ControlCharacters(&'static str),
}

fn validate(kind: &'static str, value: &str) -> Result<(), InvalidId> {
    if value.is_empty() {
        return Err(InvalidId::Empty(kind));
    }
    if value.chars().count() > MAX_ID_LEN {
        return Err(InvalidId::TooLong(kind));
    }
    if value.chars().any(char::is_control) {
        return Err(InvalidId::ControlCharacters(kind));
    }
    Ok(())
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(value: impl Into<String>) -> Result<Self, InvalidId> {
                let value = value.into();
                validate($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidId;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

opaque_id!(
    /// Identifier of one game session, shared by every process serving it.
    GameId,
    "game id"
);

opaque_id!(
    /// Participant identity as asserted by a verified credential.
    Identity,
    "identity"
);

/// Process-local handle for one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
