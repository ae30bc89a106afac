use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::common::{GameId, Identity};
use crate::domains::game::Role;
use crate::kernel::bus::{BusError, ClaimStore, PutOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The identity holds the role. `first` is true when this call created
    /// the claim and false when it already held it (reconnect).
    Accepted { first: bool },
    /// Another identity holds the role.
    Rejected { owner: Identity },
}

/// Current holders of both roles in one game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoleOwners {
    #[serde(rename = "X")]
    pub x: Option<Identity>,
    #[serde(rename = "O")]
    pub o: Option<Identity>,
}

impl RoleOwners {
    pub fn get(&self, role: Role) -> Option<&Identity> {
        match role {
            Role::X => self.x.as_ref(),
            Role::O => self.o.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.o.is_none()
    }
}

#[derive(Clone)]
pub struct RoleRegistry {
    claims: Arc<dyn ClaimStore>,
}

impl RoleRegistry {
    pub fn new(claims: Arc<dyn ClaimStore>) -> Self {
        Self { claims }
    }

    /// Claim `role` in `game_id` for `identity`.
    ///
    /// Idempotent for the holder. Across processes at most one identity ever
    /// wins a role; the loser sees [`ClaimOutcome::Rejected`] with the owner.
    pub async fn claim(
        &self,
        game_id: &GameId,
        role: Role,
        identity: &Identity,
    ) -> Result<ClaimOutcome, BusError> {
        match self.claims.put_if_absent(game_id, role, identity).await? {
            PutOutcome::Inserted => {
                info!(game_id = %game_id, role = %role, identity = %identity, "Role claimed");
                Ok(ClaimOutcome::Accepted { first: true })
            }
            PutOutcome::Held(owner) if owner == *identity => {
                debug!(game_id = %game_id, role = %role, identity = %identity, "Role reclaimed by holder");
                Ok(ClaimOutcome::Accepted { first: false })
            }
            PutOutcome::Held(owner) => {
                info!(
                    game_id = %game_id,
                    role = %role,
                    identity = %identity,
                    owner = %owner,
                    "Role claim rejected"
                );
                Ok(ClaimOutcome::Rejected { owner })
            }
        }
    }

    /// Give up `role` if `identity` holds it. Returns whether a claim was removed.
    pub async fn release(
        &self,
        game_id: &GameId,
        role: Role,
        identity: &Identity,
    ) -> Result<bool, BusError> {
        let released = self.claims.remove_if_held_by(game_id, role, identity).await?;
        if released {
            info!(game_id = %game_id, role = %role, identity = %identity, "Role released");
        }
        Ok(released)
    }

    pub async fn owners(&self, game_id: &GameId) -> Result<RoleOwners, BusError> {
        Ok(RoleOwners {
            x: self.claims.holder(game_id, Role::X).await?,
            o: self.claims.holder(game_id, Role::O).await?,
        })
    }
}
