//! Role registry - who holds X and O in each game
//!
//! Claims are cluster-wide: they live in the bus [`ClaimStore`], so two
//! processes racing for the same role see exactly one winner.
//!
//! [`ClaimStore`]: crate::kernel::bus::ClaimStore

pub mod registry;

pub use registry::{ClaimOutcome, RoleOwners, RoleRegistry};
