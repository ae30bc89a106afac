// Tic-Tac-Toe Session Sync - Server Core
//
// This crate keeps two-player game sessions consistent across several
// stateless server processes that share a message bus and a snapshot store.
// Domains hold the game rules, role claims, auth boundary and the per-process
// session gateway; the kernel holds bus infrastructure.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
