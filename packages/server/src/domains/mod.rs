// Business domains
pub mod auth;
pub mod game;
pub mod roles;
pub mod session;
