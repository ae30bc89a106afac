// HTTP routes
pub mod auth;
pub mod games;
pub mod health;
pub mod ws;

pub use auth::*;
pub use games::*;
pub use health::*;
pub use ws::*;
