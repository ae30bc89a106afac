//! Session domain - live connections to games
//!
//! [`SessionGateway`] is transport independent: the WebSocket route feeds
//! it credentials and text frames and forwards whatever it queues on each
//! connection's outbound channel.

pub mod errors;
pub mod gateway;
pub mod local;
pub mod protocol;

pub use errors::{close_code, GatewayError, BUSY_MESSAGE};
pub use gateway::{Connection, ConnectionHandle, SessionGateway};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
