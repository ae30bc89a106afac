//! A connection driven directly through the gateway, without a socket.

use std::time::Duration;
use tictactoe_core::domains::game::{Board, Mark};
use tictactoe_core::domains::session::{
    Connection, ConnectionHandle, GatewayError, ServerMessage, SessionGateway,
};
use tokio::sync::mpsc;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub struct TestClient {
    pub gateway: SessionGateway,
    pub handle: ConnectionHandle,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl TestClient {
    pub fn new(gateway: SessionGateway, connection: Connection) -> Self {
        Self {
            gateway,
            handle: connection.handle,
            outbound: connection.outbound,
        }
    }

    pub async fn send(&self, text: &str) -> Result<(), GatewayError> {
        self.gateway.handle_message(&self.handle, text).await
    }

    pub async fn play(&self, row: i64, col: i64) -> Result<(), GatewayError> {
        self.send(&format!(r#"{{"type":"move","row":{},"col":{}}}"#, row, col))
            .await
    }

    pub async fn quit(&self) -> Result<(), GatewayError> {
        self.send(r#"{"type":"quit"}"#).await
    }

    pub async fn disconnect(&self) {
        self.gateway.disconnect(&self.handle).await;
    }

    /// Next message, failing the test after a timeout.
    pub async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("Timed out waiting for a server message")
            .expect("Outbound channel closed")
    }

    /// Next message, which must be an `update`.
    pub async fn recv_update(&mut self) -> (Board, Mark) {
        match self.recv().await {
            ServerMessage::Update { board, next_turn } => (board, next_turn),
            other => panic!("expected update, got {:?}", other),
        }
    }

    /// Next message, which must be an `error`.
    pub async fn recv_error(&mut self) -> String {
        match self.recv().await {
            ServerMessage::Error { message } => message,
            other => panic!("expected error, got {:?}", other),
        }
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            messages.push(message);
        }
        messages
    }
}
