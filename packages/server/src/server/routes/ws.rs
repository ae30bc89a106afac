//! WebSocket game endpoint.
//!
//! GET /ws?token=JWT
//!
//! Thin transport over [`SessionGateway`]: text frames go in through
//! `handle_message`, the connection's outbound queue is written back as JSON
//! text frames. Join failures are reported with a close code (4001
//! unauthorized, 4003 role taken, 1011 bus unavailable).

use std::borrow::Cow;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension, Query,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::domains::session::{GatewayError, ServerMessage, SessionGateway};
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    token: Option<String>,
}

pub async fn ws_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let gateway = state.gateway.clone();
    upgrade.on_upgrade(move |socket| serve_socket(socket, gateway, query.token))
}

async fn serve_socket(mut socket: WebSocket, gateway: SessionGateway, token: Option<String>) {
    let connection = match gateway.connect(token.as_deref()).await {
        Ok(connection) => connection,
        Err(e) => {
            reject(&mut socket, &e).await;
            return;
        }
    };

    let handle = connection.handle;
    let mut outbound = connection.outbound;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(Message::Text(message.to_json())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %handle.id, error = %e, "WebSocket read failed");
                break;
            }
        };
        // Rejections are already queued for the client.
        let _ = gateway.handle_message(&handle, &text).await;
    }

    gateway.disconnect(&handle).await;
    writer.abort();
}

/// Report a failed join to the client and close the socket.
async fn reject(socket: &mut WebSocket, err: &GatewayError) {
    info!(error = %err, "Connection rejected");
    if let Some(message) = err.client_message() {
        let _ = socket
            .send(Message::Text(ServerMessage::error(message).to_json()))
            .await;
    }
    let (code, reason) = err.close_frame();
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}
