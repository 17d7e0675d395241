//! The `/ws/hotreload` endpoint.
//!
//! Protocol: the server pushes JSON text events; the only client-to-server
//! message honored is the literal text `ping`, answered with `pong`.
//! Everything else is ignored. Normal shutdown closes with status 1000.

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::reload::ClientMessage;
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut outgoing) = state.hub.register();

    // Outgoing loop: drains the hub's per-client queue. The queue sender
    // disappearing (eviction or hub shutdown) ends the loop with a normal
    // close.
    let send_task = tokio::spawn(async move {
        loop {
            match outgoing.recv().await {
                Some(ClientMessage::Event(frame)) => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                Some(ClientMessage::Pong) => {
                    if sender
                        .send(Message::Text(Utf8Bytes::from_static("pong")))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Some(ClientMessage::Close) | None => break,
            }
        }
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static("shutting down"),
            })))
            .await;
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if text.as_str().trim() == "ping" {
                    state.hub.pong(client_id);
                }
                // All other client messages are ignored.
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(client = %client_id, %error, "websocket receive error");
                break;
            }
        }
    }

    state.hub.unregister(client_id);
    let _ = send_task.await;
}
