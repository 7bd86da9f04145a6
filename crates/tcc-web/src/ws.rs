//! WebSocket handler for live store updates

use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use std::sync::Arc;
use tcc_core::store::TraceStore;
use tcc_core::sync::SyncMessage;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const MAX_LOGGED_CHARS: usize = 200;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send(socket: &mut WebSocket, message: &SyncMessage) -> bool {
    match message.to_json() {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode {} message: {}", message.kind(), e);
            true
        }
    }
}

async fn send_store(socket: &mut WebSocket, store: TraceStore) -> bool {
    send(socket, &SyncMessage::InitialStore(store)).await
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    debug!("WebSocket client connected");

    let (store, mut rx) = state.exporter.subscribe_with_snapshot();
    if !send_store(&mut socket, store).await {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(items) => {
                        if !send(&mut socket, &SyncMessage::NewItems(items)).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WebSocket client lagged by {} deltas, resending store", n);
                        let (store, fresh) = state.exporter.subscribe_with_snapshot();
                        rx = fresh;
                        if !send_store(&mut socket, store).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Delta channel closed");
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!("WebSocket client sent: {}", truncate(text.as_str(), MAX_LOGGED_CHARS));
                    }
                    _ => {}
                }
            }
        }
    }

    debug!("WebSocket client disconnected");
}

/// Shorten `text` to `max` characters, marking the cut
fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
