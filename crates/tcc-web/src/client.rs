//! Observer side of the sync protocol
//!
//! Connects to a running sensor's `/ws` endpoint and keeps a mirror of its
//! store up to date.

use futures_util::{SinkExt, StreamExt};
use std::ops::ControlFlow;
use tcc_core::sync::StoreMirror;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Mirror the store at `url`, calling `on_update` after every applied
/// message. Returns when the server closes the connection or the callback
/// breaks.
pub async fn watch<F>(url: &str, mut on_update: F) -> anyhow::Result<StoreMirror>
where
    F: FnMut(&StoreMirror) -> ControlFlow<()>,
{
    let (mut stream, _) = connect_async(url).await?;
    info!("Connected to {}", url);

    let mut mirror = StoreMirror::new();
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                if let Err(e) = mirror.apply_text(&text) {
                    warn!("Ignoring sync message: {}", e);
                    continue;
                }
                if on_update(&mirror).is_break() {
                    let _ = stream.close(None).await;
                    break;
                }
            }
            Message::Ping(data) => stream.send(Message::Pong(data)).await?,
            Message::Close(_) => {
                debug!("Server closed the connection");
                break;
            }
            _ => {}
        }
    }

    Ok(mirror)
}
