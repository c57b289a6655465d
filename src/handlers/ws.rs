//! Live snapshot stream over WebSocket.
//!
//! Each client gets the most recent snapshot immediately, then one message
//! per publish tick. A client that falls behind skips the snapshots it
//! missed instead of slowing down the publisher.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument};

use crate::state::SharedState;

/// Handler for the /ws endpoint.
#[instrument(skip(state, ws))]
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /ws upgrade");
    ws.on_upgrade(move |socket| stream_snapshots(socket, state))
}

async fn stream_snapshots(mut socket: WebSocket, state: SharedState) {
    let publisher = &state.pipeline.publisher;
    let mut sub = publisher.subscribe();
    info!("Stream client connected ({} total)", publisher.client_count());

    if let Some(latest) = publisher.latest() {
        if socket.send(Message::Text(latest.as_ref().into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = sub.rx.recv() => match msg {
                Ok(json) => {
                    if socket.send(Message::Text(json.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Stream client lagged, skipped {} snapshots", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                // Pings are answered by axum; client text is ignored
                Some(Ok(_)) => {}
            },
        }
    }

    drop(sub);
    info!("Stream client disconnected ({} remaining)", publisher.client_count());
}
