//! Dashboard observer socket
//!
//! Observers get the current receiver list on connect, then every
//! registry change. They may also disconnect receivers, prune offline
//! records, and send manual values.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

use super::AppState;
use crate::protocol::{ClientMessage, ServerMessage};

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

pub async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let limit = state.config.send_timeout();

    // subscribe before the snapshot so no change slips between them
    let mut updates = state.admin.subscribe();
    let snapshot = ServerMessage::ReceiverListUpdated {
        receivers: state.admin.snapshot(),
    };
    if !send(&mut sink, &snapshot, limit).await {
        return;
    }
    tracing::debug!("Dashboard observer attached");

    loop {
        tokio::select! {
            update = updates.recv() => {
                let msg = match update {
                    Ok(change) => ServerMessage::ReceiverListUpdated {
                        receivers: change.receivers.clone(),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Dashboard observer lagged, resending snapshot");
                        ServerMessage::ReceiverListUpdated {
                            receivers: state.admin.snapshot(),
                        }
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send(&mut sink, &msg, limit).await {
                    break;
                }
            }
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if let Some(reply) = handle_command(&state, text.as_str()).await {
                    if !send(&mut sink, &reply, limit).await {
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!("Dashboard observer detached");
}

async fn handle_command(state: &AppState, text: &str) -> Option<ServerMessage> {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::Error {
                message: format!("invalid message: {e}"),
            })
        }
    };

    match msg {
        ClientMessage::DisconnectReceiver { receiver_id } => {
            Some(state.admin.disconnect(&receiver_id).to_message())
        }
        ClientMessage::PruneReceivers => Some(ServerMessage::PruneResult {
            removed: state.admin.prune(),
        }),
        ClientMessage::SendValue { address, value } => {
            match state.publisher.publish(&address, value).await {
                Ok(_) => None,
                Err(e) => Some(ServerMessage::Error {
                    message: e.to_string(),
                }),
            }
        }
        ClientMessage::RegisterReceiver { .. } | ClientMessage::UnregisterReceiver { .. } => {
            Some(ServerMessage::Error {
                message: "receivers must connect to /ws".into(),
            })
        }
    }
}

async fn send(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage, limit: Duration) -> bool {
    let json = match msg.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize dashboard message: {}", e);
            return true;
        }
    };
    matches!(timeout(limit, sink.send(Message::Text(json.into()))).await, Ok(Ok(())))
}
