//! Receiver socket driver
//!
//! Each connection gets a reader (this task) and a writer task. The reader
//! turns inbound frames into hub calls; the writer drains the connection's
//! outbound queue onto the socket, pings on a timer, and closes the socket
//! when the hub terminates the session. Whichever side ends first ends the
//! connection, and the hub is told the transport is gone.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use super::AppState;
use crate::hub::{CloseReason, ReceiverId, ReceiverSession, SessionChannels, SessionHandle};
use crate::protocol::{ClientMessage, ServerMessage};

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

pub async fn handle_socket(state: AppState, socket: WebSocket) {
    let (handle, channels) = state.hub.session_channel();
    let (sink, stream) = socket.split();

    let mut writer = tokio::spawn(write_loop(
        sink,
        channels,
        state.config.ping_interval(),
        state.config.send_timeout(),
    ));

    let mut conn = Connection {
        state,
        handle,
        pending: Some(ReceiverSession::new()),
        bound: None,
    };

    let writer_finished = tokio::select! {
        _ = conn.read_loop(stream) => false,
        _ = &mut writer => true,
    };

    if let Some(id) = conn.bound.take() {
        conn.state.hub.handle_disconnect(&id);
    } else if let Some(session) = &conn.pending {
        tracing::debug!(
            elapsed = ?session.connected_at().elapsed(),
            "Socket closed before registering"
        );
    }
    conn.handle.terminate(CloseReason::TransportLoss);

    if !writer_finished {
        let grace = conn.state.config.send_timeout();
        if timeout(grace, &mut writer).await.is_err() {
            writer.abort();
        }
    }
}

struct Connection {
    state: AppState,
    handle: SessionHandle,
    /// Session still `Connecting`; handed to the hub on registration
    pending: Option<ReceiverSession>,
    /// Receiver registered over this socket, if any
    bound: Option<ReceiverId>,
}

impl Connection {
    async fn read_loop(&mut self, mut stream: SplitStream<WebSocket>) {
        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("Receiver socket error: {}", e);
                    break;
                }
            };

            if let Some(id) = &self.bound {
                self.state.hub.touch(id);
            }

            match msg {
                Message::Text(text) => self.on_text(text.as_str()).await,
                Message::Binary(_) => self.reply(ServerMessage::Error {
                    message: "binary frames are not supported".into(),
                }),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    async fn on_text(&mut self, text: &str) {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Unparseable frame: {}", e);
                self.reply(ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                });
                return;
            }
        };

        match msg {
            ClientMessage::RegisterReceiver { name } => self.register(name.as_deref()),
            ClientMessage::UnregisterReceiver { receiver_id } => {
                let result = receiver_id
                    .parse::<ReceiverId>()
                    .map_err(|_| crate::error::RelayError::NotFound(receiver_id.clone()))
                    .and_then(|id| {
                        self.state.hub.unregister(&id, &self.handle)?;
                        Ok(id)
                    });
                match result {
                    Ok(id) => {
                        if self.bound.as_ref() == Some(&id) {
                            self.bound = None;
                            self.pending = Some(ReceiverSession::new());
                        }
                        tracing::info!(receiver_id = %id, "Receiver unregistered");
                        self.reply(ServerMessage::UnregistrationConfirmed {
                            message: "Successfully unregistered".into(),
                        });
                    }
                    Err(e) => self.reply(ServerMessage::UnregistrationFailed {
                        error: e.to_string(),
                    }),
                }
            }
            ClientMessage::DisconnectReceiver { receiver_id } => {
                let ack = self.state.admin.disconnect(&receiver_id);
                self.reply(ack.to_message());
            }
            ClientMessage::PruneReceivers => {
                let removed = self.state.admin.prune();
                self.reply(ServerMessage::PruneResult { removed });
            }
            ClientMessage::SendValue { address, value } => {
                if let Err(e) = self.state.publisher.publish(&address, value).await {
                    self.reply(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    fn register(&mut self, name: Option<&str>) {
        let Some(session) = self.pending.take() else {
            let bound = self
                .bound
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            self.reply(ServerMessage::RegistrationFailed {
                error: format!("connection already registered as {bound}"),
            });
            return;
        };

        match self.state.hub.admit(name, session, self.handle.clone()) {
            Ok(id) => self.bound = Some(id),
            Err(rejected) => {
                tracing::warn!(name = ?name, "Registration rejected: {}", rejected.error);
                self.pending = Some(rejected.session);
                self.reply(ServerMessage::RegistrationFailed {
                    error: rejected.error.to_string(),
                });
            }
        }
    }

    /// Queue a direct reply behind anything already queued.
    fn reply(&self, msg: ServerMessage) {
        match msg.to_json() {
            Ok(json) => {
                if let Err(e) = self.handle.try_deliver(Arc::from(json)) {
                    tracing::debug!(?e, "Dropped reply to receiver socket");
                }
            }
            Err(e) => tracing::error!("Failed to serialize reply: {}", e),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut channels: SessionChannels,
    ping_every: Duration,
    send_timeout: Duration,
) {
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            frame = channels.outbound.recv() => {
                let Some(frame) = frame else { break };
                if !send_bounded(&mut sink, Message::Text(frame.to_string().into()), send_timeout).await {
                    return;
                }
            }
            _ = channels.close.changed() => {
                let reason = (*channels.close.borrow()).unwrap_or(CloseReason::TransportLoss);
                // admin and shutdown notices must reach the receiver before the close
                if matches!(reason, CloseReason::Admin | CloseReason::Shutdown) {
                    while let Ok(frame) = channels.outbound.try_recv() {
                        if !send_bounded(&mut sink, Message::Text(frame.to_string().into()), send_timeout).await {
                            return;
                        }
                    }
                }
                let close = Message::Close(Some(close_frame(reason)));
                let _ = send_bounded(&mut sink, close, send_timeout).await;
                return;
            }
            _ = ping.tick() => {
                if !send_bounded(&mut sink, Message::Ping(Bytes::new()), send_timeout).await {
                    return;
                }
            }
        }
    }
}

async fn send_bounded(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    limit: Duration,
) -> bool {
    match timeout(limit, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!("Receiver socket write failed: {}", e);
            false
        }
        Err(_) => {
            tracing::warn!("Receiver socket write timed out after {:?}", limit);
            false
        }
    }
}

fn close_frame(reason: CloseReason) -> CloseFrame {
    let (code, text) = match reason {
        CloseReason::Admin => (close_code::NORMAL, "disconnected by administrator"),
        CloseReason::Shutdown => (close_code::AWAY, "hub shutting down"),
        CloseReason::Stale => (close_code::POLICY, "no traffic received"),
        CloseReason::SlowConsumer => (close_code::POLICY, "receiver too slow"),
        CloseReason::TransportLoss => (close_code::NORMAL, "connection closed"),
    };
    CloseFrame {
        code,
        reason: text.into(),
    }
}
