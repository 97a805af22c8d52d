//! Receiver-side relay client
//!
//! Registers with a hub, receives relayed events, optionally forwards them
//! to a local OSC device, and reconnects with backoff whenever the
//! connection drops. Every reconnect is a brand-new registration with a new
//! receiver id.
//!
//! The client stops only when asked to ([`RelayClient::stop`], or dropping
//! the client) or when an administrator disconnects it from the hub.

pub mod backoff;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::ClientConfig;
use crate::error::RelayError;
use crate::forward::OscForwarder;
use crate::protocol::{ClientMessage, RelayEvent, ServerMessage};

pub use backoff::Backoff;

const EVENT_TAP_CAPACITY: usize = 256;
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(2);

/// What the client is doing right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Registered { receiver_id: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// The hub administrator disconnected this receiver; restart to rejoin
    ManuallyDisconnected,
    Stopped,
}

impl ClientStatus {
    pub fn is_registered(&self) -> bool {
        matches!(self, ClientStatus::Registered { .. })
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStatus::Connecting => write!(f, "Connecting"),
            ClientStatus::Registered { receiver_id } => write!(f, "Registered as {receiver_id}"),
            ClientStatus::Reconnecting { attempt, delay } => {
                write!(f, "Reconnecting in {:.1}s (attempt {attempt})", delay.as_secs_f64())
            }
            ClientStatus::ManuallyDisconnected => {
                write!(f, "Manually disconnected by server, restart the client to reconnect")
            }
            ClientStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Counters since the client started
#[derive(Debug, Default)]
pub struct ClientStats {
    registrations: AtomicU64,
    received: AtomicU64,
    forwarded: AtomicU64,
    forward_failures: AtomicU64,
}

impl ClientStats {
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn forward_failures(&self) -> u64 {
        self.forward_failures.load(Ordering::Relaxed)
    }
}

struct Shared {
    config: ClientConfig,
    url: Url,
    forwarder: Option<OscForwarder>,
    status: watch::Sender<ClientStatus>,
    events: broadcast::Sender<RelayEvent>,
    stats: ClientStats,
}

impl Shared {
    fn set_status(&self, status: ClientStatus) {
        tracing::debug!(%status, "Client status");
        self.status.send_replace(status);
    }

    /// Deliver one relayed event locally. Never fails the subscription.
    async fn on_event(&self, event: RelayEvent) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(address = %event.address, value = %event.value, "Received event");

        if let Some(forwarder) = &self.forwarder {
            match forwarder.forward(&event.address, &event.value).await {
                Ok(()) => {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(address = %event.address, "Failed to forward event: {}", e);
                }
            }
        }

        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

enum SessionEnd {
    Stopped,
    ManuallyDisconnected,
    Dropped,
}

/// A running receiver. Dropping it stops the background task.
pub struct RelayClient {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Validate `config`, open the local forward socket if configured, and
    /// start connecting in the background.
    ///
    /// Connection failures are not errors here: they feed the reconnect
    /// loop and show up in [`status`](Self::status).
    pub async fn connect(config: ClientConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let url = hub_url(&config.server, config.api_key.as_deref())?;

        let forwarder = match &config.local_forward {
            Some(dest) => {
                let forwarder = OscForwarder::bind(std::slice::from_ref(dest)).await?;
                tracing::info!(destination = %dest, "Forwarding events to local OSC device");
                Some(forwarder)
            }
            None => None,
        };

        let (status, _) = watch::channel(ClientStatus::Connecting);
        let (events, _) = broadcast::channel(EVENT_TAP_CAPACITY);
        let shared = Arc::new(Shared {
            config,
            url,
            forwarder,
            status,
            events,
            stats: ClientStats::default(),
        });

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(shared.clone(), stop_rx));

        Ok(Self { shared, stop, task })
    }

    pub fn status(&self) -> ClientStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.shared.status.subscribe()
    }

    /// Receiver id of the current registration, if registered
    pub fn receiver_id(&self) -> Option<String> {
        match &*self.shared.status.borrow() {
            ClientStatus::Registered { receiver_id } => Some(receiver_id.clone()),
            _ => None,
        }
    }

    /// Tap of every received event
    pub fn events(&self) -> broadcast::Receiver<RelayEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> &ClientStats {
        &self.shared.stats
    }

    /// Wait until the status satisfies `pred`, or give up after `limit`.
    pub async fn wait_for_status(
        &self,
        limit: Duration,
        mut pred: impl FnMut(&ClientStatus) -> bool,
    ) -> Option<ClientStatus> {
        let mut rx = self.watch_status();
        let result = timeout(limit, rx.wait_for(|s| pred(s))).await;
        match result {
            Ok(Ok(status)) => Some(status.clone()),
            _ => None,
        }
    }

    /// Unregister, close the socket and end the reconnect loop.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Relay client task ended abnormally: {}", e);
        }
    }

    /// Wait for the client to end on its own (admin disconnect).
    pub async fn join(self) {
        let Self {
            task, stop: _stop, ..
        } = self;
        if let Err(e) = task.await {
            tracing::warn!("Relay client task ended abnormally: {}", e);
        }
    }
}

async fn run(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(&shared.config.backoff);

    loop {
        if *stop_rx.borrow() {
            break;
        }

        shared.set_status(ClientStatus::Connecting);
        let mut registered = false;
        match session(&shared, &mut stop_rx, &mut registered).await {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::ManuallyDisconnected) => {
                tracing::info!("Received manual disconnect from server");
                shared.set_status(ClientStatus::ManuallyDisconnected);
                return;
            }
            Ok(SessionEnd::Dropped) => {
                tracing::warn!("Disconnected from server");
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(server = %shared.config.server, "Connection attempt failed: {}", e);
            }
            Err(e) => {
                tracing::error!(server = %shared.config.server, category = ?e.category(), "Connection attempt failed: {}", e);
            }
        }

        if registered {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        shared.set_status(ClientStatus::Reconnecting {
            attempt: backoff.attempt(),
            delay,
        });
        tracing::info!("Reconnecting in {:.1}s", delay.as_secs_f64());

        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop_requested(&mut stop_rx) => break,
        }
    }

    shared.set_status(ClientStatus::Stopped);
}

/// One connection: handshake, then relay until it ends.
async fn session(
    shared: &Shared,
    stop_rx: &mut watch::Receiver<bool>,
    registered: &mut bool,
) -> Result<SessionEnd, RelayError> {
    let connect = tokio_tungstenite::connect_async(shared.url.as_str());
    let (ws_stream, _) = tokio::select! {
        result = timeout(shared.config.handshake_timeout(), connect) => result
            .map_err(|_| RelayError::TransportLoss("connect timed out".into()))?
            .map_err(connect_error)?,
        _ = stop_requested(stop_rx) => return Ok(SessionEnd::Stopped),
    };
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    tracing::info!(server = %shared.config.server, "Connected to server, registering as receiver...");
    let register = ClientMessage::RegisterReceiver {
        name: Some(shared.config.name.clone()),
    };
    ws_tx.send(Message::Text(register.to_json()?.into())).await?;

    let receiver_id = tokio::select! {
        result = timeout(shared.config.handshake_timeout(), await_confirmation(&mut ws_rx)) => result
            .map_err(|_| RelayError::TransportLoss("no registration confirmation".into()))??,
        _ = stop_requested(stop_rx) => {
            let _ = timeout(GOODBYE_TIMEOUT, ws_tx.close()).await;
            return Ok(SessionEnd::Stopped);
        }
    };

    *registered = true;
    shared.stats.registrations.fetch_add(1, Ordering::Relaxed);
    tracing::info!(name = %shared.config.name, receiver_id = %receiver_id, "Registered as receiver");
    shared.set_status(ClientStatus::Registered {
        receiver_id: receiver_id.clone(),
    });

    let idle = shared.config.idle_timeout();
    loop {
        tokio::select! {
            _ = stop_requested(stop_rx) => {
                let goodbye = async {
                    let unregister = ClientMessage::UnregisterReceiver { receiver_id: receiver_id.clone() };
                    ws_tx.send(Message::Text(unregister.to_json()?.into())).await?;
                    ws_tx.close().await?;
                    Ok::<_, RelayError>(())
                };
                match timeout(GOODBYE_TIMEOUT, goodbye).await {
                    Ok(Ok(())) => tracing::info!(receiver_id = %receiver_id, "Unregistered from server"),
                    Ok(Err(e)) => tracing::warn!("Failed to unregister cleanly: {}", e),
                    Err(_) => tracing::warn!("Timed out unregistering from server"),
                }
                return Ok(SessionEnd::Stopped);
            }
            frame = timeout(idle, ws_rx.next()) => {
                let msg = match frame {
                    Err(_) => {
                        tracing::warn!("No traffic from server for {:?}", idle);
                        return Ok(SessionEnd::Dropped);
                    }
                    Ok(None) => return Ok(SessionEnd::Dropped),
                    Ok(Some(Err(e))) => return Err(e.into()),
                    Ok(Some(Ok(msg))) => msg,
                };

                match msg {
                    Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(ServerMessage::OscMessage(event)) => shared.on_event(event).await,
                        Ok(ServerMessage::ManualDisconnect { .. }) => {
                            let _ = timeout(GOODBYE_TIMEOUT, ws_tx.close()).await;
                            return Ok(SessionEnd::ManuallyDisconnected);
                        }
                        Ok(ServerMessage::Error { message }) => {
                            tracing::warn!("Server reported an error: {}", message);
                        }
                        Ok(other) => tracing::debug!(?other, "Ignoring server message"),
                        Err(e) => tracing::warn!("Unreadable frame from server: {}", e),
                    },
                    Message::Close(_) => return Ok(SessionEnd::Dropped),
                    // pongs go out automatically on the next read
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
                }
            }
        }
    }
}

async fn await_confirmation<S>(ws_rx: &mut S) -> Result<String, RelayError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_rx.next().await {
        if let Message::Text(text) = msg? {
            match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(ServerMessage::RegistrationConfirmed { receiver_id, .. }) => return Ok(receiver_id),
                Ok(ServerMessage::RegistrationFailed { error }) => {
                    return Err(RelayError::RegistrationFailure(error))
                }
                Ok(other) => tracing::debug!(?other, "Ignoring message before registration"),
                Err(e) => tracing::warn!("Unreadable frame from server: {}", e),
            }
        }
    }
    Err(RelayError::TransportLoss(
        "connection closed during registration".into(),
    ))
}

fn connect_error(err: tokio_tungstenite::tungstenite::Error) -> RelayError {
    use tokio_tungstenite::tungstenite::{http::StatusCode, Error};
    match err {
        Error::Http(response)
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            RelayError::Auth(format!("hub rejected the credential ({})", response.status()))
        }
        other => other.into(),
    }
}

/// Resolves once a stop was requested or the client handle is gone.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Turn a user-supplied hub address into the subscriber socket URL.
///
/// `http(s)://` becomes `ws(s)://`, a bare `host:port` is treated as
/// `ws://`, an empty path becomes `/ws`, and the API key is added as the
/// `api_key` query parameter.
pub fn hub_url(server: &str, api_key: Option<&str>) -> Result<Url, RelayError> {
    let server = server.trim();
    let raw = if server.contains("://") {
        server.to_string()
    } else {
        format!("ws://{server}")
    };
    let mut url = Url::parse(&raw).map_err(|e| RelayError::Config(format!("invalid server url {server:?}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayError::Config(format!(
                "unsupported server scheme {other:?}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::Config(format!("cannot use scheme {scheme} for {server:?}")))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    if let Some(key) = api_key {
        url.query_pairs_mut().append_pair("api_key", key);
    }
    Ok(url)
}
