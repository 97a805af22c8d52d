//! Relay hub
//!
//! The hub owns the process-wide receiver registry and fans published events
//! out to every active receiver. All registry mutations go through one
//! `parking_lot::Mutex`; no `.await` ever happens while it is held, so
//! transport tasks, the reaper and publishers can all call in concurrently.
//!
//! Fan-out never waits on a socket. Each receiver has a bounded outbound
//! queue drained by its own writer task; a full queue means the receiver is
//! not keeping up, and it is marked Offline on the spot.

pub mod registry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::RelayError;
use crate::protocol::{RelayEvent, ServerMessage};

pub use registry::{ReceiverId, ReceiverRecord, ReceiverStatus, ReceiverSummary};
pub use session::{
    CloseReason, DeliveryError, InvalidTransition, ReceiverSession, SessionChannels,
    SessionHandle, SessionState,
};

use registry::{Entry, Registry};

/// Default per-receiver outbound queue depth
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Longest accepted receiver display name, in characters
pub const MAX_NAME_LEN: usize = 128;

const OBSERVER_CAPACITY: usize = 64;

/// Registry-changed notification pushed to dashboard observers
#[derive(Debug, Clone)]
pub struct RegistryChanged {
    pub receivers: Vec<ReceiverSummary>,
}

impl RegistryChanged {
    pub fn connected(&self) -> bool {
        self.receivers.iter().any(|r| r.active)
    }
}

/// Result of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Receivers the event was queued for
    pub delivered: Vec<ReceiverId>,
    /// Receivers dropped to Offline because their queue was full or closed
    pub dropped: Vec<ReceiverId>,
}

/// Registration refused. The session comes back untouched so the
/// connection can try again.
#[derive(Debug)]
pub struct RegistrationRejected {
    pub error: RelayError,
    pub session: ReceiverSession,
}

/// Outcome of an administrator disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOutcome {
    Disconnected,
    AlreadyOffline,
}

pub struct RelayHub {
    registry: Mutex<Registry>,
    observers: broadcast::Sender<Arc<RegistryChanged>>,
    queue_capacity: usize,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            registry: Mutex::new(Registry::default()),
            observers,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Outbound queue depth to use for new transport handles
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Create a transport handle sized for this hub
    pub fn session_channel(&self) -> (SessionHandle, SessionChannels) {
        SessionHandle::channel(self.queue_capacity)
    }

    /// Register a receiver bound to a live transport with a fresh session.
    ///
    /// See [`RelayHub::admit`].
    pub fn register(&self, name: Option<&str>, handle: SessionHandle) -> Result<ReceiverId, RelayError> {
        self.admit(name, ReceiverSession::new(), handle)
            .map_err(|rejected| rejected.error)
    }

    /// Move a `Connecting` session into the registry as Active.
    ///
    /// Queues `registration_confirmed` on the transport and notifies
    /// observers. Fails without creating anything if the name is missing or
    /// malformed, the session is not `Connecting`, or the transport is
    /// already bound to an active receiver; the session is handed back
    /// unchanged.
    pub fn admit(
        &self,
        name: Option<&str>,
        mut session: ReceiverSession,
        handle: SessionHandle,
    ) -> Result<ReceiverId, RegistrationRejected> {
        let reject = |error: RelayError, session: ReceiverSession| RegistrationRejected { error, session };

        let name = match validate_name(name) {
            Ok(name) => name,
            Err(e) => return Err(reject(e, session)),
        };

        if handle.is_closed() {
            return Err(reject(
                RelayError::RegistrationFailure("connection lost".into()),
                session,
            ));
        }

        let mut registry = self.registry.lock();

        if let Some((bound, _)) = registry.entries.iter().find(|(_, e)| {
            e.is_active()
                && e
                    .handle
                    .as_ref()
                    .is_some_and(|h| h.same_channel(&handle))
        }) {
            let error =
                RelayError::RegistrationFailure(format!("connection already registered as {bound}"));
            return Err(reject(error, session));
        }

        let id = registry.fresh_id();
        if let Err(e) = session.activate(id.clone()) {
            return Err(reject(RelayError::RegistrationFailure(e.to_string()), session));
        }

        // queued under the lock so no broadcast frame can precede it
        let confirmation = ServerMessage::RegistrationConfirmed {
            receiver_id: id.to_string(),
            message: format!("Successfully registered as {name}"),
        };
        if let Ok(json) = confirmation.to_json() {
            let _ = handle.try_deliver(Arc::from(json));
        }

        let now = Utc::now();
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry.entries.insert(
            id.clone(),
            Entry {
                seq,
                name: name.clone(),
                session,
                handle: Some(handle),
                created_at: now,
                last_seen: now,
            },
        );

        tracing::info!(receiver_id = %id, name = %name, "Receiver registered");
        self.notify(&registry);

        Ok(id)
    }

    /// The transport bound to `id` reported loss. Idempotent.
    ///
    /// Returns whether the record changed.
    pub fn handle_disconnect(&self, id: &ReceiverId) -> bool {
        self.take_offline(id, Some(CloseReason::TransportLoss))
    }

    /// Receiver asked to leave. Only the transport that owns `id` may do this.
    pub fn unregister(&self, id: &ReceiverId, handle: &SessionHandle) -> Result<(), RelayError> {
        {
            let registry = self.registry.lock();
            let entry = registry
                .entries
                .get(id)
                .ok_or_else(|| RelayError::not_found(id))?;
            let owned = entry
                .handle
                .as_ref()
                .is_some_and(|h| h.same_channel(handle));
            if !owned {
                return Err(RelayError::not_found(id));
            }
        }
        // the receiver closes its own socket right after unregistering
        self.take_offline(id, None);
        Ok(())
    }

    /// Forcibly tear down the transport bound to `id`.
    ///
    /// Unknown id: `NotFound`. Already offline: succeeds without touching
    /// the registry. Never affects other receivers.
    pub fn admin_disconnect(&self, id: &ReceiverId) -> Result<AdminOutcome, RelayError> {
        let mut registry = self.registry.lock();
        let entry = registry
            .entries
            .get_mut(id)
            .ok_or_else(|| RelayError::not_found(id))?;

        if !entry.is_active() {
            return Ok(AdminOutcome::AlreadyOffline);
        }

        entry
            .session
            .disconnect_by_admin()
            .map_err(|e| RelayError::TransportLoss(e.to_string()))?;

        if let Some(handle) = entry.handle.take() {
            let notice = ServerMessage::ManualDisconnect {
                message: "Disconnected by administrator".into(),
            };
            if let Ok(json) = notice.to_json() {
                let _ = handle.try_deliver(Arc::from(json));
            }
            handle.terminate(CloseReason::Admin);
        }

        tracing::info!(receiver_id = %id, name = %entry.name, "Receiver disconnected by administrator");
        self.notify(&registry);

        Ok(AdminOutcome::Disconnected)
    }

    /// Queue `event` for every active receiver.
    ///
    /// Returns once the event is handed to every queue. A receiver whose
    /// queue is full or closed goes Offline; the rest are unaffected.
    pub fn broadcast(&self, event: &RelayEvent) -> BroadcastReport {
        let frame: Arc<str> = match ServerMessage::OscMessage(event.clone()).to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!(address = %event.address, "Failed to serialize event: {}", e);
                return BroadcastReport::default();
            }
        };

        let mut registry = self.registry.lock();
        let mut report = BroadcastReport::default();

        for (id, entry) in registry.entries.iter_mut() {
            if !entry.is_active() {
                continue;
            }
            let outcome = match &entry.handle {
                Some(handle) => handle.try_deliver(frame.clone()),
                None => Err(DeliveryError::Closed),
            };
            match outcome {
                Ok(()) => report.delivered.push(id.clone()),
                Err(err) => {
                    let reason = match err {
                        DeliveryError::Full => CloseReason::SlowConsumer,
                        DeliveryError::Closed => CloseReason::TransportLoss,
                    };
                    tracing::warn!(receiver_id = %id, name = %entry.name, ?reason, "Dropping receiver during broadcast");
                    let _ = entry.session.go_offline();
                    if let Some(handle) = entry.handle.take() {
                        handle.terminate(reason);
                    }
                    report.dropped.push(id.clone());
                }
            }
        }

        if !report.dropped.is_empty() {
            self.notify(&registry);
        }

        tracing::debug!(
            address = %event.address,
            delivered = report.delivered.len(),
            dropped = report.dropped.len(),
            "Event broadcast"
        );

        report
    }

    /// Registry snapshot in registration order
    pub fn list_receivers(&self) -> Vec<ReceiverRecord> {
        self.registry.lock().records()
    }

    pub fn summaries(&self) -> Vec<ReceiverSummary> {
        self.registry.lock().summaries()
    }

    pub fn get(&self, id: &ReceiverId) -> Option<ReceiverRecord> {
        self.registry.lock().entries.get(id).map(|e| e.record(id))
    }

    /// At least one receiver is active
    pub fn is_connected(&self) -> bool {
        self.active_count() > 0
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().active_count()
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refresh `last_seen` after inbound traffic
    pub fn touch(&self, id: &ReceiverId) {
        if let Some(entry) = self.registry.lock().entries.get_mut(id) {
            if entry.is_active() {
                entry.last_seen = Utc::now();
            }
        }
    }

    /// Mark Offline every active receiver silent for longer than `timeout`
    pub fn reap_stale(&self, timeout: Duration) -> Vec<ReceiverId> {
        let cutoff = match chrono::Duration::from_std(timeout) {
            Ok(d) => Utc::now() - d,
            Err(_) => return Vec::new(),
        };

        let mut registry = self.registry.lock();
        let mut reaped = Vec::new();
        for (id, entry) in registry.entries.iter_mut() {
            if entry.is_active() && entry.last_seen < cutoff {
                let _ = entry.session.go_offline();
                if let Some(handle) = entry.handle.take() {
                    handle.terminate(CloseReason::Stale);
                }
                tracing::warn!(receiver_id = %id, name = %entry.name, "Receiver is stale, marking offline");
                reaped.push(id.clone());
            }
        }
        if !reaped.is_empty() {
            self.notify(&registry);
        }
        reaped
    }

    /// Drop every offline record and everything the hub kept about it.
    pub fn prune_offline(&self) -> usize {
        let mut registry = self.registry.lock();
        let before = registry.entries.len();
        registry.entries.retain(|_, e| e.is_active());
        let removed = before - registry.entries.len();
        if removed > 0 {
            tracing::info!(removed, "Pruned offline receivers");
            self.notify(&registry);
        }
        removed
    }

    /// Close every live transport, e.g. on hub shutdown
    pub fn shutdown(&self) {
        let mut registry = self.registry.lock();
        let mut changed = false;
        for entry in registry.entries.values_mut() {
            if let Ok(true) = entry.session.go_offline() {
                changed = true;
            }
            if let Some(handle) = entry.handle.take() {
                handle.terminate(CloseReason::Shutdown);
            }
        }
        if changed {
            self.notify(&registry);
        }
    }

    /// Subscribe to registry-changed notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RegistryChanged>> {
        self.observers.subscribe()
    }

    fn take_offline(&self, id: &ReceiverId, reason: Option<CloseReason>) -> bool {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.entries.get_mut(id) else {
            return false;
        };

        let changed = matches!(entry.session.go_offline(), Ok(true));
        if let Some(handle) = entry.handle.take() {
            if let Some(reason) = reason {
                handle.terminate(reason);
            }
        }

        if changed {
            tracing::info!(receiver_id = %id, name = %entry.name, "Receiver offline");
            self.notify(&registry);
        }
        changed
    }

    fn notify(&self, registry: &Registry) {
        // no observers is fine
        let _ = self.observers.send(Arc::new(RegistryChanged {
            receivers: registry.summaries(),
        }));
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept a display name: trimmed, non-empty, bounded, no control chars.
pub fn validate_name(name: Option<&str>) -> Result<String, RelayError> {
    let name = name
        .map(str::trim)
        .ok_or_else(|| RelayError::RegistrationFailure("missing name".into()))?;
    if name.is_empty() {
        return Err(RelayError::RegistrationFailure("name is empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(RelayError::RegistrationFailure(format!(
            "name longer than {MAX_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(RelayError::RegistrationFailure(
            "name contains control characters".into(),
        ));
    }
    Ok(name.to_string())
}
