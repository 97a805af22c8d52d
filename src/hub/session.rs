//! Receiver session state machine
//!
//! Tracks one subscriber connection from socket upgrade to teardown:
//!
//! ```text
//! Connecting --register--> Active --transport loss--> Offline
//!                             \
//!                              --admin disconnect--> DisconnectedByAdmin
//! ```
//!
//! Nothing returns to `Active`. A reconnecting client always registers a
//! fresh session.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};

use super::ReceiverId;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket upgraded, no registration yet
    Connecting,
    /// Registered and receiving broadcasts
    Active,
    /// Transport lost or receiver unregistered
    Offline,
    /// Torn down by an administrator
    DisconnectedByAdmin,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Offline | SessionState::DisconnectedByAdmin
        )
    }
}

/// Attempted transition that the state machine does not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid session transition {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// One subscriber connection's lifecycle
#[derive(Debug, Clone)]
pub struct ReceiverSession {
    state: SessionState,
    receiver_id: Option<ReceiverId>,
    connected_at: Instant,
}

impl ReceiverSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            receiver_id: None,
            connected_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn receiver_id(&self) -> Option<&ReceiverId> {
        self.receiver_id.as_ref()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Registration accepted by the hub
    pub fn activate(&mut self, id: ReceiverId) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Active)?;
        self.receiver_id = Some(id);
        Ok(())
    }

    /// Transport lost or receiver unregistered.
    ///
    /// Returns `false` when the session was already terminal.
    pub fn go_offline(&mut self) -> Result<bool, InvalidTransition> {
        if self.state.is_terminal() {
            return Ok(false);
        }
        self.transition(SessionState::Offline)?;
        Ok(true)
    }

    /// Administrator teardown. Returns `false` when already terminal.
    pub fn disconnect_by_admin(&mut self) -> Result<bool, InvalidTransition> {
        if self.state.is_terminal() {
            return Ok(false);
        }
        self.transition(SessionState::DisconnectedByAdmin)?;
        Ok(true)
    }

    fn transition(&mut self, to: SessionState) -> Result<(), InvalidTransition> {
        let allowed = matches!(
            (self.state, to),
            (SessionState::Connecting, SessionState::Active)
                | (SessionState::Connecting, SessionState::Offline)
                | (SessionState::Active, SessionState::Offline)
                | (SessionState::Active, SessionState::DisconnectedByAdmin)
        );
        if !allowed {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

impl Default for ReceiverSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the hub tore down a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TransportLoss,
    SlowConsumer,
    Stale,
    Admin,
    Shutdown,
}

/// Why a frame could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Outbound queue full: the receiver is not keeping up
    Full,
    /// Writer task gone
    Closed,
}

/// Hub-side handle to one connection's writer task.
///
/// Frames are pre-serialized JSON shared across every receiver of a
/// broadcast. The writer drains the queue in order, so per-receiver
/// delivery order equals enqueue order.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<Arc<str>>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

/// Writer-side ends of a [`SessionHandle`]
pub struct SessionChannels {
    pub outbound: mpsc::Receiver<Arc<str>>,
    pub close: watch::Receiver<Option<CloseReason>>,
}

impl SessionHandle {
    pub fn channel(capacity: usize) -> (Self, SessionChannels) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        (
            Self {
                outbound: out_tx,
                close: Arc::new(close_tx),
            },
            SessionChannels {
                outbound: out_rx,
                close: close_rx,
            },
        )
    }

    /// Queue a frame without waiting.
    pub fn try_deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Ask the writer to flush what is queued and close the socket.
    /// The first reason wins.
    pub fn terminate(&self, reason: CloseReason) {
        self.close.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    pub fn same_channel(&self, other: &SessionHandle) -> bool {
        self.outbound.same_channel(&other.outbound)
    }
}
