//! Operator control surface over the hub
//!
//! Used by both the dashboard socket and the HTTP API so that the two give
//! identical answers.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::RelayError;
use crate::hub::{AdminOutcome, ReceiverId, ReceiverRecord, ReceiverSummary, RegistryChanged, RelayHub};
use crate::protocol::ServerMessage;

/// Answer to a disconnect-by-id request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisconnectAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DisconnectAck {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::DisconnectResult {
            success: self.success,
            message: self.message.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AdminControl {
    hub: Arc<RelayHub>,
}

impl AdminControl {
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }

    /// Push-updated receiver list
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RegistryChanged>> {
        self.hub.subscribe()
    }

    /// Current list, for a freshly attached observer
    pub fn snapshot(&self) -> Vec<ReceiverSummary> {
        self.hub.summaries()
    }

    pub fn receivers(&self) -> Vec<ReceiverRecord> {
        self.hub.list_receivers()
    }

    /// At least one receiver is active
    pub fn is_connected(&self) -> bool {
        self.hub.is_connected()
    }

    /// Disconnect the receiver with id `raw_id`.
    ///
    /// An id that does not parse is reported the same way as an unknown one.
    pub fn disconnect(&self, raw_id: &str) -> DisconnectAck {
        let result = raw_id
            .parse::<ReceiverId>()
            .map_err(|_| RelayError::NotFound(raw_id.to_string()))
            .and_then(|id| self.hub.admin_disconnect(&id));

        match result {
            Ok(AdminOutcome::Disconnected) => DisconnectAck {
                success: true,
                message: None,
            },
            Ok(AdminOutcome::AlreadyOffline) => DisconnectAck {
                success: true,
                message: Some("receiver already offline".into()),
            },
            Err(e) => {
                tracing::warn!(receiver_id = raw_id, "Disconnect request failed: {}", e);
                DisconnectAck {
                    success: false,
                    message: Some(e.to_string()),
                }
            }
        }
    }

    /// Drop every offline record; returns how many were removed.
    pub fn prune(&self) -> usize {
        self.hub.prune_offline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<RelayHub>, AdminControl) {
        let hub = Arc::new(RelayHub::new());
        let admin = AdminControl::new(hub.clone());
        (hub, admin)
    }

    #[test]
    fn test_disconnect_unknown_and_malformed_ids() {
        let (hub, admin) = setup();
        let (handle, _channels) = hub.session_channel();
        hub.register(Some("Max"), handle).unwrap();

        let ack = admin.disconnect(&ReceiverId::new().to_string());
        assert!(!ack.success);
        assert!(ack.message.unwrap().contains("not found"));

        let ack = admin.disconnect("not-a-uuid");
        assert!(!ack.success);
        assert!(admin.is_connected());
    }

    #[test]
    fn test_disconnect_then_repeat() {
        let (hub, admin) = setup();
        let (handle, _channels) = hub.session_channel();
        let id = hub.register(Some("Max"), handle).unwrap();
        let mut observer = admin.subscribe();

        let ack = admin.disconnect(&id.to_string());
        assert_eq!(
            ack,
            DisconnectAck {
                success: true,
                message: None
            }
        );
        assert!(!admin.is_connected());
        let update = observer.try_recv().unwrap();
        assert!(!update.receivers[0].active);

        let again = admin.disconnect(&id.to_string());
        assert!(again.success);
        assert!(observer.try_recv().is_err());
    }

    #[test]
    fn test_ack_wire_shape() {
        let ack = DisconnectAck {
            success: false,
            message: Some("receiver not found: x".into()),
        };
        let json: serde_json::Value =
            serde_json::from_str(&ack.to_message().to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "disconnect_result");
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "receiver not found: x");
    }

    #[test]
    fn test_prune_and_snapshot() {
        let (hub, admin) = setup();
        let (handle, _channels) = hub.session_channel();
        let gone = hub.register(Some("gone"), handle).unwrap();
        let (handle, _keep) = hub.session_channel();
        hub.register(Some("kept"), handle).unwrap();
        hub.handle_disconnect(&gone);

        assert_eq!(admin.snapshot().len(), 2);
        assert_eq!(admin.prune(), 1);
        let names: Vec<_> = admin.receivers().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["kept"]);
    }
}
