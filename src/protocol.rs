//! Wire messages exchanged over the relay sockets.
//!
//! Every frame is a JSON object with an `event` tag. Inbound frames are
//! parsed into [`ClientMessage`]; anything outside that closed set is
//! rejected instead of being coerced.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::hub::ReceiverSummary;

/// Argument carried by a relayed event.
///
/// Integers stay integers so they forward as OSC `i`; everything else is a
/// float or a short list of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    Int(i32),
    Float(f64),
    List(Vec<f64>),
}

impl Default for EventValue {
    fn default() -> Self {
        EventValue::Float(1.0)
    }
}

impl From<f64> for EventValue {
    fn from(v: f64) -> Self {
        EventValue::Float(v)
    }
}

impl From<f32> for EventValue {
    fn from(v: f32) -> Self {
        EventValue::Float(v as f64)
    }
}

impl From<i32> for EventValue {
    fn from(v: i32) -> Self {
        EventValue::Int(v)
    }
}

impl From<Vec<f64>> for EventValue {
    fn from(v: Vec<f64>) -> Self {
        EventValue::List(v)
    }
}

impl std::fmt::Display for EventValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventValue::Int(v) => write!(f, "{v}"),
            EventValue::Float(v) => write!(f, "{v:.3}"),
            EventValue::List(vs) => {
                let parts: Vec<String> = vs.iter().map(|v| format!("{v:.3}")).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// A parameter event from the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub address: String,
    pub value: EventValue,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl RelayEvent {
    pub fn new(address: impl Into<String>, value: impl Into<EventValue>) -> Self {
        Self {
            address: address.into(),
            value: value.into(),
            timestamp: unix_now(),
        }
    }
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Frames sent by receivers, publishers and administrators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    RegisterReceiver {
        #[serde(default)]
        name: Option<String>,
    },
    UnregisterReceiver {
        receiver_id: String,
    },
    DisconnectReceiver {
        receiver_id: String,
    },
    PruneReceivers,
    SendValue {
        address: String,
        #[serde(default)]
        value: EventValue,
    },
}

/// Frames sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    RegistrationConfirmed {
        receiver_id: String,
        message: String,
    },
    RegistrationFailed {
        error: String,
    },
    UnregistrationConfirmed {
        message: String,
    },
    UnregistrationFailed {
        error: String,
    },
    OscMessage(RelayEvent),
    ManualDisconnect {
        message: String,
    },
    DisconnectResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    PruneResult {
        removed: usize,
    },
    ReceiverListUpdated {
        receivers: Vec<ReceiverSummary>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_frame_shape() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"event": "register_receiver", "name": "Max"})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RegisterReceiver {
                name: Some("Max".into())
            }
        );

        // missing name still parses so the hub can answer with a failure
        let msg: ClientMessage =
            serde_json::from_value(json!({"event": "register_receiver"})).unwrap();
        assert_eq!(msg, ClientMessage::RegisterReceiver { name: None });
    }

    #[test]
    fn unknown_event_is_rejected() {
        let parsed = serde_json::from_value::<ClientMessage>(json!({"event": "auth", "name": "x"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn osc_message_is_flat() {
        let event = RelayEvent {
            address: "/test/1".into(),
            value: EventValue::Float(1.0),
            timestamp: 1700000000.5,
        };
        let value = serde_json::to_value(ServerMessage::OscMessage(event)).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "osc_message",
                "address": "/test/1",
                "value": 1.0,
                "timestamp": 1700000000.5
            })
        );
    }

    #[test]
    fn value_keeps_int_and_float_apart() {
        let v: EventValue = serde_json::from_str("1").unwrap();
        assert_eq!(v, EventValue::Int(1));
        let v: EventValue = serde_json::from_str("1.0").unwrap();
        assert_eq!(v, EventValue::Float(1.0));
        let v: EventValue = serde_json::from_str("[0.5, 1]").unwrap();
        assert_eq!(v, EventValue::List(vec![0.5, 1.0]));
    }

    #[test]
    fn send_value_defaults_to_one() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"event": "send_value", "address": "/mass/tile1"}))
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SendValue {
                address: "/mass/tile1".into(),
                value: EventValue::Float(1.0)
            }
        );
    }

    #[test]
    fn disconnect_result_omits_empty_message() {
        let json = ServerMessage::DisconnectResult {
            success: true,
            message: None,
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"event":"disconnect_result","success":true}"#);
    }
}
