//! Receiver registry
//!
//! Plain data owned by [`RelayHub`](super::RelayHub). Nothing here locks;
//! the hub serializes every access.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::{ReceiverSession, SessionHandle, SessionState};

/// Opaque receiver identity, unique for the hub's process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiverId(Uuid);

impl ReceiverId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReceiverId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ReceiverId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverStatus {
    Active,
    Offline,
}

/// Point-in-time copy of one registry entry
#[derive(Debug, Clone)]
pub struct ReceiverRecord {
    pub id: ReceiverId,
    pub name: String,
    pub status: ReceiverStatus,
    pub session_state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ReceiverRecord {
    pub fn is_active(&self) -> bool {
        self.status == ReceiverStatus::Active
    }

    pub fn summary(&self) -> ReceiverSummary {
        ReceiverSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            active: self.is_active(),
            created_at: self.created_at,
            last_seen: self.last_seen,
        }
    }
}

/// Dashboard view of a receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverSummary {
    pub id: ReceiverId,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub(crate) struct Entry {
    pub seq: u64,
    pub name: String,
    pub session: ReceiverSession,
    pub handle: Option<SessionHandle>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Entry {
    pub fn is_active(&self) -> bool {
        self.session.state().is_active()
    }

    pub fn record(&self, id: &ReceiverId) -> ReceiverRecord {
        ReceiverRecord {
            id: id.clone(),
            name: self.name.clone(),
            status: if self.is_active() {
                ReceiverStatus::Active
            } else {
                ReceiverStatus::Offline
            },
            session_state: self.session.state(),
            created_at: self.created_at,
            last_seen: self.last_seen,
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    pub entries: HashMap<ReceiverId, Entry>,
    pub next_seq: u64,
}

impl Registry {
    /// Random v4 id not held by any current entry. Pruned ids are not
    /// remembered; 122 random bits make a repeat negligible.
    pub fn fresh_id(&self) -> ReceiverId {
        loop {
            let id = ReceiverId::new();
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Entries in registration order
    pub fn ordered(&self) -> Vec<(&ReceiverId, &Entry)> {
        let mut all: Vec<_> = self.entries.iter().collect();
        all.sort_by_key(|(_, e)| e.seq);
        all
    }

    pub fn records(&self) -> Vec<ReceiverRecord> {
        self.ordered()
            .into_iter()
            .map(|(id, e)| e.record(id))
            .collect()
    }

    pub fn summaries(&self) -> Vec<ReceiverSummary> {
        self.ordered()
            .into_iter()
            .map(|(id, e)| e.record(id).summary())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_parse_round_trip() {
        let id = ReceiverId::new();
        let parsed: ReceiverId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-an-id".parse::<ReceiverId>().is_err());
    }

    #[test]
    fn test_fresh_id_keeps_no_state() {
        let registry = Registry::default();
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| registry.fresh_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(registry.entries.is_empty());
        assert_eq!(registry.next_seq, 0);
    }

    #[test]
    fn test_summary_serializes_dashboard_fields() {
        let now = Utc::now();
        let record = ReceiverRecord {
            id: ReceiverId::new(),
            name: "Max".into(),
            status: ReceiverStatus::Active,
            session_state: SessionState::Active,
            created_at: now,
            last_seen: now,
        };
        let json = serde_json::to_value(record.summary()).unwrap();
        assert_eq!(json["name"], "Max");
        assert_eq!(json["active"], true);
        assert!(json["id"].is_string());
        assert!(json["created_at"].is_string());
    }
}
