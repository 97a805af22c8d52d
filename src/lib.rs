//! # OSC Relay - control-surface event relay over WebSocket
//!
//! A hub accepts parameter events (an OSC address plus a numeric value)
//! from a control surface and fans them out to any number of named
//! receivers connected over WebSocket. Each receiver may re-forward what it
//! gets to a local OSC device over UDP.
//!
//! ## Pieces
//!
//! - **Hub** ([`RelayHub`]): receiver registry, per-connection session state
//!   machine, non-blocking fan-out
//! - **Server** ([`server`]): axum router with the receiver socket, the
//!   dashboard socket and the admin/publisher HTTP API
//! - **Client** ([`RelayClient`]): registers, receives, forwards locally,
//!   reconnects with backoff
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use osc_relay::{ClientConfig, Destination, RelayClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::new("ws://hub.local:7401/ws", "Stage Left")
//!         .with_local_forward(Destination::new("127.0.0.1", 57120));
//!
//!     let client = RelayClient::connect(config).await?;
//!     let mut events = client.events();
//!     while let Ok(event) = events.recv().await {
//!         println!("{} = {}", event.address, event.value);
//!     }
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod hub;
pub mod osc;
pub mod protocol;
pub mod publisher;
pub mod server;

// Re-export main types for library consumers
pub use admin::{AdminControl, DisconnectAck};
pub use client::{ClientStatus, RelayClient};
pub use config::{ClientConfig, Destination, HubConfig};
pub use error::{RelayError, Result};
pub use hub::{ReceiverId, ReceiverRecord, ReceiverStatus, RelayHub};
pub use protocol::{ClientMessage, EventValue, RelayEvent, ServerMessage};
pub use publisher::{Emitter, Publisher};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
