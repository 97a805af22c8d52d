//! Fire-and-forget OSC over UDP
//!
//! Used by receivers to hand relayed events to a local OSC device, and by
//! the hub to mirror published events to its own destinations. A failed
//! send is counted and logged; nothing is retried.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;

use crate::config::Destination;
use crate::error::RelayError;
use crate::osc;
use crate::protocol::EventValue;

pub struct OscForwarder {
    socket: UdpSocket,
    targets: Vec<(Destination, SocketAddr)>,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl OscForwarder {
    /// Resolve `destinations` and bind an ephemeral local socket.
    pub async fn bind(destinations: &[Destination]) -> Result<Self, RelayError> {
        let mut targets = Vec::with_capacity(destinations.len());
        for dest in destinations {
            let addr = tokio::net::lookup_host((dest.ip.as_str(), dest.port))
                .await?
                .next()
                .ok_or_else(|| RelayError::Config(format!("cannot resolve {dest}")))?;
            targets.push((dest.clone(), addr));
        }

        let any_v6 = targets.iter().any(|(_, addr)| addr.is_ipv6());
        let local = if any_v6 { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(local).await?;

        tracing::debug!(
            targets = ?targets.iter().map(|(d, _)| d.to_string()).collect::<Vec<_>>(),
            "OSC forwarder ready"
        );

        Ok(Self {
            socket,
            targets,
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Send one `(address, value)` packet to every destination.
    ///
    /// Every destination is attempted even if an earlier one fails; the
    /// first failure is returned.
    pub async fn forward(&self, address: &str, value: &EventValue) -> Result<(), RelayError> {
        let packet = match osc::encode_event(address, value) {
            Ok(packet) => packet,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                return Err(RelayError::ForwardFailure(e.to_string()));
            }
        };

        let mut first_error = None;
        for (dest, addr) in &self.targets {
            match self.socket.send_to(&packet, addr).await {
                Ok(_) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(destination = %dest, address, "OSC forward failed: {}", e);
                    first_error
                        .get_or_insert_with(|| RelayError::ForwardFailure(format!("{dest}: {e}")));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn destinations(&self) -> Vec<Destination> {
        self.targets.iter().map(|(d, _)| d.clone()).collect()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
