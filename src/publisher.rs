//! Publishing side of the hub
//!
//! [`Publisher`] turns `(address, value)` into a timestamped event, fans it
//! out through the hub and mirrors it to the hub's own OSC destinations.
//! [`Emitter`] is a test-signal generator that publishes to random
//! addresses at random intervals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::{Destination, EmitterConfig};
use crate::error::RelayError;
use crate::forward::OscForwarder;
use crate::hub::{BroadcastReport, RelayHub};
use crate::osc;
use crate::protocol::{EventValue, RelayEvent};

pub struct Publisher {
    hub: Arc<RelayHub>,
    mirror: Option<OscForwarder>,
    published: AtomicU64,
}

impl Publisher {
    /// `destinations` may be empty, in which case nothing is mirrored.
    pub async fn new(hub: Arc<RelayHub>, destinations: &[Destination]) -> Result<Self, RelayError> {
        let mirror = if destinations.is_empty() {
            None
        } else {
            Some(OscForwarder::bind(destinations).await?)
        };
        Ok(Self {
            hub,
            mirror,
            published: AtomicU64::new(0),
        })
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Validate, stamp and fan out one event.
    ///
    /// Mirroring to local destinations is best effort; a failed UDP send is
    /// logged and does not fail the publish.
    pub async fn publish(
        &self,
        address: &str,
        value: impl Into<EventValue>,
    ) -> Result<BroadcastReport, RelayError> {
        osc::validate_address(address)?;
        let event = RelayEvent::new(address, value);

        let report = self.hub.broadcast(&event);
        self.published.fetch_add(1, Ordering::Relaxed);

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.forward(&event.address, &event.value).await {
                tracing::warn!(address = %event.address, "Local OSC mirror failed: {}", e);
            }
        }

        tracing::info!(
            address = %event.address,
            value = %event.value,
            receivers = report.delivered.len(),
            "Published event"
        );
        Ok(report)
    }

    pub fn destinations(&self) -> Vec<Destination> {
        self.mirror
            .as_ref()
            .map(OscForwarder::destinations)
            .unwrap_or_default()
    }

    /// Events published since startup
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Optional changes applied when the emitter is started
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmitterOverrides {
    pub addresses: Option<Vec<String>>,
    pub interval_min: Option<f64>,
    pub interval_max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitterStart {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmitterStatus {
    pub running: bool,
    pub addresses: Vec<String>,
    pub interval_min: f64,
    pub interval_max: f64,
}

struct EmitterState {
    settings: EmitterConfig,
    task: Option<JoinHandle<()>>,
}

impl EmitterState {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Random test-signal generator
pub struct Emitter {
    publisher: Arc<Publisher>,
    state: Mutex<EmitterState>,
}

impl Emitter {
    pub fn new(publisher: Arc<Publisher>, settings: EmitterConfig) -> Self {
        Self {
            publisher,
            state: Mutex::new(EmitterState {
                settings,
                task: None,
            }),
        }
    }

    /// Start emitting. Starting a running emitter changes nothing.
    pub fn start(&self, overrides: EmitterOverrides) -> Result<EmitterStart, RelayError> {
        let mut state = self.state.lock();
        if state.is_running() {
            return Ok(EmitterStart::AlreadyRunning);
        }

        let mut settings = state.settings.clone();
        if let Some(addresses) = overrides.addresses {
            settings.addresses = addresses;
        }
        if let Some(min) = overrides.interval_min {
            settings.interval_min = min;
        }
        if let Some(max) = overrides.interval_max {
            settings.interval_max = max;
        }
        settings.validate()?;

        tracing::info!(
            addresses = settings.addresses.len(),
            interval_min = settings.interval_min,
            interval_max = settings.interval_max,
            "Random emitter started"
        );
        state.task = Some(tokio::spawn(emit_loop(
            self.publisher.clone(),
            settings.clone(),
        )));
        state.settings = settings;
        Ok(EmitterStart::Started)
    }

    /// Returns whether the emitter was running.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock();
        let running = state.is_running();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        if running {
            tracing::info!("Random emitter stopped");
        }
        running
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running()
    }

    pub fn status(&self) -> EmitterStatus {
        let state = self.state.lock();
        EmitterStatus {
            running: state.is_running(),
            addresses: state.settings.addresses.clone(),
            interval_min: state.settings.interval_min,
            interval_max: state.settings.interval_max,
        }
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}

async fn emit_loop(publisher: Arc<Publisher>, settings: EmitterConfig) {
    loop {
        let (address, pause) = {
            let mut rng = rand::thread_rng();
            let address = settings.addresses.choose(&mut rng).cloned();
            let pause = rng.gen_range(settings.interval_min..=settings.interval_max);
            (address, pause)
        };

        if let Some(address) = address {
            if let Err(e) = publisher.publish(&address, EventValue::Float(1.0)).await {
                tracing::warn!(address = %address, "Emitter publish failed: {}", e);
            }
        }

        match Duration::try_from_secs_f64(pause) {
            Ok(pause) => tokio::time::sleep(pause).await,
            Err(e) => {
                tracing::error!(pause, "Emitter stopped, unusable interval: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osc::{OscArg, OscMessage};
    use tokio::net::UdpSocket;

    async fn publisher() -> Arc<Publisher> {
        Arc::new(Publisher::new(Arc::new(RelayHub::new()), &[]).await.unwrap())
    }

    #[tokio::test]
    async fn test_publish_reaches_registered_receiver() {
        let publisher = publisher().await;
        let (handle, mut channels) = publisher.hub().session_channel();
        let id = publisher.hub().register(Some("Max"), handle).unwrap();
        let _confirmation = channels.outbound.try_recv().unwrap();

        let report = publisher.publish("/mass/tile3", 1.0).await.unwrap();
        assert_eq!(report.delivered, vec![id]);

        let frame = channels.outbound.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["event"], "osc_message");
        assert_eq!(json["address"], "/mass/tile3");
        assert_eq!(json["value"], 1.0);
        assert!(json["timestamp"].as_f64().unwrap() > 0.0);
        assert_eq!(publisher.published(), 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_address() {
        let publisher = publisher().await;
        assert!(matches!(
            publisher.publish("tile3", 1.0).await,
            Err(RelayError::Encode(_))
        ));
        assert_eq!(publisher.published(), 0);
    }

    #[tokio::test]
    async fn test_publish_with_no_receivers_still_mirrors() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = Destination::new("127.0.0.1", device.local_addr().unwrap().port());
        let publisher = Publisher::new(Arc::new(RelayHub::new()), &[dest.clone()])
            .await
            .unwrap();
        assert_eq!(publisher.destinations(), vec![dest]);

        let report = publisher.publish("/fader/1", 7).await.unwrap();
        assert!(report.delivered.is_empty());

        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let msg = OscMessage::decode(&buf[..len]).unwrap();
        assert_eq!(msg.address, "/fader/1");
        assert_eq!(msg.args, vec![OscArg::Int(7)]);
    }

    #[tokio::test]
    async fn test_emitter_start_stop() {
        let publisher = publisher().await;
        let emitter = Emitter::new(publisher.clone(), EmitterConfig::default());
        assert!(!emitter.is_running());

        let overrides = EmitterOverrides {
            addresses: Some(vec!["/a".into(), "/b".into()]),
            interval_min: Some(0.01),
            interval_max: Some(0.02),
        };
        assert_eq!(emitter.start(overrides).unwrap(), EmitterStart::Started);
        assert_eq!(
            emitter.start(EmitterOverrides::default()).unwrap(),
            EmitterStart::AlreadyRunning
        );

        let status = emitter.status();
        assert!(status.running);
        assert_eq!(status.addresses, vec!["/a", "/b"]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(publisher.published() >= 2);

        assert!(emitter.stop());
        assert!(!emitter.is_running());
        assert!(!emitter.stop());
    }

    #[tokio::test]
    async fn test_emitter_rejects_inverted_interval() {
        let emitter = Emitter::new(publisher().await, EmitterConfig::default());
        let overrides = EmitterOverrides {
            interval_min: Some(2.0),
            interval_max: Some(1.0),
            ..EmitterOverrides::default()
        };
        assert!(matches!(emitter.start(overrides), Err(RelayError::Config(_))));
        assert!(!emitter.is_running());
    }

    #[tokio::test]
    async fn test_emitter_rejects_oversized_interval() {
        let publisher = publisher().await;
        let emitter = Emitter::new(publisher.clone(), EmitterConfig::default());
        let overrides = EmitterOverrides {
            addresses: Some(vec!["/a".into()]),
            interval_min: Some(1e20),
            interval_max: Some(1e20),
        };
        assert!(matches!(emitter.start(overrides), Err(RelayError::Config(_))));
        assert!(!emitter.is_running());
        assert_eq!(publisher.published(), 0);

        // settings are untouched, so a plain start still works
        let status = emitter.status();
        assert_eq!(status.interval_max, EmitterConfig::default().interval_max);
        assert_eq!(
            emitter.start(EmitterOverrides::default()).unwrap(),
            EmitterStart::Started
        );
        assert!(emitter.stop());
    }
}
