//! Hub and client configuration
//!
//! Precedence, lowest first: built-in defaults, TOML file, environment
//! (a `.env` file is honoured), then whatever the CLI overrides afterwards.
//! Durations are stored as milliseconds so the TOML stays flat.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::hub::{self, DEFAULT_QUEUE_CAPACITY};

pub const DEFAULT_HUB_PORT: u16 = 7401;
pub const DEFAULT_LOCAL_OSC_PORT: u16 = 57120;

/// Longest accepted emitter pause, seconds
pub const MAX_EMITTER_INTERVAL_SECS: f64 = 3600.0;

/// A UDP destination for OSC packets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub ip: String,
    pub port: u16,
}

impl Destination {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl Default for Destination {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_LOCAL_OSC_PORT)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Random test-signal generator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Addresses picked from at random
    pub addresses: Vec<String>,
    /// Shortest pause between events, seconds
    pub interval_min: f64,
    /// Longest pause between events, seconds
    pub interval_max: f64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            addresses: (1..=14).map(|i| format!("/mass/tile{i}")).collect(),
            interval_min: 0.5,
            interval_max: 3.0,
        }
    }
}

impl EmitterConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.addresses.is_empty() {
            return Err(RelayError::Config("emitter needs at least one address".into()));
        }
        for address in &self.addresses {
            crate::osc::validate_address(address)
                .map_err(|e| RelayError::Config(e.to_string()))?;
        }
        if !(self.interval_min > 0.0
            && self.interval_min <= self.interval_max
            && self.interval_max <= MAX_EMITTER_INTERVAL_SECS)
        {
            return Err(RelayError::Config(format!(
                "emitter interval must satisfy 0 < min <= max <= {} (got {} .. {})",
                MAX_EMITTER_INTERVAL_SECS, self.interval_min, self.interval_max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Bind address
    pub host: String,

    /// HTTP / WebSocket port
    pub port: u16,

    /// Accepted credentials. Empty disables the check.
    pub api_keys: Vec<String>,

    /// CORS origins for the dashboard. Empty allows any origin.
    pub allowed_origins: Vec<String>,

    /// How often each receiver socket is pinged
    pub ping_interval_ms: u64,

    /// Silence after which an active receiver is marked offline
    pub stale_timeout_ms: u64,

    /// Upper bound for writing one frame to one receiver
    pub send_timeout_ms: u64,

    /// Outbound frames buffered per receiver before it counts as slow
    pub queue_capacity: usize,

    /// Where published events are also sent as OSC packets
    pub destinations: Vec<Destination>,

    pub emitter: EmitterConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_HUB_PORT,
            api_keys: Vec::new(),
            allowed_origins: Vec::new(),
            ping_interval_ms: 25_000,
            stale_timeout_ms: 60_000,
            send_timeout_ms: 5_000,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            destinations: vec![Destination::default()],
            emitter: EmitterConfig::default(),
        }
    }
}

impl HubConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, RelayError> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply `HOST`, `PORT`, `API_KEYS` and `ALLOWED_ORIGINS`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("HOST") {
            self.host = host;
        }
        if let Some(port) = var("PORT").and_then(|p| p.trim().parse().ok()) {
            self.port = port;
        }
        if let Some(keys) = var("API_KEYS") {
            self.api_keys = split_list(&keys);
        }
        if let Some(origins) = var("ALLOWED_ORIGINS") {
            self.allowed_origins = split_list(&origins);
        }
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.ping_interval_ms == 0 || self.ping_interval_ms >= self.stale_timeout_ms {
            return Err(RelayError::Config(format!(
                "ping_interval_ms ({}) must be non-zero and below stale_timeout_ms ({})",
                self.ping_interval_ms, self.stale_timeout_ms
            )));
        }
        if self.send_timeout_ms == 0 {
            return Err(RelayError::Config("send_timeout_ms must be non-zero".into()));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::Config("queue_capacity must be non-zero".into()));
        }
        self.emitter.validate()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn auth_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Reconnection backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the nominal delay added at random, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Hub address; `http://`, `ws://` or bare `host:port`
    pub server: String,

    /// Display name shown on the dashboard
    pub name: String,

    pub api_key: Option<String>,

    /// Local OSC device that receives forwarded events
    pub local_forward: Option<Destination>,

    pub backoff: BackoffConfig,

    /// Wait for `registration_confirmed` at most this long
    pub handshake_timeout_ms: u64,

    /// Treat the hub as gone after this much silence
    pub idle_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("ws://localhost:{DEFAULT_HUB_PORT}/ws"),
            name: default_client_name(),
            api_key: None,
            local_forward: None,
            backoff: BackoffConfig::default(),
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 90_000,
        }
    }
}

impl ClientConfig {
    pub fn new(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_local_forward(mut self, destination: Destination) -> Self {
        self.local_forward = Some(destination);
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn load(path: Option<&Path>) -> Result<Self, RelayError> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)
                    .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `RELAY_SERVER`, `RELAY_NAME`, `RELAY_API_KEY`, `LOCAL_OSC_IP`
    /// and `LOCAL_OSC_PORT`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), RelayError> {
        if let Some(server) = var("RELAY_SERVER") {
            self.server = server;
        }
        if let Some(name) = var("RELAY_NAME") {
            self.name = name;
        }
        if let Some(key) = var("RELAY_API_KEY") {
            self.api_key = Some(key);
        }
        let port = var("LOCAL_OSC_PORT")
            .map(|p| {
                p.trim()
                    .parse::<u16>()
                    .map_err(|e| RelayError::Config(format!("LOCAL_OSC_PORT {p:?}: {e}")))
            })
            .transpose()?;
        self.set_local_forward(var("LOCAL_OSC_IP"), port)
    }

    /// Forwarding needs both halves of the address, or neither.
    pub fn set_local_forward(&mut self, ip: Option<String>, port: Option<u16>) -> Result<(), RelayError> {
        match (ip, port) {
            (Some(ip), Some(port)) => {
                self.local_forward = Some(Destination::new(ip, port));
                Ok(())
            }
            (None, None) => Ok(()),
            _ => Err(RelayError::Config(
                "both local ip and local port must be given for forwarding".into(),
            )),
        }
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        hub::validate_name(Some(self.name.as_str())).map_err(|e| RelayError::Config(e.to_string()))?;
        if self.backoff.initial_delay_ms == 0 || self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(RelayError::Config(
                "backoff needs 0 < initial_delay_ms <= max_delay_ms".into(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(RelayError::Config("backoff multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(RelayError::Config("backoff jitter must be within 0.0..=1.0".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Host name, or a fixed fallback when it cannot be read
pub fn default_client_name() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "OSC Relay Client".to_string())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
