//! Hub HTTP / WebSocket server
//!
//! One axum router carries the receiver socket (`/ws`), the dashboard
//! observer socket (`/dashboard/ws`) and the JSON admin/publisher API.

pub mod api;
pub mod connection;
pub mod dashboard;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use colored::*;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::admin::AdminControl;
use crate::config::HubConfig;
use crate::error::RelayError;
use crate::hub::RelayHub;
use crate::publisher::{Emitter, Publisher};

/// Everything a request handler can reach
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub publisher: Arc<Publisher>,
    pub emitter: Arc<Emitter>,
    pub admin: AdminControl,
    pub config: Arc<HubConfig>,
}

impl AppState {
    pub async fn new(config: HubConfig) -> Result<Self, RelayError> {
        let hub = Arc::new(RelayHub::with_queue_capacity(config.queue_capacity));
        let publisher = Arc::new(Publisher::new(hub.clone(), &config.destinations).await?);
        let emitter = Arc::new(Emitter::new(publisher.clone(), config.emitter.clone()));
        Ok(Self {
            admin: AdminControl::new(hub.clone()),
            hub,
            publisher,
            emitter,
            config: Arc::new(config),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/ws", get(connection::ws_handler))
        .route("/dashboard/ws", get(dashboard::ws_handler))
        .route("/api/status", get(api::status))
        .route("/api/receivers", get(api::receivers))
        .route("/api/receivers/prune", post(api::prune))
        .route("/api/receivers/{id}/disconnect", post(api::disconnect))
        .route("/api/send", post(api::send))
        .route("/api/emitter/start", post(api::start_emitter))
        .route("/api/emitter/stop", post(api::stop_emitter))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api::require_api_key,
        ));

    Router::new()
        .route("/", get(|| async { "OSC Relay Hub" }))
        .route("/health", get(|| async { Json("OK") }))
        .merge(protected)
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &HubConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("x-api-key")])
}

/// Mark silent receivers offline every `every`.
pub fn spawn_reaper(hub: Arc<RelayHub>, every: Duration, stale_after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = hub.reap_stale(stale_after);
            if !reaped.is_empty() {
                tracing::info!(count = reaped.len(), "Reaped stale receivers");
            }
        }
    })
}

/// Serve on `listener` until `shutdown` resolves.
///
/// On shutdown the emitter stops and every receiver socket is closed so
/// in-flight connections can drain.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if !state.config.auth_enabled() {
        tracing::warn!("No API keys configured, accepting every connection");
    }

    let reaper = spawn_reaper(
        state.hub.clone(),
        state.config.ping_interval(),
        state.config.stale_timeout(),
    );

    let hub = state.hub.clone();
    let emitter = state.emitter.clone();
    let signal = async move {
        shutdown.await;
        tracing::info!("Shutting down hub");
        emitter.stop();
        hub.shutdown();
    };

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(signal)
        .await
        .context("hub server failed");

    reaper.abort();
    result
}

/// Bind the configured address and run until Ctrl-C.
pub async fn start(config: HubConfig) -> Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let state = AppState::new(config).await?;

    println!(
        "{} Hub running at {}",
        "✓".green(),
        format!("http://{}", addr).bright_blue()
    );
    println!(
        "  {} receivers connect to {}",
        "→".bright_black(),
        format!("ws://{}/ws", addr).bright_white()
    );
    for dest in state.publisher.destinations() {
        println!("  {} mirroring OSC to {}", "→".bright_black(), dest.to_string().bright_white());
    }

    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
