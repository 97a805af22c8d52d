use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::admin::DisconnectAck;
use crate::config::Destination;
use crate::error::{ErrorCategory, RelayError};
use crate::hub::ReceiverSummary;
use crate::protocol::EventValue;
use crate::publisher::{EmitterOverrides, EmitterStart, EmitterStatus};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_PARAM: &str = "api_key";

/// JSON error body with a status code
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "success": false, "message": self.1 }))).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = match err.category() {
            ErrorCategory::Auth => StatusCode::UNAUTHORIZED,
            ErrorCategory::Validation | ErrorCategory::Protocol | ErrorCategory::Configuration => {
                match err {
                    RelayError::NotFound(_) => StatusCode::NOT_FOUND,
                    _ => StatusCode::BAD_REQUEST,
                }
            }
            ErrorCategory::Network | ErrorCategory::Forward => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

/// Reject requests without a configured API key.
///
/// The key is read from the `x-api-key` header, falling back to the
/// `api_key` query parameter for WebSocket clients that cannot set headers.
pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.config.auth_enabled() {
        return next.run(req).await;
    }

    let presented = presented_key(req.headers(), req.uri().query());
    match presented {
        Some(key) if state.config.api_keys.iter().any(|k| *k == key) => next.run(req).await,
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "Rejected invalid API key");
            ApiError::from(RelayError::Auth("invalid API key".into())).into_response()
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "Rejected request without API key");
            ApiError::from(RelayError::Auth("API key required".into())).into_response()
        }
    }
}

fn presented_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == API_KEY_PARAM)
            .map(|(_, v)| v.into_owned())
    })
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub emitter: EmitterStatus,
    pub destinations: Vec<Destination>,
    pub receivers: usize,
    pub active_receivers: usize,
    pub connected: bool,
    pub published: u64,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        emitter: state.emitter.status(),
        destinations: state.publisher.destinations(),
        receivers: state.hub.len(),
        active_receivers: state.hub.active_count(),
        connected: state.admin.is_connected(),
        published: state.publisher.published(),
    })
}

pub async fn receivers(State(state): State<AppState>) -> Json<Vec<ReceiverSummary>> {
    Json(state.admin.snapshot())
}

pub async fn disconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<DisconnectAck>) {
    let ack = state.admin.disconnect(&id);
    let status = if ack.success {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(ack))
}

pub async fn prune(State(state): State<AppState>) -> Json<serde_json::Value> {
    let removed = state.admin.prune();
    Json(json!({ "success": true, "removed": removed }))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub address: String,
    #[serde(default)]
    pub value: EventValue,
}

pub async fn send(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state.publisher.publish(&req.address, req.value).await?;
    Ok(Json(json!({
        "success": true,
        "delivered": report.delivered.len(),
        "dropped": report.dropped.len(),
    })))
}

pub async fn start_emitter(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let overrides: EmitterOverrides = if body.iter().all(u8::is_ascii_whitespace) {
        EmitterOverrides::default()
    } else {
        serde_json::from_slice(&body).map_err(RelayError::from)?
    };

    let outcome = state.emitter.start(overrides)?;
    let message = match outcome {
        EmitterStart::Started => "Random emitter started",
        EmitterStart::AlreadyRunning => "already running",
    };
    Ok(Json(json!({
        "success": true,
        "message": message,
        "emitter": state.emitter.status(),
    })))
}

pub async fn stop_emitter(State(state): State<AppState>) -> Json<serde_json::Value> {
    let was_running = state.emitter.stop();
    let message = if was_running {
        "Random emitter stopped"
    } else {
        "not running"
    };
    Json(json!({ "success": true, "message": message }))
}
