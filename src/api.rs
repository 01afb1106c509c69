//! HTTP control surface
//!
//! Thin axum layer over [`SupervisorHandle`], [`ConfigValidator`] and
//! [`ResourceInspector`]. Request bodies are parsed leniently into
//! [`RawMiningConfig`] so that every problem, malformed JSON included, is
//! reported as a structured validation error.

use crate::error::{Error, ValidationErrors};
use crate::resources::{ResourceInspector, ResourceSnapshot};
use crate::supervisor::{LogLine, SupervisorHandle, XmrigPreview};
use crate::types::{MiningConfig, RawMiningConfig, StopOutcome, SupervisorStatus};
use crate::validator::ConfigValidator;
use crate::{APP_NAME, APP_VERSION};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_LOG_LINES: usize = 50;

/// Shared state handed to every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub supervisor: SupervisorHandle,
    pub validator: Arc<ConfigValidator>,
    pub inspector: ResourceInspector,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<ValidationErrors>,
}

/// Error response with a stable machine-readable code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    errors: Option<ValidationErrors>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            errors: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        debug!(category = err.category(), "Request failed: {}", err);
        match err {
            Error::Validation(errors) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "validation_error",
                message: format!("invalid mining configuration: {}", errors),
                errors: Some(errors),
            },
            Error::Conflict { message } => Self::new(StatusCode::CONFLICT, "conflict", message),
            Error::Spawn { message } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "spawn_failed", message)
            }
            Error::ChannelClosed { message } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "supervisor_unavailable",
                message,
            ),
            Error::Config { message } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "config_error", message)
            }
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                other.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(code = self.code, "{}", self.message);
        }
        (
            self.status,
            Json(ApiErrorBody {
                code: self.code,
                message: self.message,
                errors: self.errors,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct RootResponse {
    message: String,
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    status: &'static str,
    run_id: Uuid,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    config: MiningConfig,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    status: &'static str,
    #[serde(flatten)]
    outcome: StopOutcome,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    supervisor: SupervisorStatus,
    system: ResourceSnapshot,
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    status: &'static str,
    #[serde(flatten)]
    preview: XmrigPreview,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    capacity: usize,
    lines: Vec<LogLine>,
}

/// Build the router with tracing and the optional CORS policy applied
pub fn router(state: AppState, cors_origin: Option<&str>) -> crate::Result<Router> {
    let mut app = Router::new()
        .route("/", get(get_root))
        .route("/start", post(post_start))
        .route("/stop", post(post_stop))
        .route("/status", get(get_status))
        .route("/system", get(get_system))
        .route("/config", post(post_config))
        .route("/logs", get(get_logs))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if let Some(origin) = cors_origin {
        app = app.layer(build_cors_layer(origin)?);
    }

    Ok(app)
}

fn build_cors_layer(origin: &str) -> crate::Result<CorsLayer> {
    let origin = origin.trim();
    if origin == "*" {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }

    let value = HeaderValue::from_str(origin)
        .map_err(|e| Error::config(format!("invalid CORS origin '{}': {}", origin, e)))?;
    Ok(CorsLayer::new()
        .allow_origin(value)
        .allow_methods(Any)
        .allow_headers(Any))
}

/// Decode a request body into the raw configuration shape
fn parse_config_body(body: &[u8]) -> Result<RawMiningConfig, Error> {
    let invalid = |message: String| {
        let mut errors = ValidationErrors::new();
        errors.push("body", message);
        Error::Validation(errors)
    };

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(invalid("request body must be a JSON object".to_string()));
    }

    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| invalid(format!("malformed JSON: {}", e)))?;
    if !value.is_object() {
        return Err(invalid("request body must be a JSON object".to_string()));
    }

    serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
}

async fn get_root() -> Json<RootResponse> {
    Json(RootResponse {
        message: format!("{} API", APP_NAME),
        status: "online",
        version: APP_VERSION,
    })
}

async fn post_start(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<StartResponse>, ApiError> {
    let raw = parse_config_body(&body)?;
    let config = state.validator.validate(&raw)?;
    let outcome = state.supervisor.start(config).await?;

    info!(run_id = %outcome.run_id, pid = ?outcome.pid, "Mining started");

    Ok(Json(StartResponse {
        status: "started",
        run_id: outcome.run_id,
        pid: outcome.pid,
        started_at: outcome.started_at,
        config: outcome.config,
    }))
}

async fn post_stop(State(state): State<AppState>) -> Result<Json<StopResponse>, ApiError> {
    let outcome = state.supervisor.stop().await?;
    let status = if outcome.was_running {
        "stopped"
    } else {
        "not_running"
    };
    Ok(Json(StopResponse { status, outcome }))
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let supervisor = state.supervisor.status();
    let system = state.inspector.snapshot().await;
    Json(StatusResponse { supervisor, system })
}

async fn get_system(State(state): State<AppState>) -> Json<ResourceSnapshot> {
    Json(state.inspector.snapshot().await)
}

async fn post_config(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ConfigResponse>, ApiError> {
    let raw = parse_config_body(&body)?;
    let config = state.validator.validate(&raw)?;
    let preview = state.supervisor.write_config(config).await?;
    Ok(Json(ConfigResponse {
        status: "written",
        preview,
    }))
}

async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<LogsResponse> {
    let capacity = state.supervisor.log_capacity();
    let count = query.lines.unwrap_or(DEFAULT_LOG_LINES).min(capacity);
    Json(LogsResponse {
        capacity,
        lines: state.supervisor.logs(count),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_config_body() {
        let raw = parse_config_body(br#"{"cpu_cores_num": 2, "pool_url": "p:1"}"#).unwrap();
        assert_eq!(raw.cpu_cores_num, Some(2));
        assert_eq!(raw.pool_url.as_deref(), Some("p:1"));
    }

    #[test]
    fn test_parse_config_body_rejects_garbage() {
        let bodies: [&[u8]; 5] = [
            b"",
            b"  ",
            b"not json",
            b"[1, 2]",
            br#"{"cpu_cores_num": "four"}"#,
        ];
        for body in bodies {
            let err = parse_config_body(body).unwrap_err();
            assert_matches!(err, Error::Validation(ref errors) if errors.contains("body"));
        }
    }

    #[test]
    fn test_error_status_mapping() {
        let mut errors = ValidationErrors::new();
        errors.push("pool_url", "is required");
        assert_eq!(
            ApiError::from(Error::Validation(errors)).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(Error::conflict("busy")).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(Error::spawn("missing")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(Error::channel_closed("gone")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_cors_origin_parsing() {
        assert!(build_cors_layer("*").is_ok());
        assert!(build_cors_layer("http://localhost:3000").is_ok());
        assert!(build_cors_layer("bad\norigin").is_err());
    }
}
