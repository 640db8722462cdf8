//! REST surface for AMI actions.
//!
//! Endpoints:
//! - `POST /action/{action}`: JSON arguments, returns the list of results
//! - `POST /action/Command`: `{"command": ".."}`, returns `{"response": [..]}`
//! - `GET /status`: aggregated component status

mod error;

pub use error::ApiError;

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::ami::codec::ActionArgs;
use crate::dispatch::{ActionDispatcher, COMMAND_ACTION};
use crate::health::StatusAggregator;

/// REST listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestApiConfig {
    pub host: String,
    pub port: u16,
    pub cors: CorsConfig,
}

impl Default for RestApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9491,
            cors: CorsConfig::default(),
        }
    }
}

impl RestApiConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Allowed origins. Empty allows any origin.
    pub allow_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_origins: Vec::new(),
        }
    }
}

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    dispatcher: ActionDispatcher,
    status: Arc<StatusAggregator>,
}

impl AppState {
    pub fn new(dispatcher: ActionDispatcher, status: Arc<StatusAggregator>) -> Self {
        Self { dispatcher, status }
    }
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(
    state: AppState,
    config: &RestApiConfig,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, &config.cors);
    let listener = tokio::net::TcpListener::bind(config.address()).await?;
    let local = listener.local_addr()?;
    info!(address = %local, "REST API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(state: AppState, cors: &CorsConfig) -> Router {
    let router = Router::new()
        .route("/action/:action", post(run_action))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors.enabled {
        router.layer(cors_layer(cors))
    } else {
        router
    }
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if config.allow_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Serialize)]
struct CommandResponse {
    response: Vec<String>,
}

async fn run_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body = parse_body(&body)?;

    if action.eq_ignore_ascii_case(COMMAND_ACTION) {
        let request: CommandRequest = serde_json::from_value(body)
            .map_err(|e| ApiError::BadRequest(format!("invalid command request: {e}")))?;
        let lines = state.dispatcher.command(&request.command).await?;
        return Ok(Json(CommandResponse { response: lines }).into_response());
    }

    let args = ActionArgs::from_json(&body);
    let results = state.dispatcher.dispatch(&action, &args).await?;
    Ok(Json(results).into_response())
}

fn parse_body(body: &[u8]) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Map::new())),
        _ => Err(ApiError::BadRequest(
            "request body must be a JSON object".to_string(),
        )),
    }
}

async fn status(State(state): State<AppState>) -> Json<Map<String, Value>> {
    Json(state.status.status())
}

#[cfg(test)]
mod tests;
