//! Relay HTTP server: axum router and the generate endpoint.
//!
//! Validation and configuration failures are rejected with structured
//! JSON bodies before any streaming begins; once a stream starts, every
//! failure travels in-band as an `error` frame.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Credentials, ServerConfig, WorkerConfig};
use crate::relay::SseRelay;
use crate::session::run_session;

/// Buffer size of the channel backing each SSE response body.
const RELAY_CHANNEL_BUFFER: usize = 256;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Worker command configuration.
    pub worker: Arc<WorkerConfig>,
}

impl AppState {
    /// Create new app state for the given worker configuration.
    #[must_use]
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            worker: Arc::new(worker),
        }
    }
}

/// Request body for POST /api/generate.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    /// Free-text prompt passed to the worker.
    pub prompt: Option<String>,
}

/// Structured error body for pre-stream rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error description.
    pub error: String,
}

impl ErrorResponse {
    /// Create a new error response.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Build the axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/generate", post(post_generate))
        .route("/healthz", get(get_health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Run the server on the configured address until ctrl-c.
///
/// # Errors
///
/// Returns an error if the server fails to bind or serve.
pub async fn run(config: &ServerConfig, state: AppState) -> std::io::Result<()> {
    let addr = config.address();
    let app = build_router(state);

    tracing::info!(address = %addr, "Starting relay server");

    let listener = TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Relay server shutting down gracefully");
        })
        .await
}

/// GET /healthz - liveness probe.
async fn get_health() -> StatusCode {
    StatusCode::OK
}

/// POST /api/generate - start a worker session and stream its events.
///
/// Rejects before streaming on a missing prompt (400) or missing
/// credential environment (500); otherwise responds with an SSE stream
/// fed by the session task.
pub async fn post_generate(
    State(state): State<AppState>,
    body: Option<Json<GenerateRequest>>,
) -> Response {
    let prompt = body
        .and_then(|Json(request)| request.prompt)
        .map(|prompt| prompt.trim().to_string())
        .filter(|prompt| !prompt.is_empty());

    let Some(prompt) = prompt else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Prompt is required")),
        )
            .into_response();
    };

    let credentials = match Credentials::from_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            tracing::error!(error = %e, "Refusing to start session");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.to_string())),
            )
                .into_response();
        }
    };

    let (relay, rx) = SseRelay::channel(RELAY_CHANNEL_BUFFER);
    let worker = Arc::clone(&state.worker);
    tokio::spawn(async move {
        run_session(&worker, &credentials, &prompt, relay).await;
    });

    let stream =
        ReceiverStream::new(rx).map(|data| Ok::<_, Infallible>(Event::default().data(data)));

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}
