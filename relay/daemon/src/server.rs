//! HTTP Server Implementation
//!
//! This module provides the relay's HTTP surface:
//! - Routes requests to the `ChatService` handlers
//! - Maps relay errors to status codes with short JSON messages
//! - Runs the idle-session sweeper when eviction is configured
//! - Supports graceful shutdown
//!
//! # Endpoints
//!
//! ```text
//!   POST /start           {systemInstruction, userMessage, model?} -> {chatId}
//!   POST /send            {chatId, userMessage}                    -> {chatId}
//!   GET  /poll/{chatId}                                            -> {chunks, done}
//!   GET  /health                                                   -> {status, sessions}
//! ```

use std::future::Future;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use relay_core::config::SessionSettings;
use relay_core::{ChatService, RelayError, SendMessage, SessionStore, StartChat};

/// `{chatId}` response of `/start` and `/send`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatIdResponse {
    chat_id: String,
}

/// `/poll` response
#[derive(Debug, Serialize)]
struct PollResponse {
    chunks: Vec<String>,
    done: bool,
}

/// `/health` response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

/// Relay error rendered as an HTTP response
#[derive(Debug)]
struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the relay router
pub fn router(service: ChatService) -> Router {
    Router::new()
        .route("/start", post(start_chat))
        .route("/send", post(send_message))
        .route("/poll/{chat_id}", get(poll_chat))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Unparseable bodies count as missing input
fn body_or_default<T: Default>(payload: Result<Json<T>, JsonRejection>) -> T {
    match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            debug!(error = %rejection, "Unreadable request body");
            T::default()
        }
    }
}

async fn start_chat(
    State(service): State<ChatService>,
    payload: Result<Json<StartChat>, JsonRejection>,
) -> Result<Json<ChatIdResponse>, ApiError> {
    let accepted = service.start(body_or_default(payload)).await?;
    Ok(Json(ChatIdResponse {
        chat_id: accepted.chat_id.to_string(),
    }))
}

async fn send_message(
    State(service): State<ChatService>,
    payload: Result<Json<SendMessage>, JsonRejection>,
) -> Result<Json<ChatIdResponse>, ApiError> {
    let accepted = service.send(body_or_default(payload)).await?;
    Ok(Json(ChatIdResponse {
        chat_id: accepted.chat_id.to_string(),
    }))
}

async fn poll_chat(
    State(service): State<ChatService>,
    Path(chat_id): Path<String>,
) -> Result<Json<PollResponse>, ApiError> {
    let drained = service.poll(&chat_id)?;
    Ok(Json(PollResponse {
        chunks: drained.chunks,
        done: drained.done,
    }))
}

async fn health(State(service): State<ChatService>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: service.store().len(),
    })
}

/// Periodically evict idle sessions
///
/// Returns `None` when no idle timeout is configured: sessions then live for
/// the lifetime of the process.
pub fn spawn_sweeper(store: SessionStore, settings: &SessionSettings) -> Option<JoinHandle<()>> {
    let idle_timeout = settings.idle_timeout()?;
    let sweep_interval = settings.sweep_interval();

    info!(
        idle_timeout_secs = idle_timeout.as_secs(),
        sweep_interval_secs = sweep_interval.as_secs(),
        "Idle session eviction enabled"
    );

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            store.evict_idle(idle_timeout);
        }
    }))
}

/// The relay HTTP server
pub struct RelayServer {
    service: ChatService,
    sessions: SessionSettings,
}

impl RelayServer {
    /// Create a server for a service
    pub fn new(service: ChatService, sessions: SessionSettings) -> Self {
        Self { service, sessions }
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().context("Listener has no local address")?;
        let sweeper = spawn_sweeper(self.service.store().clone(), &self.sessions);
        if sweeper.is_none() {
            info!("Idle session eviction disabled, sessions live until restart");
        }

        info!(%addr, "Chat relay listening on http://{addr}");

        let result = axum::serve(listener, router(self.service))
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server failed");

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
