//! HTTP API: question answering, search, ingestion control and status.
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ingest::Ingestor;
use crate::rag::{RagError, RagService};
use crate::watcher::FileWatcher;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub rag: Arc<RagService>,
    pub ingestor: Arc<Ingestor>,
    pub watcher: Arc<FileWatcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ask", post(routes::ask_post).get(routes::ask_get))
        .route("/api/ask/stream", get(routes::ask_stream))
        .route("/api/search", get(routes::search))
        .route("/api/ingest", post(routes::ingest))
        .route("/api/stats", get(routes::stats))
        .route("/api/health", get(routes::health))
        .route("/api/models", get(routes::models))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: AppState, host: &str, port: u16, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    let addr: SocketAddr = listener.local_addr().context("listener has no local address")?;
    info!("HTTP API listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("HTTP API stopped");
    Ok(())
}

/// Error body returned by every endpoint: `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<RagError> for ApiError {
    fn from(e: RagError) -> Self {
        match e {
            RagError::Validation(msg) => Self::bad_request(msg),
            other => {
                error!("Request failed: {other}");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: other.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
