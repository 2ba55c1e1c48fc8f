use std::convert::Infallible;

use async_stream::stream;
use axum::Json;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use super::{ApiError, AppState};
use crate::llm::ModelInfo;
use crate::models::{DocumentMetadata, Query as Question, RagAnswer, ScoredChunk};

const DEFAULT_SEARCH_TOP_K: usize = 5;

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

#[derive(Debug, Deserialize)]
pub struct AskParams {
    #[serde(default)]
    q: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    q: String,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(rename = "topK")]
    top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct IngestParams {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    query: String,
    result_count: usize,
    results: Vec<SearchHit>,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    filename: String,
    path: String,
    content: String,
    metadata: HitMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HitMetadata {
    #[serde(flatten)]
    document: DocumentMetadata,
    chunk_index: usize,
    total_chunks: usize,
    score: f64,
}

impl From<ScoredChunk> for SearchHit {
    fn from(hit: ScoredChunk) -> Self {
        let chunk = hit.chunk;
        Self {
            filename: chunk.metadata.filename.clone(),
            path: chunk.metadata.source.clone(),
            content: chunk.text,
            metadata: HitMetadata {
                document: chunk.metadata,
                chunk_index: chunk.chunk_index,
                total_chunks: chunk.total_chunks,
                score: hit.score,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    status: &'static str,
    documents_processed: usize,
    force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    indexed_file_count: usize,
    documents_path: String,
    file_watcher_active: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsResponse {
    default_model: String,
    available: Vec<ModelInfo>,
}

pub async fn ask_post(
    State(state): State<AppState>,
    Json(question): Json<Question>,
) -> Result<Json<RagAnswer>, ApiError> {
    Ok(Json(state.rag.ask(&question.question).await?))
}

pub async fn ask_get(
    State(state): State<AppState>,
    Query(params): Query<AskParams>,
) -> Result<Json<RagAnswer>, ApiError> {
    Ok(Json(state.rag.ask(&params.q).await?))
}

fn error_event(message: String) -> EventStream {
    futures::stream::once(async move { Ok(Event::default().event("error").data(message)) }).boxed()
}

/// Server-sent events, one `{"content": fragment}` per generated piece.
///
/// A disconnecting client drops the event stream, which drops the
/// generation stream feeding it.
pub async fn ask_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Sse<EventStream> {
    let mut fragments = match state.rag.ask_stream(&params.q, params.model.as_deref()).await {
        Ok(fragments) => fragments,
        Err(e) => return Sse::new(error_event(e.to_string())),
    };

    let events = stream! {
        while let Some(item) = fragments.next().await {
            match item {
                Ok(content) => match Event::default().json_data(json!({ "content": content })) {
                    Ok(event) => yield Ok::<_, Infallible>(event),
                    Err(e) => error!("Failed to encode stream event: {e}"),
                },
                Err(e) => {
                    error!("Answer stream failed: {e}");
                    yield Ok::<_, Infallible>(Event::default().event("error").data(e.to_string()));
                    break;
                }
            }
        }
    };

    Sse::new(events.boxed()).keep_alive(KeepAlive::default())
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let top_k = params.top_k.unwrap_or(DEFAULT_SEARCH_TOP_K);
    let hits = state.rag.search(&params.q, top_k).await?;

    let results: Vec<SearchHit> = hits.into_iter().map(SearchHit::from).collect();
    Ok(Json(SearchResponse {
        query: params.q.trim().to_string(),
        result_count: results.len(),
        results,
    }))
}

/// Runs synchronously on the request; responds once the scan completes.
pub async fn ingest(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
) -> Json<IngestResponse> {
    info!(force = params.force, "Manual ingestion requested");
    let processed = state.ingestor.ingest_all(params.force).await;
    Json(IngestResponse {
        status: "completed",
        documents_processed: processed,
        force: params.force,
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.ingestor.stats();
    Json(StatsResponse {
        indexed_file_count: stats.processed_file_count,
        documents_path: stats.documents_path,
        file_watcher_active: state.watcher.is_active(),
    })
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "UP", "service": "notebrain" }))
}

pub async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        default_model: state.rag.default_model().to_string(),
        available: state.rag.available_models().await,
    })
}
