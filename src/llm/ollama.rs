/// Ollama HTTP client.
///
/// Serves both as the chat [`Generator`] and as the [`Embedder`] behind the
/// vector index. Transport failures are rendered with their full source chain
/// so timeouts, resets and 5xx statuses stay recognizable to callers that
/// classify errors by message.
///
/// `timeout_secs` bounds connecting and every read. Calls that return one
/// JSON document are also capped end to end; a streamed chat only fails
/// when the backend goes quiet for that long.
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{FragmentStream, GenerationError, Generator, ModelInfo};
use crate::config::OllamaConfig;
use crate::embedder::{Embedder, EmbedderError};

pub struct OllamaClient {
    http: reqwest::Client,
    /// End-to-end cap for non-streaming calls.
    request_timeout: Duration,
    base_url: String,
    embedding_model: String,
    dimensions: usize,
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    details: Option<TagDetails>,
}

#[derive(Deserialize)]
struct TagDetails {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    parameter_size: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Result<Self, GenerationError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(concat!("notebrain/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GenerationError::Request(describe(&e)))?;

        Ok(Self {
            http,
            request_timeout: timeout,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            embedding_model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }

    async fn post_chat(
        &self,
        system: &str,
        question: &str,
        model: &str,
        stream: bool,
    ) -> Result<reqwest::Response, GenerationError> {
        let body = ChatRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: question,
                },
            ],
            stream,
        };

        debug!(model, stream, "POST /api/chat");
        let mut request = self.http.post(self.url("/api/chat")).json(&body);
        if !stream {
            request = request.timeout(self.request_timeout);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| GenerationError::Request(describe(&e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn complete(
        &self,
        system: &str,
        question: &str,
        model: &str,
    ) -> Result<String, GenerationError> {
        let resp = self.post_chat(system, question, model, false).await?;
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(describe(&e)))?;

        if let Some(err) = parsed.error {
            return Err(GenerationError::InvalidResponse(err));
        }
        parsed
            .message
            .map(|m| m.content)
            .ok_or_else(|| GenerationError::InvalidResponse("missing message".to_string()))
    }

    async fn stream(
        &self,
        system: &str,
        question: &str,
        model: &str,
    ) -> Result<FragmentStream, GenerationError> {
        let resp = self.post_chat(system, question, model, true).await?;
        let body = resp
            .bytes_stream()
            .map(|piece| piece.map_err(|e| GenerationError::Stream(describe(&e))));

        Ok(Box::pin(ndjson_fragments(body)))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, GenerationError> {
        let resp = self
            .http
            .get(self.url("/api/tags"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| GenerationError::Request(describe(&e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(describe(&e)))?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| {
                let (family, parameter_size) = match m.details {
                    Some(d) => (d.family, d.parameter_size),
                    None => (None, None),
                };
                ModelInfo {
                    name: m.name,
                    family,
                    parameter_size,
                    size_bytes: m.size,
                }
            })
            .collect())
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        self.embed_batch(&[text])
            .await?
            .pop()
            .ok_or_else(|| EmbedderError::InvalidResponse("no embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let resp = self
            .http
            .post(self.url("/api/embed"))
            .json(&EmbedRequest {
                model: &self.embedding_model,
                input: texts,
            })
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| EmbedderError::RequestFailed(describe(&e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EmbedderError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbedderError::InvalidResponse(describe(&e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbedderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        if let Some(bad) = parsed.embeddings.iter().find(|v| v.len() != self.dimensions) {
            return Err(EmbedderError::InvalidResponse(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                bad.len()
            )));
        }

        Ok(parsed.embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Render a reqwest error with its whole source chain.
fn describe(err: &reqwest::Error) -> String {
    let mut msg = if err.is_timeout() {
        format!("timeout: {err}")
    } else {
        err.to_string()
    };
    let mut source = std::error::Error::source(err);
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

/// Decode a newline-delimited JSON chat body into content fragments.
///
/// Production is driven by polling: when the consumer drops the returned
/// stream, `body` (and the HTTP connection behind it) is dropped too.
fn ndjson_fragments<S, B>(body: S) -> impl Stream<Item = Result<String, GenerationError>> + Send
where
    S: Stream<Item = Result<B, GenerationError>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    try_stream! {
        let mut body = Box::pin(body);
        let mut buf: Vec<u8> = Vec::new();
        while let Some(piece) = body.next().await {
            buf.extend_from_slice(piece?.as_ref());
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(fragment) = parse_chat_line(&line)? {
                    yield fragment;
                }
            }
        }
        if let Some(fragment) = parse_chat_line(&buf)? {
            yield fragment;
        }
    }
}

fn parse_chat_line(line: &[u8]) -> Result<Option<String>, GenerationError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: ChatResponse = serde_json::from_str(line)
        .map_err(|e| GenerationError::InvalidResponse(format!("bad stream line: {e}")))?;

    if let Some(err) = parsed.error {
        return Err(GenerationError::Stream(err));
    }

    Ok(parsed
        .message
        .map(|m| m.content)
        .filter(|content| !content.is_empty()))
}
