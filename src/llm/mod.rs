//! Language-model generation contract.
//!
//! The answer is produced by an external chat service. Complete answers and
//! streamed fragments both go through [`Generator`]; streams are pull-based,
//! so dropping one stops upstream production.
pub mod mock;
pub mod ollama;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

/// Ordered fragments of a streamed answer.
pub type FragmentStream = BoxStream<'static, Result<String, GenerationError>>;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generation response invalid: {0}")]
    InvalidResponse(String),

    #[error("generation stream failed: {0}")]
    Stream(String),
}

/// A model the backend can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    pub family: Option<String>,
    pub parameter_size: Option<String>,
    pub size_bytes: Option<u64>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a complete answer to `question` under `system` instructions.
    async fn complete(
        &self,
        system: &str,
        question: &str,
        model: &str,
    ) -> Result<String, GenerationError>;

    /// Same as [`complete`](Generator::complete) but fragment by fragment.
    async fn stream(
        &self,
        system: &str,
        question: &str,
        model: &str,
    ) -> Result<FragmentStream, GenerationError>;

    /// Models the backend reports as available.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, GenerationError>;
}
