//! Vector index contract and implementations.
//!
//! The ingestion pipeline and the retrieval service only ever talk to
//! [`VectorIndex`]; how vectors are computed and compared is the index's
//! business.
pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::embedder::EmbedderError;
use crate::models::{Chunk, ScoredChunk};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("storage failed: {0}")]
    Storage(String),

    /// The snapshot could not be read or written (I/O, permissions).
    #[error("snapshot failed: {0}")]
    Snapshot(String),

    /// The snapshot was read but its contents cannot be decoded.
    #[error("snapshot is corrupt: {0}")]
    CorruptSnapshot(String),

    #[error("index unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for IndexError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Submit a batch of chunks. Chunks of a source replace that source's
    /// previously stored chunks.
    async fn add(&self, chunks: &[Chunk]) -> Result<(), IndexError>;

    /// Drop every chunk stored for `source`; returns how many were removed.
    async fn remove_source(&self, source: &Path) -> Result<usize, IndexError>;

    /// The `top_k` chunks most similar to `query`, most similar first.
    async fn similarity_search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, IndexError>;

    /// Serialize the entire index to `path`, overwriting it.
    async fn save(&self, path: &Path) -> Result<(), IndexError>;

    /// Replace the index contents with the snapshot at `path`; returns the chunk count.
    async fn load(&self, path: &Path) -> Result<usize, IndexError>;

    /// Source path → last-modified time of every document the index holds.
    async fn indexed_sources(&self) -> Result<HashMap<PathBuf, DateTime<Utc>>, IndexError>;
}
