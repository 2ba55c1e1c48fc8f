/// SQLite + sqlite-vec backed vector index.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::ErrorCode;
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use super::{IndexError, VectorIndex};
use crate::db::Db;
use crate::embedder::Embedder;
use crate::models::{Chunk, ScoredChunk};

pub struct SqliteIndex {
    db: Arc<TokioMutex<Db>>,
    embedder: Arc<dyn Embedder>,
    similarity_threshold: f64,
}

impl SqliteIndex {
    pub fn new(embedder: Arc<dyn Embedder>, similarity_threshold: f64) -> Result<Self, IndexError> {
        let db = Db::open_in_memory(embedder.dimensions())?;
        Ok(Self {
            db: Arc::new(TokioMutex::new(db)),
            embedder,
            similarity_threshold,
        })
    }

    pub async fn chunk_count(&self) -> Result<usize, IndexError> {
        Ok(self.db.lock().await.count_chunks()?)
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn add(&self, chunks: &[Chunk]) -> Result<(), IndexError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let mut db = self.db.lock().await;
        db.replace_chunks(chunks, &vectors)?;
        debug!("Stored {} chunks", chunks.len());
        Ok(())
    }

    async fn remove_source(&self, source: &Path) -> Result<usize, IndexError> {
        let removed = self
            .db
            .lock()
            .await
            .delete_source(&source.to_string_lossy())?;
        debug!("Removed {removed} chunks of {}", source.display());
        Ok(removed)
    }

    async fn similarity_search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        let query_vector = self.embedder.embed(query).await?;

        let db = self.db.lock().await;
        let results = db.search(&query_vector, top_k)?;

        Ok(results
            .into_iter()
            .filter(|r| r.similarity >= self.similarity_threshold)
            .map(|r| ScoredChunk {
                chunk: r.chunk,
                score: r.similarity,
            })
            .collect())
    }

    async fn save(&self, path: &Path) -> Result<(), IndexError> {
        let db = self.db.lock().await;
        db.save_snapshot(path)
            .map_err(|e| IndexError::Snapshot(format!("{}: {e}", path.display())))
    }

    async fn load(&self, path: &Path) -> Result<usize, IndexError> {
        let mut db = self.db.lock().await;
        db.load_snapshot(path)
            .map_err(|e| snapshot_load_error(path, e))
    }

    async fn indexed_sources(&self) -> Result<HashMap<PathBuf, DateTime<Utc>>, IndexError> {
        let db = self.db.lock().await;
        Ok(db
            .list_sources()?
            .into_iter()
            .map(|(source, modified)| (PathBuf::from(source), modified))
            .collect())
    }
}

/// Failures opening or reading the file are I/O; anything else means the
/// file is not a usable snapshot.
fn snapshot_load_error(path: &Path, e: rusqlite::Error) -> IndexError {
    let message = format!("{}: {e}", path.display());
    match e.sqlite_error_code() {
        Some(
            ErrorCode::CannotOpen
            | ErrorCode::PermissionDenied
            | ErrorCode::SystemIoFailure
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::DiskFull
            | ErrorCode::OutOfMemory,
        ) => IndexError::Snapshot(message),
        _ => IndexError::CorruptSnapshot(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::mock::MockEmbedder;
    use crate::models::Document;

    fn chunks(path: &str, texts: &[&str]) -> Vec<Chunk> {
        let doc = Document::new(Path::new(path), texts.join("\n\n"), Utc::now());
        Chunk::tag_all(&doc, texts.iter().map(|t| t.to_string()).collect())
    }

    fn index() -> SqliteIndex {
        SqliteIndex::new(Arc::new(MockEmbedder::default()), 0.0).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_search() {
        let index = index();
        index
            .add(&chunks("/kb/rust.md", &["Rust ownership and borrowing rules"]))
            .await
            .unwrap();
        index
            .add(&chunks("/kb/bread.txt", &["Banana bread needs ripe bananas"]))
            .await
            .unwrap();

        let hits = index.similarity_search("ownership rules", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.metadata.filename, "rust.md");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_threshold_filters_weak_matches() {
        let index = SqliteIndex::new(Arc::new(MockEmbedder::default()), 0.99).unwrap();
        index
            .add(&chunks("/kb/bread.txt", &["Banana bread needs ripe bananas"]))
            .await
            .unwrap();

        let hits = index.similarity_search("quantum chromodynamics", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_readd_replaces_source() {
        let index = index();
        index.add(&chunks("/kb/a.md", &["one", "two", "three"])).await.unwrap();
        index.add(&chunks("/kb/a.md", &["only"])).await.unwrap();
        assert_eq!(index.chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_source() {
        let index = index();
        index.add(&chunks("/kb/a.md", &["one", "two"])).await.unwrap();
        index.add(&chunks("/kb/b.md", &["three"])).await.unwrap();

        assert_eq!(index.remove_source(Path::new("/kb/a.md")).await.unwrap(), 2);
        assert_eq!(index.chunk_count().await.unwrap(), 1);
        let sources = index.indexed_sources().await.unwrap();
        assert!(!sources.contains_key(Path::new("/kb/a.md")));
    }

    #[tokio::test]
    async fn test_garbage_snapshot_is_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("store.db");
        std::fs::write(&path, vec![0x5a_u8; 4096]).unwrap();

        let index = index();
        assert!(matches!(
            index.load(&path).await,
            Err(IndexError::CorruptSnapshot(_))
        ));
        // The live store is still usable afterwards
        index.add(&chunks("/kb/a.md", &["after"])).await.unwrap();
        assert_eq!(index.chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_sources() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("store.db");

        let index = index();
        index.add(&chunks("/kb/a.md", &["alpha text"])).await.unwrap();
        index.save(&path).await.unwrap();

        let restored = self::index();
        assert_eq!(restored.load(&path).await.unwrap(), 1);
        let sources = restored.indexed_sources().await.unwrap();
        assert!(sources.contains_key(Path::new("/kb/a.md")));
    }
}
