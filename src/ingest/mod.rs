//! Ingestion coordinator: turns files under the corpus root into indexed
//! chunks, at most once per modification.
pub mod retry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunker::Chunker;
use crate::config::Config;
use crate::index::{IndexError, VectorIndex};
use crate::models::{Chunk, Document};
use crate::persistence::SnapshotStore;
use crate::records::ChangeRecordStore;

pub use retry::{RetryPolicy, is_transient, submit_with_retry, with_retry};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index rejected submission after {attempts} attempt(s): {source}")]
    Permanent {
        attempts: u32,
        #[source]
        source: IndexError,
    },

    #[error("index still failing after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: IndexError,
    },

    #[error("ingestion interrupted by shutdown")]
    Interrupted,
}

/// Result of a single-file ingestion that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Ingested { chunks: usize },
    /// The file no longer yields any chunk; what the index held for it was dropped.
    Cleared { removed: usize },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStats {
    pub processed_file_count: usize,
    pub documents_path: String,
}

pub struct Ingestor {
    root: PathBuf,
    extensions: Vec<String>,
    chunker: Arc<dyn Chunker>,
    index: Arc<dyn VectorIndex>,
    records: Arc<ChangeRecordStore>,
    snapshots: Arc<SnapshotStore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Ingestor {
    pub fn new(
        config: &Config,
        chunker: Arc<dyn Chunker>,
        index: Arc<dyn VectorIndex>,
        records: Arc<ChangeRecordStore>,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        let root = std::path::absolute(&config.documents_path)
            .unwrap_or_else(|_| config.documents_path.clone());
        Self {
            root,
            extensions: config.normalized_extensions(),
            chunker,
            index,
            records,
            snapshots,
            retry: RetryPolicy {
                max_attempts: config.ingest.max_attempts,
                delay: config.retry_delay(),
            },
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Token observed during retry pauses; cancel it on shutdown.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records(&self) -> &Arc<ChangeRecordStore> {
        &self.records
    }

    /// Case-insensitive check of the file name against the allow-list.
    pub fn is_allowed(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy().to_lowercase();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// Key under which `path` is recorded; relative paths resolve against the cwd.
    fn record_key(path: &Path) -> PathBuf {
        std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
    }

    /// Allow-listed regular files below `dir`, in walk order.
    pub fn list_documents(&self, dir: &Path) -> Vec<PathBuf> {
        let walker = WalkBuilder::new(dir).hidden(false).build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {e}", dir.display());
                    continue;
                }
            };
            let is_file = entry.file_type().is_some_and(|t| t.is_file());
            if is_file && self.is_allowed(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files
    }

    /// Ingest every allow-listed file under the root.
    ///
    /// With `force`, change records are cleared first so every file is
    /// re-submitted. The snapshot is saved once at the end, and only if the
    /// index changed. Returns the number of files ingested or cleared.
    pub async fn ingest_all(&self, force: bool) -> usize {
        if !self.root.exists() {
            warn!(
                "Documents directory {} does not exist, creating it",
                self.root.display()
            );
            if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
                error!("Failed to create {}: {e}", self.root.display());
                return 0;
            }
        }

        if force {
            info!("Forced re-ingestion: clearing change records");
            self.records.clear();
        }

        let files = self.list_documents(&self.root);
        info!("Found {} documents under {}", files.len(), self.root.display());

        let mut processed = 0;
        for path in &files {
            if self.cancel.is_cancelled() {
                warn!("Shutdown requested, stopping after {processed} files");
                break;
            }
            if self.ingest_file(path).await {
                processed += 1;
            }
        }

        if processed > 0 {
            self.persist().await;
        }

        info!("Ingestion complete: {processed} of {} files processed", files.len());
        processed
    }

    /// Ingest one file if it changed since it was last confirmed.
    ///
    /// True only when the index accepted a change for the file: new chunks,
    /// or removal of the old ones when the file no longer yields any.
    /// Failures are logged; the change record is left untouched so the
    /// next trigger retries.
    pub async fn ingest_file(&self, path: &Path) -> bool {
        match self.try_ingest_file(path).await {
            Ok(FileOutcome::Ingested { .. } | FileOutcome::Cleared { .. }) => true,
            Ok(FileOutcome::Unchanged) => false,
            Err(IngestError::Unsupported(_)) => {
                debug!("Ignoring {}", path.display());
                false
            }
            Err(e) => {
                error!(file = %path.display(), "Ingestion failed: {e}");
                false
            }
        }
    }

    pub async fn try_ingest_file(&self, path: &Path) -> Result<FileOutcome, IngestError> {
        if !self.is_allowed(path) {
            return Err(IngestError::Unsupported(path.to_path_buf()));
        }

        let key = Self::record_key(path);
        let _guard = self.records.lock_path(&key).await;

        let io_err = |source: std::io::Error| IngestError::Io {
            path: key.clone(),
            source,
        };

        let metadata = tokio::fs::metadata(&key).await.map_err(io_err)?;
        if !metadata.is_file() {
            return Err(IngestError::Unsupported(key.clone()));
        }
        let modified: DateTime<Utc> = metadata.modified().map_err(io_err)?.into();

        if !self.records.is_stale(&key, modified) {
            debug!("Unchanged since last ingestion: {}", key.display());
            return Ok(FileOutcome::Unchanged);
        }

        let text = tokio::fs::read_to_string(&key).await.map_err(io_err)?;
        let document = Document::new(&key, text, modified);
        let fragments = self.chunker.split(&document);
        let chunks = Chunk::tag_all(&document, fragments);

        let label = document.metadata.filename.clone();
        if chunks.is_empty() {
            let (removed, attempts) = with_retry(&self.retry, &self.cancel, &label, || {
                self.index.remove_source(&key)
            })
            .await?;
            self.records.advance(&key, modified);
            info!(file = %label, removed, attempts, "Document has no content left, cleared");
            return Ok(FileOutcome::Cleared { removed });
        }

        let attempts =
            submit_with_retry(self.index.as_ref(), &chunks, &self.retry, &self.cancel, &label)
                .await?;

        self.records.advance(&key, modified);
        info!(
            file = %label,
            chunks = chunks.len(),
            attempts,
            "Ingested document"
        );
        Ok(FileOutcome::Ingested {
            chunks: chunks.len(),
        })
    }

    /// Watcher entry point: ingest and persist if anything changed.
    pub async fn on_file_changed(&self, path: &Path) {
        if self.ingest_file(path).await {
            self.persist().await;
        }
    }

    /// Files currently holding a change record.
    pub fn stats(&self) -> IngestionStats {
        IngestionStats {
            processed_file_count: self.records.len(),
            documents_path: self.root.display().to_string(),
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.snapshots.save().await {
            error!("Failed to save index snapshot: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::TextSplitter;
    use crate::index::memory::MemoryIndex;
    use crate::models::ScoredChunk;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    /// Counts submissions and optionally fails them.
    struct CountingIndex {
        inner: MemoryIndex,
        submissions: AtomicUsize,
        fail_with: Option<String>,
    }

    impl CountingIndex {
        fn new() -> Self {
            Self {
                inner: MemoryIndex::new(),
                submissions: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                ..Self::new()
            }
        }

        fn submissions(&self) -> usize {
            self.submissions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VectorIndex for CountingIndex {
        async fn add(&self, chunks: &[Chunk]) -> Result<(), IndexError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            if let Some(msg) = &self.fail_with {
                return Err(IndexError::Unavailable(msg.clone()));
            }
            self.inner.add(chunks).await
        }
        async fn remove_source(&self, source: &Path) -> Result<usize, IndexError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            if let Some(msg) = &self.fail_with {
                return Err(IndexError::Unavailable(msg.clone()));
            }
            self.inner.remove_source(source).await
        }
        async fn similarity_search(
            &self,
            query: &str,
            top_k: usize,
        ) -> Result<Vec<ScoredChunk>, IndexError> {
            self.inner.similarity_search(query, top_k).await
        }
        async fn save(&self, path: &Path) -> Result<(), IndexError> {
            self.inner.save(path).await
        }
        async fn load(&self, path: &Path) -> Result<usize, IndexError> {
            self.inner.load(path).await
        }
        async fn indexed_sources(&self) -> Result<HashMap<PathBuf, DateTime<Utc>>, IndexError> {
            self.inner.indexed_sources().await
        }
    }

    struct Fixture {
        temp: TempDir,
        index: Arc<CountingIndex>,
        ingestor: Ingestor,
    }

    impl Fixture {
        fn new(index: CountingIndex) -> Self {
            let temp = tempfile::tempdir().unwrap();
            let config = Config {
                documents_path: temp.path().join("docs"),
                vector_store_path: temp.path().join("data").join("index.json"),
                ..Config::default()
            };
            let index = Arc::new(index);
            let snapshots = Arc::new(SnapshotStore::new(
                index.clone(),
                config.vector_store_path.clone(),
            ));
            let ingestor = Ingestor::new(
                &config,
                Arc::new(TextSplitter::new(
                    config.chunk_size,
                    config.chunk_overlap,
                    config.min_chunk_length,
                )),
                index.clone(),
                Arc::new(ChangeRecordStore::new()),
                snapshots,
            )
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(5),
            });
            Self {
                temp,
                index,
                ingestor,
            }
        }

        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.temp.path().join("docs").join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            path
        }

        fn snapshot(&self) -> PathBuf {
            self.temp.path().join("data").join("index.json")
        }
    }

    fn touch_later(path: &Path, secs: u64) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn test_ingest_all_is_idempotent() {
        let fx = Fixture::new(CountingIndex::new());
        fx.write("a.md", "Rust ownership notes. Borrowing rules apply.");
        fx.write("nested/b.txt", "Shopping list with apples and bread.");
        fx.write("ignored.pdf", "binary-ish");

        assert_eq!(fx.ingestor.ingest_all(false).await, 2);
        assert!(fx.snapshot().exists());
        assert_eq!(fx.ingestor.stats().processed_file_count, 2);

        assert_eq!(fx.ingestor.ingest_all(false).await, 0);
        assert_eq!(fx.index.submissions(), 2);
    }

    #[tokio::test]
    async fn test_empty_run_does_not_write_snapshot() {
        let fx = Fixture::new(CountingIndex::new());
        assert_eq!(fx.ingestor.ingest_all(false).await, 0);
        assert!(fx.ingestor.root().exists());
        assert!(!fx.snapshot().exists());
    }

    #[tokio::test]
    async fn test_force_reingests_everything() {
        let fx = Fixture::new(CountingIndex::new());
        fx.write("a.md", "First document body text.");
        fx.write("b.txt", "Second document body text.");

        assert_eq!(fx.ingestor.ingest_all(false).await, 2);
        assert_eq!(fx.ingestor.ingest_all(true).await, 2);
        assert_eq!(fx.index.submissions(), 4);
    }

    #[tokio::test]
    async fn test_newer_modification_is_reingested() {
        let fx = Fixture::new(CountingIndex::new());
        let a = fx.write("a.md", "Original content of a.");
        fx.write("b.txt", "Content of b stays put.");
        assert_eq!(fx.ingestor.ingest_all(false).await, 2);

        std::fs::write(&a, "Edited content of a, now longer.").unwrap();
        touch_later(&a, 60);

        assert_eq!(fx.ingestor.ingest_all(false).await, 1);
        assert_eq!(fx.index.submissions(), 3);

        let hits = fx.index.similarity_search("edited longer", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.metadata.filename, "a.md");
    }

    #[tokio::test]
    async fn test_emptied_file_drops_its_chunks() {
        let fx = Fixture::new(CountingIndex::new());
        let a = fx.write("a.md", "Secret zebra password lives here.");
        fx.write("b.txt", "Zebra crossings are striped.");
        assert_eq!(fx.ingestor.ingest_all(false).await, 2);

        std::fs::write(&a, "").unwrap();
        touch_later(&a, 60);

        assert_eq!(fx.ingestor.ingest_all(false).await, 1);
        assert_eq!(
            fx.ingestor.try_ingest_file(&a).await.unwrap(),
            FileOutcome::Unchanged
        );

        let hits = fx.index.similarity_search("zebra password", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.metadata.filename, "b.txt");

        // The saved snapshot no longer carries the emptied file either
        let restored = MemoryIndex::new();
        assert_eq!(restored.load(&fx.snapshot()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_below_min_length_is_cleared() {
        let fx = Fixture::new(CountingIndex::new());
        let a = fx.write("a.md", "Long enough body for the chunker to keep.");
        assert!(fx.ingestor.ingest_file(&a).await);

        std::fs::write(&a, "   \n\n  ").unwrap();
        touch_later(&a, 60);

        assert_eq!(
            fx.ingestor.try_ingest_file(&a).await.unwrap(),
            FileOutcome::Cleared { removed: 1 }
        );
        assert!(fx.index.inner.is_empty());
    }

    #[tokio::test]
    async fn test_extension_check_is_case_insensitive() {
        let fx = Fixture::new(CountingIndex::new());
        let upper = fx.write("NOTES.MD", "Upper case extension file.");
        let other = fx.write("data.csv", "a,b,c");

        assert!(fx.ingestor.is_allowed(&upper));
        assert!(!fx.ingestor.is_allowed(&other));
        assert!(!fx.ingestor.ingest_file(&other).await);
        assert!(fx.ingestor.ingest_file(&upper).await);
        assert!(!fx.ingestor.ingest_file(&upper).await);
    }

    #[tokio::test]
    async fn test_failure_leaves_record_unchanged() {
        let fx = Fixture::new(CountingIndex::failing("model not found"));
        let a = fx.write("a.md", "Some content that will not be stored.");

        assert!(!fx.ingestor.ingest_file(&a).await);
        assert_eq!(fx.index.submissions(), 1);
        assert!(fx.ingestor.records().is_empty());

        // Still stale, so the next trigger tries again
        assert!(!fx.ingestor.ingest_file(&a).await);
        assert_eq!(fx.index.submissions(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_gives_up() {
        let fx = Fixture::new(CountingIndex::failing("connection reset by peer"));
        let a = fx.write("a.md", "Content for a flaky backend.");

        let err = fx.ingestor.try_ingest_file(&a).await.unwrap_err();
        assert!(matches!(err, IngestError::Exhausted { attempts: 3, .. }));
        assert_eq!(fx.index.submissions(), 3);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_fatal() {
        let fx = Fixture::new(CountingIndex::new());
        let ghost = fx.temp.path().join("docs").join("ghost.md");
        assert!(matches!(
            fx.ingestor.try_ingest_file(&ghost).await,
            Err(IngestError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_ingest_once() {
        let fx = Fixture::new(CountingIndex::new());
        let a = fx.write("a.md", "Shared content raced by two triggers.");

        let (first, second) = tokio::join!(fx.ingestor.ingest_file(&a), fx.ingestor.ingest_file(&a));
        assert!(first ^ second);
        assert_eq!(fx.index.submissions(), 1);
        assert_eq!(fx.ingestor.records().lock_count(), 0);
    }

    #[tokio::test]
    async fn test_on_file_changed_persists() {
        let fx = Fixture::new(CountingIndex::new());
        let a = fx.write("a.md", "Watched file content.");

        fx.ingestor.on_file_changed(&a).await;
        assert!(fx.snapshot().exists());
    }
}
