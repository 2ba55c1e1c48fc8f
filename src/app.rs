//! Process wiring and background task lifecycle.
//!
//! Builds the component graph from a [`Config`], restores the persisted
//! index, and owns the two background activities of a serving process:
//! the file watcher and the one-shot startup ingestion.
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunker::TextSplitter;
use crate::config::Config;
use crate::index::{IndexError, VectorIndex};
use crate::index::sqlite::SqliteIndex;
use crate::ingest::Ingestor;
use crate::llm::Generator;
use crate::llm::ollama::OllamaClient;
use crate::persistence::SnapshotStore;
use crate::rag::RagService;
use crate::records::ChangeRecordStore;
use crate::server::{self, AppState};
use crate::watcher::{FileWatcher, WatcherError};

pub struct App {
    pub config: Config,
    pub index: Arc<dyn VectorIndex>,
    pub records: Arc<ChangeRecordStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub ingestor: Arc<Ingestor>,
    pub rag: Arc<RagService>,
    pub watcher: Arc<FileWatcher>,
    shutdown: CancellationToken,
}

impl App {
    /// Wire the production stack: Ollama for chat and embeddings, sqlite-vec for storage.
    pub fn build(config: Config) -> Result<Self> {
        let client = Arc::new(
            OllamaClient::new(&config.ollama).context("failed to create Ollama client")?,
        );
        let index = SqliteIndex::new(client.clone(), config.similarity_threshold)
            .context("failed to open vector store")?;
        Ok(Self::from_parts(config, Arc::new(index), client))
    }

    /// Wire the service graph around any index and generator.
    pub fn from_parts(
        config: Config,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let records = Arc::new(ChangeRecordStore::new());
        let snapshots = Arc::new(SnapshotStore::new(
            index.clone(),
            config.vector_store_path.clone(),
        ));
        let chunker = Arc::new(TextSplitter::new(
            config.chunk_size,
            config.chunk_overlap,
            config.min_chunk_length,
        ));

        let ingestor = Arc::new(
            Ingestor::new(
                &config,
                chunker,
                index.clone(),
                records.clone(),
                snapshots.clone(),
            )
            .with_cancellation(shutdown.clone()),
        );
        let rag = Arc::new(RagService::new(
            index.clone(),
            generator,
            config.similarity_top_k,
            config.ollama.chat_model.clone(),
        ));
        let watcher = Arc::new(FileWatcher::new(ingestor.clone(), config.watcher.clone()));

        Self {
            config,
            index,
            records,
            snapshots,
            ingestor,
            rag,
            watcher,
            shutdown,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            rag: self.rag.clone(),
            ingestor: self.ingestor.clone(),
            watcher: self.watcher.clone(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Load the snapshot and seed change records from what it contains.
    ///
    /// A corrupt snapshot is moved aside and the index starts empty. One
    /// that merely cannot be read right now is left where it is.
    pub async fn restore(&self) -> usize {
        let chunks = match self.snapshots.load_or_empty().await {
            Ok(n) => n,
            Err(e @ IndexError::CorruptSnapshot(_)) => {
                error!("Failed to load index snapshot: {e}");
                if let Err(e) = self.snapshots.quarantine() {
                    warn!("Could not move snapshot aside: {e}");
                }
                0
            }
            Err(e) => {
                error!("Failed to read index snapshot, starting empty: {e}");
                0
            }
        };

        if chunks > 0 {
            match self.index.indexed_sources().await {
                Ok(sources) => {
                    let seeded = self.records.seed(sources);
                    info!("Seeded change records for {seeded} files from snapshot");
                }
                Err(e) => warn!("Could not read indexed sources from snapshot: {e}"),
            }
        }
        chunks
    }

    /// Ingest the corpus once after the startup grace delay.
    ///
    /// Failures are logged by the returned supervisor and never reach the caller.
    pub fn spawn_startup_ingestion(&self) -> JoinHandle<()> {
        let ingestor = self.ingestor.clone();
        let delay = self.config.startup_delay();
        let cancel = self.shutdown.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            info!("Starting initial document ingestion");
            Some(ingestor.ingest_all(false).await)
        });

        tokio::spawn(async move {
            match task.await {
                Ok(Some(processed)) => info!("Initial ingestion processed {processed} files"),
                Ok(None) => debug!("Initial ingestion skipped by shutdown"),
                Err(e) if e.is_panic() => warn!("Initial ingestion panicked: {e}"),
                Err(e) => warn!("Initial ingestion did not finish: {e}"),
            }
        })
    }

    /// Start the watcher if enabled; failure leaves it stopped.
    pub fn start_watcher(&self) {
        if !self.config.watcher.enabled {
            info!("File watching disabled by configuration");
            return;
        }

        let root = self.ingestor.root();
        if let Err(e) = std::fs::create_dir_all(root) {
            warn!("Could not create {}: {e}", root.display());
        }

        match self.watcher.start() {
            Ok(()) => {}
            // Already logged by the watcher
            Err(WatcherError::MissingRoot(_)) => {}
            Err(e) => warn!("File watcher not started: {e}"),
        }
    }

    /// Run the HTTP API with background tasks until Ctrl-C.
    pub async fn serve(&self) -> Result<()> {
        self.restore().await;
        self.start_watcher();
        let startup = self.spawn_startup_ingestion();

        let token = self.shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
            }
            token.cancel();
        });

        let result = server::serve(
            self.state(),
            &self.config.server.host,
            self.config.server.port,
            self.shutdown.clone(),
        )
        .await;

        self.shutdown().await;
        startup.abort();
        result
    }

    /// Cancel background work and stop the watcher.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.watcher.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use crate::llm::mock::MockGenerator;
    use crate::watcher::WatcherState;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> Config {
        let mut config = Config {
            documents_path: temp.path().join("docs"),
            vector_store_path: temp.path().join("data").join("index.json"),
            ..Config::default()
        };
        config.ingest.startup_delay_ms = 10;
        config.ingest.retry_delay_ms = 1;
        config.watcher.poll_ms = 25;
        config.watcher.shutdown_timeout_ms = 2000;
        config
    }

    fn app(config: Config) -> App {
        App::from_parts(
            config,
            Arc::new(MemoryIndex::new()),
            Arc::new(MockGenerator::new("ok")),
        )
    }

    #[tokio::test]
    async fn test_restart_does_not_reingest_unchanged_files() {
        let temp = tempfile::tempdir().unwrap();
        let first = app(config(&temp));
        std::fs::create_dir_all(temp.path().join("docs")).unwrap();
        std::fs::write(temp.path().join("docs").join("a.md"), "Persistent note body.").unwrap();
        assert_eq!(first.ingestor.ingest_all(false).await, 1);

        let second = app(config(&temp));
        assert_eq!(second.restore().await, 1);
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.ingestor.ingest_all(false).await, 0);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("data")).unwrap();
        std::fs::write(temp.path().join("data").join("index.json"), "{broken").unwrap();

        let app = app(config(&temp));
        assert_eq!(app.restore().await, 0);
        assert!(temp.path().join("data").join("index.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_is_left_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let snapshot = temp.path().join("data").join("index.json");
        std::fs::create_dir_all(&snapshot).unwrap();

        let app = app(config(&temp));
        assert_eq!(app.restore().await, 0);
        assert!(snapshot.is_dir());
        assert!(!temp.path().join("data").join("index.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_startup_ingestion_runs_in_background() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(config(&temp));
        std::fs::create_dir_all(temp.path().join("docs")).unwrap();
        std::fs::write(temp.path().join("docs").join("a.md"), "Startup note body.").unwrap();

        app.spawn_startup_ingestion().await.unwrap();
        assert_eq!(app.records.len(), 1);
    }

    #[tokio::test]
    async fn test_startup_ingestion_cancelled_by_shutdown() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config(&temp);
        config.ingest.startup_delay_ms = 60_000;
        let app = app(config);

        let handle = app.spawn_startup_ingestion();
        app.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(app.records.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(config(&temp));

        // Root is created before watching starts
        app.start_watcher();
        assert_eq!(app.watcher.state(), WatcherState::Running);

        app.shutdown().await;
        assert_eq!(app.watcher.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_disabled_watcher_never_starts() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config(&temp);
        config.watcher.enabled = false;
        let app = app(config);

        app.start_watcher();
        assert!(!app.watcher.is_active());
    }
}
