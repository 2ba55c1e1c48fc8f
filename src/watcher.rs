//! Recursive corpus watcher feeding changed files to the ingestor.
//!
//! notify delivers raw events on its own thread; they are forwarded into a
//! channel drained by a single async loop. Paths are held until they have
//! been quiet for the debounce window, so half-written files are not read.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::ingest::Ingestor;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("documents directory {0} does not exist")]
    MissingRoot(PathBuf),

    #[error("watcher is already {0:?}")]
    NotStopped(WatcherState),

    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Holds paths until no event has touched them for `window`.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record activity on `path`, restarting its quiet period.
    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now);
    }

    /// Remove and return paths quiet for at least the window, sorted.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let window = self.window;
        let mut ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct FileWatcher {
    ingestor: Arc<Ingestor>,
    config: WatcherConfig,
    state: Arc<Mutex<WatcherState>>,
    running: Mutex<Option<Running>>,
}

impl FileWatcher {
    pub fn new(ingestor: Arc<Ingestor>, config: WatcherConfig) -> Self {
        Self {
            ingestor,
            config,
            state: Arc::new(Mutex::new(WatcherState::Stopped)),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state() == WatcherState::Running
    }

    fn set_state(&self, state: WatcherState) {
        set_state(&self.state, state);
    }

    /// Register the corpus tree and spawn the event loop.
    ///
    /// A missing root is logged and leaves the watcher stopped.
    pub fn start(&self) -> Result<(), WatcherError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != WatcherState::Stopped {
                return Err(WatcherError::NotStopped(*state));
            }
            *state = WatcherState::Starting;
        }

        let root = self.ingestor.root().to_path_buf();
        if !root.is_dir() {
            warn!(
                "Documents directory {} not found, file watching disabled",
                root.display()
            );
            self.set_state(WatcherState::Stopped);
            return Err(WatcherError::MissingRoot(root));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            NotifyConfig::default(),
        )
        .and_then(|mut w| w.watch(&root, RecursiveMode::Recursive).map(|()| w));

        let watcher = match watcher {
            Ok(w) => w,
            Err(source) => {
                error!("Failed to watch {}: {source}", root.display());
                self.set_state(WatcherState::Stopped);
                return Err(WatcherError::Notify { path: root, source });
            }
        };

        let cancel = CancellationToken::new();
        let event_loop = EventLoop {
            ingestor: self.ingestor.clone(),
            debouncer: Debouncer::new(Duration::from_millis(self.config.debounce_ms)),
            poll: Duration::from_millis(self.config.poll_ms.max(1)),
        };
        let state = self.state.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            // Dropping the watcher unregisters every watch
            let _watcher = watcher;
            event_loop.run(rx, token).await;
            set_state(&state, WatcherState::Stopped);
        });

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Running { cancel, handle });
        self.set_state(WatcherState::Running);
        info!("Watching {} for changes", root.display());
        Ok(())
    }

    /// Signal the loop, wait a bounded time for it to drain, then abort it.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { cancel, mut handle }) = running else {
            return;
        };

        self.set_state(WatcherState::Stopping);
        cancel.cancel();

        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => info!("File watcher stopped"),
            Ok(Err(e)) => error!("File watcher task failed: {e}"),
            Err(_) => {
                warn!(
                    "File watcher did not stop within {}ms, aborting",
                    timeout.as_millis()
                );
                handle.abort();
            }
        }
        self.set_state(WatcherState::Stopped);
    }
}

fn set_state(state: &Mutex<WatcherState>, next: WatcherState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

struct EventLoop {
    ingestor: Arc<Ingestor>,
    debouncer: Debouncer,
    poll: Duration,
}

impl EventLoop {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e)) => warn!("File watcher error: {e}"),
                    None => break,
                },
                _ = tokio::time::sleep(self.poll) => {}
            }

            for path in self.debouncer.drain_ready(Instant::now()) {
                if cancel.is_cancelled() {
                    break;
                }
                debug!("Dispatching change: {}", path.display());
                self.ingestor.on_file_changed(&path).await;
            }
        }

        if !self.debouncer.is_empty() {
            debug!(
                "Dropping {} pending changes on shutdown",
                self.debouncer.len()
            );
        }
    }

    fn handle_event(&mut self, event: Event) {
        let now = Instant::now();

        if event.need_rescan() {
            // Unchanged files are skipped by the ingestor, so queue the whole tree
            let files = self.ingestor.list_documents(self.ingestor.root());
            warn!(
                "File watcher event queue overflowed, rechecking {} documents",
                files.len()
            );
            for file in files {
                self.debouncer.touch(file, now);
            }
        }

        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }

        for path in event.paths {
            if path.is_dir() {
                // Files already inside a newly appeared directory
                for file in self.ingestor.list_documents(&path) {
                    self.debouncer.touch(file, now);
                }
            } else if self.ingestor.is_allowed(&path) {
                self.debouncer.touch(path, now);
            }
        }
    }
}
