/// Configuration module for notebrain.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "notebrain.json";

// ── Default value functions ──────────────────────────────────────────

fn default_documents_path() -> PathBuf {
    PathBuf::from("./documents")
}

fn default_vector_store_path() -> PathBuf {
    PathBuf::from("./data/vector-store.db")
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_min_chunk_length() -> usize {
    5
}

fn default_similarity_top_k() -> usize {
    5
}

fn default_file_extensions() -> Vec<String> {
    vec![".md".to_string(), ".txt".to_string(), ".markdown".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_chat_model() -> String {
    "llama3.2".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_dimensions() -> usize {
    768
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_startup_delay_ms() -> u64 {
    2000
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_poll_ms() -> u64 {
    250
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root of the watched text corpus.
    #[serde(default = "default_documents_path")]
    pub documents_path: PathBuf,

    /// Where the full index snapshot is written.
    #[serde(default = "default_vector_store_path")]
    pub vector_store_path: PathBuf,

    /// Target chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Fragments shorter than this are not embedded.
    #[serde(default = "default_min_chunk_length")]
    pub min_chunk_length: usize,

    #[serde(default = "default_similarity_top_k")]
    pub similarity_top_k: usize,

    /// Results scoring below this similarity are dropped (0.0 keeps everything).
    #[serde(default)]
    pub similarity_threshold: f64,

    /// Case-insensitive extension allow-list, including the leading dot.
    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,

    #[serde(default)]
    pub ollama: OllamaConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Grace period before the one-shot startup ingestion begins.
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            documents_path: default_documents_path(),
            vector_store_path: default_vector_store_path(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_length: default_min_chunk_length(),
            similarity_top_k: default_similarity_top_k(),
            similarity_threshold: 0.0,
            file_extensions: default_file_extensions(),
            ollama: OllamaConfig::default(),
            ingest: IngestConfig::default(),
            watcher: WatcherConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            startup_delay_ms: default_startup_delay_ms(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            debounce_ms: default_debounce_ms(),
            poll_ms: default_poll_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to [`DEFAULT_CONFIG_PATH`].
    /// If the file does not exist, returns a default config and, for the
    /// default path only, writes a template next to the binary's cwd.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            DEFAULT_CONFIG_PATH
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == DEFAULT_CONFIG_PATH {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let mut cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");

        if cfg.file_extensions.is_empty() {
            cfg.file_extensions = default_file_extensions();
        }

        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(
            self.chunk_overlap < self.chunk_size,
            "chunk_overlap must be smaller than chunk_size"
        );
        anyhow::ensure!(
            self.similarity_top_k > 0,
            "similarity_top_k must be positive"
        );
        anyhow::ensure!(
            self.ingest.max_attempts > 0,
            "ingest.max_attempts must be positive"
        );
        anyhow::ensure!(
            self.ollama.embedding_dimensions > 0,
            "ollama.embedding_dimensions must be positive"
        );
        anyhow::ensure!(
            !self.file_extensions.is_empty(),
            "at least one file extension must be specified"
        );
        Ok(())
    }

    /// Lowercased allow-list, each entry guaranteed to start with a dot.
    #[must_use]
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.file_extensions
            .iter()
            .map(|ext| {
                let ext = ext.trim().to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{ext}")
                }
            })
            .collect()
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.ingest.retry_delay_ms)
    }

    #[must_use]
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.ingest.startup_delay_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
