//! # notebrain: personal knowledge base with retrieval-augmented answers
//!
//! Keeps a local directory of notes indexed in a vector store and answers
//! questions over it with a local language model (Ollama).
//!
//! ## Architecture
//!
//! - **[`config`]**: JSON configuration loading, defaults and validation
//! - **[`models`]**: Documents, chunks, answers and citations
//! - **[`chunker`]**: Paragraph/sentence text splitting with overlap
//! - **[`embedder`]**: Embedding contract and a deterministic mock
//! - **[`llm`]**: Generation contract, Ollama client, scripted mock
//! - **[`db`]**: SQLite + sqlite-vec chunk and vector storage
//! - **[`index`]**: Vector index contract (sqlite-vec and in-memory)
//! - **[`records`]**: Per-file change records and ingestion locks
//! - **[`persistence`]**: Index snapshot load/save
//! - **[`ingest`]**: Change-aware ingestion with bounded retry
//! - **[`watcher`]**: Debounced recursive file watching
//! - **[`rag`]**: Question answering over retrieved context
//! - **[`server`]**: HTTP API with server-sent event streaming
//! - **[`app`]**: Wiring and background task lifecycle

pub mod app;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedder;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod persistence;
pub mod rag;
pub mod records;
pub mod server;
pub mod watcher;
