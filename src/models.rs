//! Core data types shared by ingestion, indexing and retrieval.
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of characters kept in a citation preview.
pub const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Markdown,
    Text,
    Unknown,
}

impl DocumentType {
    /// Infer the type from a file name (case-insensitive).
    pub fn from_filename(filename: &str) -> Self {
        let lower = filename.to_lowercase();
        if lower.ends_with(".md") || lower.ends_with(".markdown") {
            Self::Markdown
        } else if lower.ends_with(".txt") {
            Self::Text
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "markdown" => Self::Markdown,
            "text" => Self::Text,
            _ => Self::Unknown,
        }
    }
}

/// Metadata inherited by every chunk of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// Full path of the source file.
    pub source: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub last_modified: DateTime<Utc>,
}

/// One ingested file. Built once per ingestion and never mutated.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: PathBuf,
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl Document {
    pub fn new(path: &Path, text: String, last_modified: DateTime<Utc>) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let metadata = DocumentMetadata {
            source: path.to_string_lossy().to_string(),
            doc_type: DocumentType::from_filename(&filename),
            filename,
            last_modified,
        };
        Self {
            path: path.to_path_buf(),
            text,
            metadata,
        }
    }
}

/// A fragment of a document, the unit submitted to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub text: String,
    #[serde(flatten)]
    pub metadata: DocumentMetadata,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

impl Chunk {
    /// Tag ordered fragments of `document` with contiguous zero-based indices.
    pub fn tag_all(document: &Document, fragments: Vec<String>) -> Vec<Chunk> {
        let total = fragments.len();
        fragments
            .into_iter()
            .enumerate()
            .map(|(i, text)| Chunk {
                text,
                metadata: document.metadata.clone(),
                chunk_index: i,
                total_chunks: total,
            })
            .collect()
    }
}

/// A chunk returned by similarity search, most similar first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// A question as it arrives from a caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub question: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub filename: String,
    pub path: String,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<Citation>,
    pub original_question: String,
}

/// Truncate to at most [`PREVIEW_CHARS`] characters on a char boundary.
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}
