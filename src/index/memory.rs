/// In-process index scoring chunks by query term overlap.
///
/// No embeddings involved: a chunk matches when it shares at least one
/// significant word with the query. Used for tests and for trying the
/// pipeline without an embedding backend. Snapshots are plain JSON.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{IndexError, VectorIndex};
use crate::models::{Chunk, ScoredChunk};

const STOP_WORDS: &[&str] = &[
    "the", "and", "are", "was", "for", "with", "what", "how", "who", "why", "does", "this",
    "that", "from", "about", "into", "have", "has",
];

#[derive(Default)]
pub struct MemoryIndex {
    chunks: RwLock<Vec<Chunk>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of stored chunks, in insertion order.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn add(&self, chunks: &[Chunk]) -> Result<(), IndexError> {
        let sources: HashSet<&str> = chunks.iter().map(|c| c.metadata.source.as_str()).collect();
        let mut stored = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        stored.retain(|c| !sources.contains(c.metadata.source.as_str()));
        stored.extend_from_slice(chunks);
        Ok(())
    }

    async fn remove_source(&self, source: &Path) -> Result<usize, IndexError> {
        let source = source.to_string_lossy();
        let mut stored = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        let before = stored.len();
        stored.retain(|c| c.metadata.source != source);
        Ok(before - stored.len())
    }

    async fn similarity_search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let stored = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<ScoredChunk> = stored
            .iter()
            .filter_map(|chunk| {
                let chunk_terms = terms(&chunk.text);
                let shared = query_terms.intersection(&chunk_terms).count();
                (shared > 0).then(|| ScoredChunk {
                    chunk: chunk.clone(),
                    score: shared as f64 / query_terms.len() as f64,
                })
            })
            .collect();

        // Stable sort keeps insertion order among equal scores
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn save(&self, path: &Path) -> Result<(), IndexError> {
        let data = serde_json::to_vec(&self.chunks())
            .map_err(|e| IndexError::Snapshot(e.to_string()))?;

        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, &data)?;
            std::fs::rename(&tmp, path)
        };
        write().map_err(|e| IndexError::Snapshot(format!("{}: {e}", path.display())))
    }

    async fn load(&self, path: &Path) -> Result<usize, IndexError> {
        let data = std::fs::read(path)
            .map_err(|e| IndexError::Snapshot(format!("{}: {e}", path.display())))?;
        let loaded: Vec<Chunk> = serde_json::from_slice(&data)
            .map_err(|e| IndexError::CorruptSnapshot(format!("{}: {e}", path.display())))?;

        let count = loaded.len();
        *self.chunks.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(count)
    }

    async fn indexed_sources(&self) -> Result<HashMap<PathBuf, DateTime<Utc>>, IndexError> {
        let mut sources: HashMap<PathBuf, DateTime<Utc>> = HashMap::new();
        for chunk in self.chunks() {
            let entry = sources
                .entry(PathBuf::from(&chunk.metadata.source))
                .or_insert(chunk.metadata.last_modified);
            if chunk.metadata.last_modified > *entry {
                *entry = chunk.metadata.last_modified;
            }
        }
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;

    fn chunks(path: &str, texts: &[&str]) -> Vec<Chunk> {
        let doc = Document::new(Path::new(path), texts.join("\n\n"), Utc::now());
        Chunk::tag_all(&doc, texts.iter().map(|t| t.to_string()).collect())
    }

    #[tokio::test]
    async fn test_term_overlap_ranking() {
        let index = MemoryIndex::new();
        index
            .add(&chunks("/kb/a.md", &["tokio runtime spawns tasks", "axum routes"]))
            .await
            .unwrap();

        let hits = index.similarity_search("How does tokio spawn tasks?", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.chunk_index, 0);

        let none = index.similarity_search("gardening tomatoes", 5).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_add_replaces_same_source() {
        let index = MemoryIndex::new();
        index.add(&chunks("/kb/a.md", &["one", "two"])).await.unwrap();
        index.add(&chunks("/kb/b.md", &["three"])).await.unwrap();
        index.add(&chunks("/kb/a.md", &["four"])).await.unwrap();
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_source_keeps_others() {
        let index = MemoryIndex::new();
        index.add(&chunks("/kb/a.md", &["one", "two"])).await.unwrap();
        index.add(&chunks("/kb/b.md", &["three"])).await.unwrap();

        assert_eq!(index.remove_source(Path::new("/kb/a.md")).await.unwrap(), 2);
        assert_eq!(index.remove_source(Path::new("/kb/a.md")).await.unwrap(), 0);
        assert_eq!(index.len(), 1);
        assert_eq!(index.chunks()[0].metadata.filename, "b.md");
    }

    #[tokio::test]
    async fn test_undecodable_snapshot_is_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let garbage = temp.path().join("index.json");
        std::fs::write(&garbage, b"{not json").unwrap();

        let index = MemoryIndex::new();
        assert!(matches!(
            index.load(&garbage).await,
            Err(IndexError::CorruptSnapshot(_))
        ));
        assert!(matches!(
            index.load(&temp.path().join("missing.json")).await,
            Err(IndexError::Snapshot(_))
        ));
    }

    #[tokio::test]
    async fn test_json_snapshot() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("index.json");

        let index = MemoryIndex::new();
        index.add(&chunks("/kb/a.md", &["persisted words"])).await.unwrap();
        index.save(&path).await.unwrap();

        let restored = MemoryIndex::new();
        assert_eq!(restored.load(&path).await.unwrap(), 1);
        assert_eq!(restored.chunks(), index.chunks());
        assert_eq!(restored.indexed_sources().await.unwrap().len(), 1);
    }
}
