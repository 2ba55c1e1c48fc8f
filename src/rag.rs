//! Retrieval-augmented answering over the indexed corpus.
use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

use crate::index::{IndexError, VectorIndex};
use crate::llm::{FragmentStream, GenerationError, Generator, ModelInfo};
use crate::models::{Citation, RagAnswer, ScoredChunk, preview};

pub const NO_RESULTS_ANSWER: &str = "I couldn't find any relevant information in your knowledge base to answer this question. Please make sure you have documents indexed, or try rephrasing your question.";

const SYSTEM_PROMPT: &str = "\
You are a helpful assistant that answers questions based on the user's personal knowledge base.

Use the following context from the user's documents to answer their question.
If the answer cannot be found in the context, say so clearly and offer to help in other ways.
Always cite the source documents when using information from them.

Context from knowledge base:
---
{context}
---

Guidelines:
- Be concise and accurate
- If you use information from the context, mention which document it came from
- If the context doesn't contain relevant information, acknowledge this
- Do not make up information that isn't in the context
";

#[derive(Error, Debug)]
pub enum RagError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

pub struct RagService {
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
    top_k: usize,
    default_model: String,
}

impl RagService {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
        top_k: usize,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            index,
            generator,
            top_k,
            default_model: default_model.into(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Answer `question` from the indexed corpus, with citations.
    pub async fn ask(&self, question: &str) -> Result<RagAnswer, RagError> {
        let question = validate(question)?;
        info!("Processing question: {question}");

        let hits = self.retrieve(question, self.top_k).await?;
        if hits.is_empty() {
            return Ok(RagAnswer {
                answer: NO_RESULTS_ANSWER.to_string(),
                sources: Vec::new(),
                original_question: question.to_string(),
            });
        }

        let system = system_prompt(&hits);
        let answer = self
            .generator
            .complete(&system, question, &self.default_model)
            .await?;

        let sources = citations(&hits);
        info!("Generated answer using {} source documents", sources.len());
        Ok(RagAnswer {
            answer,
            sources,
            original_question: question.to_string(),
        })
    }

    /// Like [`ask`](Self::ask), but fragment by fragment.
    ///
    /// `model` overrides the default for this call only. Dropping the
    /// returned stream stops generation upstream.
    pub async fn ask_stream(
        &self,
        question: &str,
        model: Option<&str>,
    ) -> Result<FragmentStream, RagError> {
        let question = validate(question)?;
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        info!(model, "Processing streaming question: {question}");

        let hits = self.retrieve(question, self.top_k).await?;
        if hits.is_empty() {
            let fallback = futures::stream::once(async {
                Ok::<_, GenerationError>(NO_RESULTS_ANSWER.to_string())
            });
            return Ok(fallback.boxed());
        }

        let system = system_prompt(&hits);
        Ok(self.generator.stream(&system, question, model).await?)
    }

    /// Pure retrieval, most similar first.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>, RagError> {
        let query = validate(query)?;
        if top_k == 0 {
            return Err(RagError::Validation("topK must be positive".to_string()));
        }
        self.retrieve(query, top_k).await
    }

    /// Models the generation backend offers; empty when it cannot be reached.
    pub async fn available_models(&self) -> Vec<ModelInfo> {
        match self.generator.list_models().await {
            Ok(models) => models,
            Err(e) => {
                debug!("Could not list models: {e}");
                Vec::new()
            }
        }
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>, RagError> {
        let hits = self.index.similarity_search(query, top_k).await?;
        debug!("Found {} relevant chunks", hits.len());
        Ok(hits)
    }
}

fn validate(text: &str) -> Result<&str, RagError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RagError::Validation("question must not be blank".to_string()));
    }
    Ok(trimmed)
}

/// Retrieved chunks as one context block, each labelled with its origin.
pub fn build_context(hits: &[ScoredChunk]) -> String {
    hits.iter()
        .map(|hit| {
            format!(
                "[Source: {} (chunk {})]\n{}",
                hit.chunk.metadata.filename, hit.chunk.chunk_index, hit.chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn system_prompt(hits: &[ScoredChunk]) -> String {
    SYSTEM_PROMPT.replace("{context}", &build_context(hits))
}

/// One citation per distinct (filename, path), in retrieval order.
pub fn citations(hits: &[ScoredChunk]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    hits.iter()
        .filter(|hit| {
            seen.insert((
                hit.chunk.metadata.filename.as_str(),
                hit.chunk.metadata.source.as_str(),
            ))
        })
        .map(|hit| Citation {
            filename: hit.chunk.metadata.filename.clone(),
            path: hit.chunk.metadata.source.clone(),
            preview: preview(&hit.chunk.text),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use crate::llm::mock::MockGenerator;
    use crate::models::{Chunk, Document};
    use chrono::Utc;
    use std::path::Path;
    use std::sync::atomic::Ordering;

    async fn index_with(docs: &[(&str, &[&str])]) -> Arc<MemoryIndex> {
        let index = Arc::new(MemoryIndex::new());
        for (path, texts) in docs {
            let doc = Document::new(Path::new(path), texts.join("\n\n"), Utc::now());
            let chunks = Chunk::tag_all(&doc, texts.iter().map(|t| t.to_string()).collect());
            index.add(&chunks).await.unwrap();
        }
        index
    }

    fn service(index: Arc<MemoryIndex>, generator: Arc<MockGenerator>) -> RagService {
        RagService::new(index, generator, 5, "llama3.2")
    }

    #[tokio::test]
    async fn test_blank_question_rejected() {
        let generator = Arc::new(MockGenerator::new("unused"));
        let rag = service(Arc::new(MemoryIndex::new()), generator.clone());

        assert!(matches!(rag.ask("   ").await, Err(RagError::Validation(_))));
        assert!(matches!(rag.ask_stream("", None).await, Err(RagError::Validation(_))));
        assert!(matches!(rag.search("\t", 5).await, Err(RagError::Validation(_))));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_results_skips_generation() {
        let generator = Arc::new(MockGenerator::new("unused"));
        let rag = service(Arc::new(MemoryIndex::new()), generator.clone());

        let answer = rag.ask("What is the capital of Mars?").await.unwrap();
        assert_eq!(answer.answer, NO_RESULTS_ANSWER);
        assert!(answer.sources.is_empty());
        assert_eq!(answer.original_question, "What is the capital of Mars?");

        let fragments: Vec<_> = rag
            .ask_stream("What is the capital of Mars?", None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].as_ref().unwrap(), NO_RESULTS_ANSWER);
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_citations_deduplicated_per_file() {
        let index = index_with(&[
            (
                "/kb/rust.md",
                &["rust ownership basics", "rust ownership moves", "rust ownership borrows"],
            ),
            ("/kb/notes.txt", &["rust ownership summary"]),
            ("/kb/extra.md", &["rust ownership in practice"]),
        ])
        .await;
        let generator = Arc::new(MockGenerator::new("Ownership means one owner."));
        let rag = service(index, generator.clone());

        let answer = rag.ask("rust ownership").await.unwrap();
        assert_eq!(answer.answer, "Ownership means one owner.");
        assert_eq!(answer.sources.len(), 3);
        let rust: Vec<_> = answer
            .sources
            .iter()
            .filter(|c| c.filename == "rust.md")
            .collect();
        assert_eq!(rust.len(), 1);
        assert_eq!(rust[0].path, "/kb/rust.md");
        assert_eq!(rust[0].preview, "rust ownership basics");

        let calls = generator.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].question, "rust ownership");
        assert_eq!(calls[0].model, "llama3.2");
        assert!(calls[0].system.contains("[Source: rust.md (chunk 0)]\nrust ownership basics"));
        assert!(calls[0].system.contains("---\n[Source:"));
    }

    #[tokio::test]
    async fn test_preview_truncated() {
        let long = format!("needle {}", "x".repeat(500));
        let index = index_with(&[("/kb/long.md", &[long.as_str()])]).await;
        let rag = service(index, Arc::new(MockGenerator::new("ok")));

        let answer = rag.ask("needle").await.unwrap();
        assert_eq!(answer.sources[0].preview.chars().count(), 200);
    }

    #[tokio::test]
    async fn test_stream_model_override_is_per_call() {
        let index = index_with(&[("/kb/a.md", &["tokio runtime details"])]).await;
        let generator = Arc::new(MockGenerator::new("The runtime schedules tasks."));
        let rag = service(index, generator.clone());

        let text: String = rag
            .ask_stream("tokio runtime", Some("mistral"))
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(text, "The runtime schedules tasks.");

        rag.ask_stream("tokio runtime", None).await.unwrap();
        let models: Vec<_> = generator.calls().into_iter().map(|c| c.model).collect();
        assert_eq!(models, vec!["mistral", "llama3.2"]);
        assert_eq!(rag.default_model(), "llama3.2");
    }

    #[tokio::test]
    async fn test_stream_failure_surfaces() {
        let index = index_with(&[("/kb/a.md", &["tokio runtime details"])]).await;
        let generator = Arc::new(MockGenerator::new("one two three four").fail_stream_after(2));
        let rag = service(index, generator);

        let items: Vec<_> = rag
            .ask_stream("tokio runtime", None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(matches!(items[2], Err(GenerationError::Stream(_))));
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_production() {
        let index = index_with(&[("/kb/a.md", &["tokio runtime details"])]).await;
        let generator = Arc::new(MockGenerator::new("again and again").endless());
        let rag = service(index, generator.clone());

        let mut stream = rag.ask_stream("tokio runtime", None).await.unwrap();
        for _ in 0..5 {
            stream.next().await.unwrap().unwrap();
        }
        drop(stream);

        assert_eq!(generator.produced.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_generation_failure_surfaces() {
        let index = index_with(&[("/kb/a.md", &["tokio runtime details"])]).await;
        let rag = service(index, Arc::new(MockGenerator::new("x").failing("backend down")));

        assert!(matches!(
            rag.ask("tokio runtime").await,
            Err(RagError::Generation(_))
        ));
        assert!(rag.available_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_search_returns_full_chunks() {
        let index = index_with(&[("/kb/a.md", &["tokio runtime details", "unrelated text"])]).await;
        let rag = service(index, Arc::new(MockGenerator::new("x")));

        let hits = rag.search("tokio", 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.text, "tokio runtime details");
        assert_eq!(hits[0].chunk.total_chunks, 2);
        assert!(matches!(rag.search("tokio", 0).await, Err(RagError::Validation(_))));
    }
}
