/// Scripted generator for tests.
///
/// Records how it was called so tests can assert on prompts, model
/// selection and whether generation happened at all.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use super::{FragmentStream, GenerationError, Generator, ModelInfo};

#[derive(Debug, Clone, Default)]
pub struct RecordedCall {
    pub system: String,
    pub question: String,
    pub model: String,
}

#[derive(Default)]
pub struct MockGenerator {
    answer: String,
    fragments: Vec<String>,
    failure: Option<String>,
    /// Yield this many fragments, then fail the stream.
    fail_stream_after: Option<usize>,
    endless: bool,
    calls: Mutex<Vec<RecordedCall>>,
    /// Fragments actually pulled by consumers.
    pub produced: Arc<AtomicUsize>,
}

impl MockGenerator {
    pub fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            fragments: answer.split_inclusive(' ').map(str::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn with_fragments(mut self, fragments: &[&str]) -> Self {
        self.fragments = fragments.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn fail_stream_after(mut self, n: usize) -> Self {
        self.fail_stream_after = Some(n);
        self
    }

    /// Stream fragments forever; only consumer cancellation ends it.
    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    fn record(&self, system: &str, question: &str, model: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                system: system.to_string(),
                question: question.to_string(),
                model: model.to_string(),
            });
        }
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn complete(
        &self,
        system: &str,
        question: &str,
        model: &str,
    ) -> Result<String, GenerationError> {
        self.record(system, question, model);
        match &self.failure {
            Some(msg) => Err(GenerationError::Request(msg.clone())),
            None => Ok(self.answer.clone()),
        }
    }

    async fn stream(
        &self,
        system: &str,
        question: &str,
        model: &str,
    ) -> Result<FragmentStream, GenerationError> {
        self.record(system, question, model);
        if let Some(msg) = &self.failure {
            return Err(GenerationError::Request(msg.clone()));
        }

        let produced = self.produced.clone();
        let items: Vec<String> = self.fragments.clone();
        let fail_after = self.fail_stream_after;

        let base = if self.endless {
            futures::stream::iter(items).cycle().boxed()
        } else {
            futures::stream::iter(items).boxed()
        };

        let stream = base.enumerate().map(move |(i, fragment)| {
            if fail_after.is_some_and(|n| i >= n) {
                return Err(GenerationError::Stream("connection reset".to_string()));
            }
            produced.fetch_add(1, Ordering::SeqCst);
            Ok(fragment)
        });

        match fail_after {
            // Stop right after the injected failure
            Some(n) => Ok(stream.take(n + 1).boxed()),
            None => Ok(stream.boxed()),
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, GenerationError> {
        if let Some(msg) = &self.failure {
            return Err(GenerationError::Request(msg.clone()));
        }
        Ok(vec![ModelInfo {
            name: "mock-model".to_string(),
            family: Some("mock".to_string()),
            parameter_size: None,
            size_bytes: None,
        }])
    }
}
