//! Embedding client doubles for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::hashing::FeatureHashEmbedder;
use super::{Embedding, EmbeddingClient, EmbeddingError};

/// Returns scripted vectors for known texts and feature-hash vectors for the rest.
pub struct ScriptedEmbedder {
    model_id: String,
    dimension: usize,
    vectors: HashMap<String, Embedding>,
    fallback: FeatureHashEmbedder,
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            model_id: "scripted".to_string(),
            dimension,
            vectors: HashMap::new(),
            fallback: FeatureHashEmbedder::new(dimension),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_model_id(mut self, model_id: &str) -> Self {
        self.model_id = model_id.to_string();
        self
    }

    pub fn with_vector(mut self, text: &str, vector: Embedding) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    /// Number of `embed`/`embed_batch` invocations
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, text: &str) -> Embedding {
        self.vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.fallback.embed_text(text))
    }
}

#[async_trait]
impl EmbeddingClient for ScriptedEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lookup(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.lookup(t)).collect())
    }
}

/// Fails every call whose input contains `marker`, or the first
/// `failures` calls, then delegates to a feature-hash embedder.
pub struct FailingEmbedder {
    inner: FeatureHashEmbedder,
    marker: Option<String>,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FailingEmbedder {
    pub fn on_text(dimension: usize, marker: &str) -> Self {
        Self {
            inner: FeatureHashEmbedder::new(dimension),
            marker: Some(marker.to_string()),
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn flaky(dimension: usize, failures: usize) -> Self {
        Self {
            inner: FeatureHashEmbedder::new(dimension),
            marker: None,
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, texts: &[&str]) -> Result<(), EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.marker {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(EmbeddingError::Unavailable("connection refused".into()));
            }
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EmbeddingError::Unavailable("service overloaded".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingClient for FailingEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        self.check(&[text])?;
        Ok(self.inner.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        self.check(&refs)?;
        Ok(texts.iter().map(|t| self.inner.embed_text(t)).collect())
    }
}

/// Sleeps before answering.
pub struct SlowEmbedder {
    inner: FeatureHashEmbedder,
    delay: Duration,
}

impl SlowEmbedder {
    pub fn new(dimension: usize, delay: Duration) -> Self {
        Self {
            inner: FeatureHashEmbedder::new(dimension),
            delay,
        }
    }
}

#[async_trait]
impl EmbeddingClient for SlowEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.inner.embed_text(text))
    }
}
