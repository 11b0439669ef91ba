//! Embedding Client Module
//!
//! The embedding model is an injected collaborator behind [`EmbeddingClient`].
//! Nothing here keeps a process-wide model handle; several clients for
//! different model versions can coexist.

pub mod cache;
pub mod hashing;
pub mod http;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::index::IndexDescriptor;

pub use cache::{CacheStats, CachedEmbeddingClient, EmbeddingCache};
pub use hashing::FeatureHashEmbedder;
pub use http::{HttpEmbeddingClient, HttpEmbeddingConfig};

/// Embedding vector
pub type Embedding = Vec<f32>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Embedding model unavailable: {0}")]
    Unavailable(String),
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Invalid embedding input: {0}")]
    InvalidInput(String),
    #[error("Embedding contains non-finite values: {0}")]
    NonFinite(String),
}

impl EmbeddingError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable(_))
    }
}

impl Serialize for EmbeddingError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Maps text to a fixed-dimension vector. Implementations must be
/// deterministic for a fixed model version.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Identifier of the model version; persisted with every snapshot
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Order-preserving, one vector per input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    fn descriptor(&self) -> IndexDescriptor {
        IndexDescriptor::new(self.model_id(), self.dimension())
    }
}

fn check_vector(client: &dyn EmbeddingClient, text: &str, vector: &Embedding) -> Result<(), EmbeddingError> {
    if vector.len() != client.dimension() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: client.dimension(),
            actual: vector.len(),
        });
    }
    if vector.iter().any(|x| !x.is_finite()) {
        let preview: String = text.chars().take(40).collect();
        return Err(EmbeddingError::NonFinite(preview));
    }
    Ok(())
}

/// Embed one text, treating a timeout as `Unavailable`.
pub async fn embed_with_timeout(
    client: &dyn EmbeddingClient,
    text: &str,
    timeout: Duration,
) -> Result<Embedding, EmbeddingError> {
    let vector = tokio::time::timeout(timeout, client.embed(text))
        .await
        .map_err(|_| EmbeddingError::Unavailable(format!("timed out after {}ms", timeout.as_millis())))??;
    check_vector(client, text, &vector)?;
    Ok(vector)
}

/// Embed a batch, treating a timeout as `Unavailable` and verifying the
/// response has one vector of the right dimension per input.
pub async fn embed_batch_with_timeout(
    client: &dyn EmbeddingClient,
    texts: &[String],
    timeout: Duration,
) -> Result<Vec<Embedding>, EmbeddingError> {
    let vectors = tokio::time::timeout(timeout, client.embed_batch(texts))
        .await
        .map_err(|_| EmbeddingError::Unavailable(format!("timed out after {}ms", timeout.as_millis())))??;
    if vectors.len() != texts.len() {
        return Err(EmbeddingError::Unavailable(format!(
            "model returned {} vectors for {} inputs",
            vectors.len(),
            texts.len()
        )));
    }
    for (text, vector) in texts.iter().zip(&vectors) {
        check_vector(client, text, vector)?;
    }
    Ok(vectors)
}
