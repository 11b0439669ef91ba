//! Local Embeddings using Feature Hashing
//!
//! Uses the hashing trick to produce fixed-size vectors without a vocabulary.
//! Unigrams and bigrams are hashed with SHA-256 to a bucket and a sign, so the
//! same text maps to the same vector on every platform and every run.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{Embedding, EmbeddingClient, EmbeddingError};

/// Dimensionality used by the retrieval pipeline's default model.
pub const DEFAULT_DIMENSION: usize = 384;

#[derive(Debug, Clone)]
pub struct FeatureHashEmbedder {
    model_id: String,
    dimension: usize,
}

impl Default for FeatureHashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl FeatureHashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            model_id: format!("feature-hash-v1-{}", dimension),
            dimension,
        }
    }

    /// Hash a feature to a bucket index and a sign.
    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let value = u64::from_le_bytes(bytes);
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        ((value % self.dimension as u64) as usize, sign)
    }

    /// Pure function of the text: L2-normalized signed term frequencies.
    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut tf = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return tf;
        }

        let tokens: Vec<String> = text
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        for token in &tokens {
            let (idx, sign) = self.bucket(token);
            tf[idx] += sign;
        }
        for pair in tokens.windows(2) {
            let (idx, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            tf[idx] += 0.5 * sign;
        }

        let norm: f32 = tf.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut tf {
                *x /= norm;
            }
        }
        tf
    }
}

#[async_trait]
impl EmbeddingClient for FeatureHashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::cosine_similarity;

    #[test]
    fn test_deterministic() {
        let embedder = FeatureHashEmbedder::default();
        let a = embedder.embed_text("Revenue grew 12% in fiscal 2023");
        let b = embedder.embed_text("Revenue grew 12% in fiscal 2023");
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_DIMENSION);
    }

    #[test]
    fn test_normalized() {
        let v = FeatureHashEmbedder::default().embed_text("the issue proceeds will fund expansion");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let v = FeatureHashEmbedder::new(16).embed_text("  ... ");
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_related_text_is_closer() {
        let embedder = FeatureHashEmbedder::default();
        let query = embedder.embed_text("risk factors for the company");
        let related = embedder.embed_text("the company faces several risk factors");
        let unrelated = embedder.embed_text("dividend payout history table");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn test_client_descriptor() {
        let embedder = FeatureHashEmbedder::new(64);
        assert_eq!(embedder.model_id(), "feature-hash-v1-64");
        let vectors = embedder
            .embed_batch(&["a b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(embedder.descriptor().dimension, 64);
    }
}
