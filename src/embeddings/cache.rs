//! Bounded embedding memoization.
//!
//! Keys are SHA-256 digests of (model id, text), so vectors from different
//! model versions never collide. Least recently used entries are evicted once
//! the cache reaches capacity.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

use super::{Embedding, EmbeddingClient, EmbeddingError};

type CacheKey = [u8; 32];

fn cache_key(model_id: &str, text: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry {
    vector: Embedding,
    last_used: u64,
}

/// Content-hash to vector map with LRU eviction. Capacity 0 disables caching.
pub struct EmbeddingCache {
    capacity: usize,
    entries: HashMap<CacheKey, CacheEntry>,
    /// last_used tick to key, oldest first
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
    stats: CacheStats,
    warned_full: bool,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity.min(1024)),
            recency: BTreeMap::new(),
            tick: 0,
            stats: CacheStats::default(),
            warned_full: false,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn get(&mut self, model_id: &str, text: &str) -> Option<Embedding> {
        let key = cache_key(model_id, text);
        let tick = self.next_tick();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                self.recency.remove(&entry.last_used);
                entry.last_used = tick;
                self.recency.insert(tick, key);
                self.stats.hits += 1;
                Some(entry.vector.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, model_id: &str, text: &str, vector: Embedding) {
        if self.capacity == 0 {
            return;
        }
        let key = cache_key(model_id, text);
        let tick = self.next_tick();
        if let Some(old) = self.entries.remove(&key) {
            self.recency.remove(&old.last_used);
        }

        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.stats.evictions += 1;
            if !self.warned_full {
                warn!(capacity = self.capacity, "Embedding cache full, evicting least recently used entries");
                self.warned_full = true;
            }
        }

        self.entries.insert(key, CacheEntry { vector, last_used: tick });
        self.recency.insert(tick, key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }
}

/// Wraps a client with an [`EmbeddingCache`].
pub struct CachedEmbeddingClient {
    inner: Arc<dyn EmbeddingClient>,
    cache: Mutex<EmbeddingCache>,
}

impl CachedEmbeddingClient {
    pub fn new(inner: Arc<dyn EmbeddingClient>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(EmbeddingCache::new(capacity)),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    fn remember(&self, text: &str, vector: &Embedding) {
        if vector.len() == self.inner.dimension() && vector.iter().all(|x| x.is_finite()) {
            self.cache.lock().insert(self.inner.model_id(), text, vector.clone());
        }
    }
}

#[async_trait]
impl EmbeddingClient for CachedEmbeddingClient {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let cached = self.cache.lock().get(self.inner.model_id(), text);
        if let Some(vector) = cached {
            return Ok(vector);
        }
        let vector = self.inner.embed(text).await?;
        self.remember(text, &vector);
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut results: Vec<Option<Embedding>> = {
            let mut cache = self.cache.lock();
            texts
                .iter()
                .map(|t| cache.get(self.inner.model_id(), t))
                .collect()
        };

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| results[i].is_none()).collect();
        if !missing.is_empty() {
            let missing_texts: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.inner.embed_batch(&missing_texts).await?;
            if vectors.len() != missing.len() {
                return Err(EmbeddingError::Unavailable(format!(
                    "model returned {} vectors for {} inputs",
                    vectors.len(),
                    missing.len()
                )));
            }
            for (i, vector) in missing.into_iter().zip(vectors) {
                self.remember(&texts[i], &vector);
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::ScriptedEmbedder;

    #[test]
    fn test_lru_eviction() {
        let mut cache = EmbeddingCache::new(2);
        cache.insert("m", "a", vec![1.0]);
        cache.insert("m", "b", vec![2.0]);
        assert!(cache.get("m", "a").is_some());
        cache.insert("m", "c", vec![3.0]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("m", "b").is_none());
        assert_eq!(cache.get("m", "a"), Some(vec![1.0]));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_keys_include_model() {
        let mut cache = EmbeddingCache::new(4);
        cache.insert("model-a", "text", vec![1.0]);
        assert!(cache.get("model-b", "text").is_none());
        assert!(cache.get("model-a", "text").is_some());
    }

    #[test]
    fn test_zero_capacity_disables() {
        let mut cache = EmbeddingCache::new(0);
        cache.insert("m", "a", vec![1.0]);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cached_client_skips_repeat_calls() {
        let inner = Arc::new(ScriptedEmbedder::new(4));
        let client = CachedEmbeddingClient::new(inner.clone(), 16);

        let first = client.embed("net worth").await.unwrap();
        let second = client.embed("net worth").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls(), 1);

        let texts = vec!["net worth".to_string(), "borrowings".to_string()];
        let batch = client.embed_batch(&texts).await.unwrap();
        assert_eq!(batch[0], first);
        assert_eq!(inner.calls(), 2);

        let stats = client.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn test_non_finite_vectors_not_cached() {
        let inner = Arc::new(ScriptedEmbedder::new(2).with_vector("bad", vec![f32::NAN, 0.0]));
        let client = CachedEmbeddingClient::new(inner.clone(), 16);

        client.embed("bad").await.unwrap();
        client.embed("bad").await.unwrap();
        assert_eq!(inner.calls(), 2);
        assert_eq!(client.stats().entries, 0);
    }
}
