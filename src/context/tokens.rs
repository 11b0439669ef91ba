//! Token counting using tiktoken-rs for context-window budgeting.
//!
//! Uses cl100k_base encoding. Counts are memoized per counter instance,
//! keyed by content hash.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tiktoken_rs::{cl100k_base, CoreBPE};

lazy_static! {
    static ref CL100K: Option<CoreBPE> = cl100k_base().ok();
}

/// Cache for token counts, keyed by content hash
struct TokenCache {
    cache: HashMap<u64, u32>,
    max_size: usize,
}

impl TokenCache {
    fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    fn get(&self, hash: u64) -> Option<u32> {
        self.cache.get(&hash).copied()
    }

    fn insert(&mut self, hash: u64, count: u32) {
        if self.max_size == 0 {
            return;
        }
        // Coarse eviction: at capacity, drop half the entries
        if self.cache.len() >= self.max_size {
            let keys_to_remove: Vec<_> = self
                .cache
                .keys()
                .take(self.max_size / 2 + 1)
                .copied()
                .collect();
            for key in keys_to_remove {
                self.cache.remove(&key);
            }
        }
        self.cache.insert(hash, count);
    }
}

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Counts cl100k tokens for retrieved passages.
pub struct TokenCounter {
    cache: Mutex<TokenCache>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl TokenCounter {
    pub fn new(max_cached: usize) -> Self {
        Self {
            cache: Mutex::new(TokenCache::new(max_cached)),
        }
    }

    /// Count tokens in text, falling back to a length estimate when the
    /// encoder is unavailable.
    pub fn count(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }

        let content_hash = hash_content(text);
        if let Some(count) = self.cache.lock().get(content_hash) {
            return count;
        }

        let count = match CL100K.as_ref() {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
            None => estimate_tokens_quick(text),
        };

        self.cache.lock().insert(content_hash, count);
        count
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().cache.len()
    }
}

/// Estimate tokens without the encoder (~4 bytes per token)
pub fn estimate_tokens_quick(text: &str) -> u32 {
    (text.len() as f64 / 4.0).ceil() as u32
}
