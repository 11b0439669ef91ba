//! Retrieval Configuration
//!
//! One fixed structure with named fields, validated at startup. Unknown keys
//! and out-of-range values are rejected instead of being defaulted.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::documents::chunker::ChunkerOptions;
use crate::index::IndexOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which search path the vector index may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Full-scan cosine similarity, always.
    #[default]
    Exact,
    /// Random-projection candidates once the corpus reaches the exactness threshold.
    Approximate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalConfig {
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub overlap_fraction: f64,
    pub similarity_exactness_threshold: usize,
    pub search_mode: SearchMode,
    pub projection_tables: usize,
    pub projection_bits: usize,
    pub over_fetch_multiplier: usize,
    pub embedding_workers: usize,
    pub embedding_timeout_ms: u64,
    pub embedding_max_retries: u32,
    pub embedding_retry_backoff_ms: u64,
    pub embedding_cache_capacity: usize,
    pub journal_checkpoint_every: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 512,
            min_chunk_size: 64,
            overlap_fraction: 0.15,
            similarity_exactness_threshold: 50_000,
            search_mode: SearchMode::Exact,
            projection_tables: 4,
            projection_bits: 12,
            over_fetch_multiplier: 3,
            embedding_workers: 4,
            embedding_timeout_ms: 30_000,
            embedding_max_retries: 3,
            embedding_retry_backoff_ms: 200,
            embedding_cache_capacity: 10_000,
            journal_checkpoint_every: 64,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl RetrievalConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RetrievalConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_size < 16 {
            return Err(invalid("max_chunk_size", "must be at least 16"));
        }
        if self.min_chunk_size == 0 || self.min_chunk_size >= self.max_chunk_size {
            return Err(invalid(
                "min_chunk_size",
                format!("must be in [1, {})", self.max_chunk_size),
            ));
        }
        if !(0.0..0.5).contains(&self.overlap_fraction) {
            return Err(invalid("overlap_fraction", "must be in [0.0, 0.5)"));
        }
        if self.similarity_exactness_threshold == 0 {
            return Err(invalid("similarity_exactness_threshold", "must be positive"));
        }
        if !(1..=16).contains(&self.projection_tables) {
            return Err(invalid("projection_tables", "must be in [1, 16]"));
        }
        if !(1..=32).contains(&self.projection_bits) {
            return Err(invalid("projection_bits", "must be in [1, 32]"));
        }
        if !(1..=20).contains(&self.over_fetch_multiplier) {
            return Err(invalid("over_fetch_multiplier", "must be in [1, 20]"));
        }
        if !(1..=32).contains(&self.embedding_workers) {
            return Err(invalid("embedding_workers", "must be in [1, 32]"));
        }
        if self.embedding_timeout_ms == 0 {
            return Err(invalid("embedding_timeout_ms", "must be positive"));
        }
        if self.embedding_max_retries > 10 {
            return Err(invalid("embedding_max_retries", "must be at most 10"));
        }
        if self.journal_checkpoint_every == 0 {
            return Err(invalid("journal_checkpoint_every", "must be positive"));
        }
        Ok(())
    }

    pub fn chunker_options(&self) -> ChunkerOptions {
        ChunkerOptions {
            max_chunk_size: self.max_chunk_size,
            min_chunk_size: self.min_chunk_size,
            overlap_fraction: self.overlap_fraction,
        }
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            mode: self.search_mode,
            exactness_threshold: self.similarity_exactness_threshold,
            projection_tables: self.projection_tables,
            projection_bits: self.projection_bits,
        }
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let capped = attempt.min(6);
        Duration::from_millis(self.embedding_retry_backoff_ms.saturating_mul(1 << capped))
    }
}
