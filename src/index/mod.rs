//! Vector Index Module
//!
//! Stores chunk vectors under stable identifiers and answers nearest-neighbour
//! queries by cosine similarity.

pub mod projection;
pub mod similarity;
pub mod vector_index;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::SearchMode;

pub use similarity::{cosine_similarity, vector_norm};
pub use vector_index::{IndexEntry, IndexStats, VectorIndex};

/// Identifies which embedding space a set of vectors lives in. Vectors from
/// different descriptors are not comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub model_id: String,
    pub dimension: usize,
}

impl IndexDescriptor {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension,
        }
    }

    /// Fails unless `found` names the same model and dimension.
    pub fn ensure_compatible(&self, found: &IndexDescriptor) -> Result<(), IndexError> {
        if self != found {
            return Err(IndexError::IncompatibleIndex {
                expected: self.clone(),
                found: found.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} dims)", self.model_id, self.dimension)
    }
}

/// Search behaviour of a [`VectorIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOptions {
    pub mode: SearchMode,
    /// Live entry count at which approximate mode starts using projections
    pub exactness_threshold: usize,
    pub projection_tables: usize,
    pub projection_bits: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Exact,
            exactness_threshold: 50_000,
            projection_tables: 4,
            projection_bits: 12,
        }
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Chunk already indexed: {0}")]
    DuplicateId(String),
    #[error("Vector for {0} contains non-finite values")]
    NonFiniteVector(String),
    #[error("Incompatible index: expected {expected}, found {found}")]
    IncompatibleIndex {
        expected: IndexDescriptor,
        found: IndexDescriptor,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl Serialize for IndexError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A single nearest-neighbour result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f64,
    /// Insertion sequence number, the tie-break for equal scores
    pub seq: u64,
}
