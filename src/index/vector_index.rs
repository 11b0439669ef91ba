//! In-memory vector index.
//!
//! Entries live in insertion order. Removal leaves a tombstone that searches
//! skip; compaction drops tombstones without renumbering, so tie-breaks by
//! insertion sequence survive compaction, save and load.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::projection::ProjectionIndex;
use super::similarity::{cosine_with_norms, vector_norm};
use super::{IndexDescriptor, IndexError, IndexOptions, SearchHit};
use crate::config::SearchMode;
use crate::persistence::atomic_write;

/// Tombstones tolerated before removal triggers compaction on its own
const AUTO_COMPACT_MIN_TOMBSTONES: usize = 1024;

/// (chunk identifier, vector, insertion sequence number)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub seq: u64,
    pub vector: Vec<f32>,
}

struct Slot {
    entry: IndexEntry,
    norm: f64,
    live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub live: usize,
    pub tombstones: usize,
    pub next_seq: u64,
    pub approximate_active: bool,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    descriptor: IndexDescriptor,
    next_seq: u64,
    entries: Vec<IndexEntry>,
}

#[derive(Clone, Copy)]
struct Scored {
    slot: usize,
    score: f64,
    seq: u64,
}

/// Descending score, then ascending insertion sequence.
fn rank_order(a: &Scored, b: &Scored) -> Ordering {
    b.score.total_cmp(&a.score).then(a.seq.cmp(&b.seq))
}

pub struct VectorIndex {
    descriptor: IndexDescriptor,
    options: IndexOptions,
    slots: Vec<Slot>,
    /// Live chunk id to slot position
    positions: HashMap<String, usize>,
    next_seq: u64,
    tombstones: usize,
    projection: Option<ProjectionIndex>,
}

impl VectorIndex {
    pub fn new(descriptor: IndexDescriptor, options: IndexOptions) -> Self {
        let projection = match options.mode {
            SearchMode::Approximate => Some(ProjectionIndex::new(
                descriptor.dimension,
                options.projection_tables,
                options.projection_bits,
            )),
            SearchMode::Exact => None,
        };
        Self {
            descriptor,
            options,
            slots: Vec::new(),
            positions: HashMap::new(),
            next_seq: 0,
            tombstones: 0,
            projection,
        }
    }

    /// Rebuild an index from persisted entries, keeping their sequence numbers.
    pub fn restore(
        descriptor: IndexDescriptor,
        options: IndexOptions,
        next_seq: u64,
        mut entries: Vec<IndexEntry>,
    ) -> Result<Self, IndexError> {
        entries.sort_by_key(|e| e.seq);
        let mut index = Self::new(descriptor, options);
        for entry in entries {
            index.validate(&entry.chunk_id, &entry.vector)?;
            if index.positions.contains_key(&entry.chunk_id) {
                return Err(IndexError::DuplicateId(entry.chunk_id));
            }
            index.next_seq = index.next_seq.max(entry.seq + 1);
            index.push(entry);
        }
        index.next_seq = index.next_seq.max(next_seq);
        Ok(index)
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Number of live (searchable) entries
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.positions.contains_key(chunk_id)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Live entries in insertion order
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.slots.iter().filter(|s| s.live).map(|s| &s.entry)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            live: self.len(),
            tombstones: self.tombstones,
            next_seq: self.next_seq,
            approximate_active: self.approximate_active(),
        }
    }

    fn approximate_active(&self) -> bool {
        self.projection.is_some() && self.len() >= self.options.exactness_threshold
    }

    fn validate(&self, chunk_id: &str, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.descriptor.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.descriptor.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::NonFiniteVector(chunk_id.to_string()));
        }
        Ok(())
    }

    /// Check that `add` would accept this pair, without inserting it.
    pub fn check_insert(&self, chunk_id: &str, vector: &[f32]) -> Result<(), IndexError> {
        self.validate(chunk_id, vector)?;
        if self.positions.contains_key(chunk_id) {
            return Err(IndexError::DuplicateId(chunk_id.to_string()));
        }
        Ok(())
    }

    fn push(&mut self, entry: IndexEntry) {
        let slot = self.slots.len();
        if let Some(projection) = self.projection.as_mut() {
            projection.insert(slot, &entry.vector);
        }
        self.positions.insert(entry.chunk_id.clone(), slot);
        self.slots.push(Slot {
            norm: vector_norm(&entry.vector),
            entry,
            live: true,
        });
    }

    /// Add a vector, returning its insertion sequence number.
    pub fn add(&mut self, chunk_id: &str, vector: Vec<f32>) -> Result<u64, IndexError> {
        self.check_insert(chunk_id, &vector)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.push(IndexEntry {
            chunk_id: chunk_id.to_string(),
            seq,
            vector,
        });
        Ok(seq)
    }

    /// Add several vectors. Every pair is validated before any is inserted,
    /// so a rejected batch leaves the index untouched.
    pub fn add_batch(&mut self, items: Vec<(String, Vec<f32>)>) -> Result<Vec<u64>, IndexError> {
        let mut seen = HashSet::with_capacity(items.len());
        for (chunk_id, vector) in &items {
            self.check_insert(chunk_id, vector)?;
            if !seen.insert(chunk_id.as_str()) {
                return Err(IndexError::DuplicateId(chunk_id.clone()));
            }
        }

        let mut seqs = Vec::with_capacity(items.len());
        for (chunk_id, vector) in items {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.push(IndexEntry { chunk_id, seq, vector });
            seqs.push(seq);
        }
        Ok(seqs)
    }

    /// Logically delete a vector. Removing an unknown id is a no-op.
    pub fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(slot) = self.positions.remove(chunk_id) else {
            return false;
        };
        self.slots[slot].live = false;
        self.tombstones += 1;

        if self.tombstones >= AUTO_COMPACT_MIN_TOMBSTONES && self.tombstones > self.len() {
            self.compact();
        }
        true
    }

    /// Physically drop tombstoned entries. Sequence numbers are unchanged.
    pub fn compact(&mut self) {
        if self.tombstones == 0 {
            return;
        }
        let dropped = self.tombstones;
        let slots = std::mem::take(&mut self.slots);
        self.positions.clear();
        self.tombstones = 0;
        if let Some(projection) = self.projection.as_mut() {
            projection.clear();
        }
        for slot in slots.into_iter().filter(|s| s.live) {
            self.push(slot.entry);
        }
        debug!(dropped, live = self.len(), "Compacted vector index");
    }

    /// Up to `k` live entries by descending cosine similarity, ties broken by
    /// earlier insertion. An empty index yields an empty result.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.validate("query", query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let query_norm = vector_norm(query);

        if self.approximate_active() {
            if let Some(hits) = self.search_projected(query, query_norm, k) {
                return Ok(hits);
            }
        }

        let scored: Vec<Scored> = self
            .slots
            .par_iter()
            .enumerate()
            .filter(|(_, s)| s.live)
            .map(|(slot, s)| Scored {
                slot,
                score: cosine_with_norms(query, query_norm, &s.entry.vector, s.norm),
                seq: s.entry.seq,
            })
            .collect();

        Ok(self.top_k(scored, k))
    }

    /// Score only projection candidates. `None` when there are too few of
    /// them to fill `k`, in which case the caller scans everything.
    fn search_projected(&self, query: &[f32], query_norm: f64, k: usize) -> Option<Vec<SearchHit>> {
        let projection = self.projection.as_ref()?;
        let candidates: Vec<usize> = projection
            .candidates(query)
            .into_iter()
            .filter(|&slot| self.slots.get(slot).map_or(false, |s| s.live))
            .collect();

        if candidates.len() < k {
            debug!(
                candidates = candidates.len(),
                k, "Too few projection candidates, scanning all entries"
            );
            return None;
        }

        let scored: Vec<Scored> = candidates
            .par_iter()
            .map(|&slot| {
                let s = &self.slots[slot];
                Scored {
                    slot,
                    score: cosine_with_norms(query, query_norm, &s.entry.vector, s.norm),
                    seq: s.entry.seq,
                }
            })
            .collect();

        Some(self.top_k(scored, k))
    }

    fn top_k(&self, mut scored: Vec<Scored>, k: usize) -> Vec<SearchHit> {
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, rank_order);
            scored.truncate(k);
        }
        scored.sort_by(rank_order);
        scored
            .into_iter()
            .map(|s| SearchHit {
                chunk_id: self.slots[s.slot].entry.chunk_id.clone(),
                score: s.score,
                seq: s.seq,
            })
            .collect()
    }

    /// Write a standalone snapshot of the live entries.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let file = IndexFile {
            descriptor: self.descriptor.clone(),
            next_seq: self.next_seq,
            entries: self.entries().cloned().collect(),
        };
        let bytes = bincode::serialize(&file)?;
        atomic_write(path, &bytes)?;
        info!(path = ?path, entries = file.entries.len(), "Saved vector index");
        Ok(())
    }

    /// Load a standalone snapshot, rejecting one built for another model or dimension.
    pub fn load(path: &Path, expected: &IndexDescriptor, options: IndexOptions) -> Result<Self, IndexError> {
        let bytes = fs::read(path)?;
        let file: IndexFile = bincode::deserialize(&bytes)?;
        expected.ensure_compatible(&file.descriptor)?;
        Self::restore(file.descriptor, options, file.next_seq, file.entries)
    }
}
