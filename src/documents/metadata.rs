//! Metadata Store
//!
//! Maps chunk identifiers to the chunk record: text, source document,
//! position and section. Written once at ingestion, read on every query.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use super::chunker::Chunk;
use crate::index::IndexDescriptor;
use crate::persistence::atomic_write;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Chunk not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Incompatible record set: expected {expected}, found {found}")]
    IncompatibleIndex {
        expected: IndexDescriptor,
        found: IndexDescriptor,
    },
}

impl Serialize for StoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordFile {
    descriptor: IndexDescriptor,
    records: Vec<Chunk>,
}

#[derive(Debug, Default)]
pub struct MetadataStore {
    records: HashMap<String, Chunk>,
    /// Document id to its chunk ids
    documents: HashMap<String, BTreeSet<String>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = Chunk>) -> Self {
        let mut store = Self::new();
        store.put_batch(records);
        store
    }

    /// Insert a chunk, returning the record it replaced.
    pub fn put(&mut self, chunk: Chunk) -> Option<Chunk> {
        let chunk_id = chunk.id.clone();
        let document_id = chunk.document_id.clone();
        let previous = self.records.insert(chunk_id.clone(), chunk);
        if let Some(prev) = &previous {
            if prev.document_id != document_id {
                self.unlink(&prev.document_id, &chunk_id);
            }
        }
        self.documents.entry(document_id).or_default().insert(chunk_id);
        previous
    }

    pub fn put_batch(&mut self, chunks: impl IntoIterator<Item = Chunk>) {
        for chunk in chunks {
            self.put(chunk);
        }
    }

    pub fn get(&self, chunk_id: &str) -> Result<&Chunk, StoreError> {
        self.records
            .get(chunk_id)
            .ok_or_else(|| StoreError::NotFound(chunk_id.to_string()))
    }

    pub fn contains_document(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }

    /// Chunks of one document in chunk order
    pub fn chunks_for_document(&self, document_id: &str) -> Vec<&Chunk> {
        let mut chunks: Vec<&Chunk> = self
            .documents
            .get(document_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
            .collect();
        chunks.sort_by_key(|c| c.index);
        chunks
    }

    /// Remove every chunk of a document, returning the removed chunk ids.
    /// The caller removes the same ids from the vector index.
    pub fn delete_by_document(&mut self, document_id: &str) -> Vec<String> {
        let Some(ids) = self.documents.remove(document_id) else {
            return Vec::new();
        };
        for id in &ids {
            self.records.remove(id);
        }
        ids.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn document_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.documents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// All records ordered by document then chunk index
    pub fn records(&self) -> Vec<&Chunk> {
        let mut records: Vec<&Chunk> = self.records.values().collect();
        records.sort_by(|a, b| a.document_id.cmp(&b.document_id).then(a.index.cmp(&b.index)));
        records
    }

    fn unlink(&mut self, document_id: &str, chunk_id: &str) {
        if let Some(ids) = self.documents.get_mut(document_id) {
            ids.remove(chunk_id);
            if ids.is_empty() {
                self.documents.remove(document_id);
            }
        }
    }

    pub fn save(&self, path: &Path, descriptor: &IndexDescriptor) -> Result<(), StoreError> {
        let file = RecordFile {
            descriptor: descriptor.clone(),
            records: self.records().into_iter().cloned().collect(),
        };
        let json = serde_json::to_vec(&file)?;
        atomic_write(path, &json)?;
        info!(path = ?path, records = file.records.len(), "Saved metadata store");
        Ok(())
    }

    pub fn load(path: &Path, expected: &IndexDescriptor) -> Result<Self, StoreError> {
        let content = fs::read(path)?;
        let file: RecordFile = serde_json::from_slice(&content)?;
        if &file.descriptor != expected {
            return Err(StoreError::IncompatibleIndex {
                expected: expected.clone(),
                found: file.descriptor,
            });
        }
        Ok(Self::from_records(file.records))
    }
}
