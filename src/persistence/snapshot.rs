//! Generation-based snapshot directory.
//!
//! Layout:
//!   MANIFEST.json               names the committed generation
//!   vectors-<generation>.bin    bincode vector blob
//!   metadata-<generation>.json  chunk record set
//!   journal-<generation>.jsonl  commits since the checkpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::{atomic_write, Journal, PersistenceError};
use crate::documents::chunker::Chunk;
use crate::documents::metadata::MetadataStore;
use crate::index::{IndexDescriptor, IndexEntry, IndexOptions, VectorIndex};

pub const FORMAT_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "MANIFEST.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub format_version: u32,
    pub generation: String,
    pub model_id: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
    pub vectors: String,
    pub metadata: String,
    pub journal: String,
}

impl Manifest {
    pub fn descriptor(&self) -> IndexDescriptor {
        IndexDescriptor::new(self.model_id.clone(), self.dimension)
    }
}

/// Keys shared by the vector blob and the record set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotHeader {
    model_id: String,
    dimension: usize,
    generation: String,
    next_seq: u64,
}

#[derive(Serialize, Deserialize)]
struct VectorBlob {
    header: SnapshotHeader,
    entries: Vec<IndexEntry>,
}

#[derive(Serialize, Deserialize)]
struct RecordSet {
    header: SnapshotHeader,
    records: Vec<Chunk>,
}

/// A committed generation and the open journal that follows it
pub struct Checkpoint {
    pub manifest: Manifest,
    pub journal: Journal,
}

/// A loaded generation
pub struct SnapshotState {
    pub manifest: Manifest,
    pub index: VectorIndex,
    pub store: MetadataStore,
}

#[derive(Debug, Clone)]
pub struct SnapshotDir {
    root: PathBuf,
}

impl SnapshotDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn journal_path(&self, manifest: &Manifest) -> PathBuf {
        self.root.join(&manifest.journal)
    }

    /// The committed manifest, if a checkpoint has ever completed.
    pub fn read_manifest(&self) -> Result<Option<Manifest>, PersistenceError> {
        let path = self.root.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(PersistenceError::Corrupt(format!(
                "unsupported format version {}",
                manifest.format_version
            )));
        }
        Ok(Some(manifest))
    }

    /// Write a new generation and commit it by replacing the manifest. The
    /// new journal is opened before the commit, so a failure leaves the
    /// previous generation and its journal in charge.
    pub fn write_checkpoint(
        &self,
        index: &VectorIndex,
        store: &MetadataStore,
    ) -> Result<Checkpoint, PersistenceError> {
        fs::create_dir_all(&self.root)?;

        let generation = Ulid::new().to_string();
        let descriptor = index.descriptor();
        let header = SnapshotHeader {
            model_id: descriptor.model_id.clone(),
            dimension: descriptor.dimension,
            generation: generation.clone(),
            next_seq: index.next_seq(),
        };
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            generation: generation.clone(),
            model_id: descriptor.model_id.clone(),
            dimension: descriptor.dimension,
            created_at: Utc::now(),
            vectors: format!("vectors-{}.bin", generation),
            metadata: format!("metadata-{}.json", generation),
            journal: format!("journal-{}.jsonl", generation),
        };

        let blob = VectorBlob {
            header: header.clone(),
            entries: index.entries().cloned().collect(),
        };
        atomic_write(&self.root.join(&manifest.vectors), &bincode::serialize(&blob)?)?;

        let records = RecordSet {
            header,
            records: store.records().into_iter().cloned().collect(),
        };
        atomic_write(&self.root.join(&manifest.metadata), &serde_json::to_vec(&records)?)?;

        let (journal, leftover) = Journal::open(&self.journal_path(&manifest))?;
        if !leftover.is_empty() {
            return Err(PersistenceError::Corrupt(format!(
                "journal for new generation {} is not empty",
                generation
            )));
        }

        // Commit
        atomic_write(
            &self.root.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&manifest)?,
        )?;
        info!(
            generation = %generation,
            vectors = blob.entries.len(),
            records = records.records.len(),
            "Checkpoint committed"
        );

        self.remove_stale_generations(&generation);
        Ok(Checkpoint { manifest, journal })
    }

    /// Load the committed generation. `Ok(None)` for a fresh directory.
    pub fn load(
        &self,
        expected: &IndexDescriptor,
        options: IndexOptions,
    ) -> Result<Option<SnapshotState>, PersistenceError> {
        let Some(manifest) = self.read_manifest()? else {
            return Ok(None);
        };
        let found = manifest.descriptor();
        if &found != expected {
            return Err(PersistenceError::IncompatibleIndex {
                expected: expected.clone(),
                found,
            });
        }

        let blob: VectorBlob = bincode::deserialize(&fs::read(self.root.join(&manifest.vectors))?)?;
        self.check_header(&manifest, &blob.header, &manifest.vectors)?;

        let records: RecordSet = serde_json::from_slice(&fs::read(self.root.join(&manifest.metadata))?)?;
        self.check_header(&manifest, &records.header, &manifest.metadata)?;
        if records.header.next_seq != blob.header.next_seq {
            return Err(PersistenceError::Corrupt(
                "vector blob and record set disagree on sequence numbers".into(),
            ));
        }

        let index = VectorIndex::restore(found, options, blob.header.next_seq, blob.entries)?;
        let store = MetadataStore::from_records(records.records);
        debug!(
            generation = %manifest.generation,
            vectors = index.len(),
            records = store.len(),
            "Loaded snapshot"
        );

        Ok(Some(SnapshotState {
            manifest,
            index,
            store,
        }))
    }

    fn check_header(
        &self,
        manifest: &Manifest,
        header: &SnapshotHeader,
        file: &str,
    ) -> Result<(), PersistenceError> {
        let found = IndexDescriptor::new(header.model_id.clone(), header.dimension);
        if found != manifest.descriptor() {
            return Err(PersistenceError::IncompatibleIndex {
                expected: manifest.descriptor(),
                found,
            });
        }
        if header.generation != manifest.generation {
            return Err(PersistenceError::Corrupt(format!(
                "{} belongs to generation {}, manifest names {}",
                file, header.generation, manifest.generation
            )));
        }
        Ok(())
    }

    /// Best-effort removal of files from generations other than `keep`.
    fn remove_stale_generations(&self, keep: &str) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to list snapshot directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let generation = ["vectors-", "metadata-", "journal-"]
                .iter()
                .find_map(|prefix| name.strip_prefix(prefix))
                .and_then(|rest| rest.split('.').next());
            match generation {
                Some(generation) if generation != keep => {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!(file = %name, error = %e, "Failed to remove stale snapshot file");
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::chunker::{chunk_id, ChunkKind};
    use tempfile::TempDir;

    fn descriptor() -> IndexDescriptor {
        IndexDescriptor::new("test-model", 2)
    }

    fn chunk(doc: &str, index: u32) -> Chunk {
        Chunk {
            id: chunk_id(doc, index),
            document_id: doc.to_string(),
            index,
            content: format!("chunk {} of {}", index, doc),
            token_count: 4,
            start_pos: 0,
            end_pos: 0,
            start_token: 0,
            end_token: 4,
            section: None,
            overlaps_previous: false,
            kind: ChunkKind::Text,
        }
    }

    fn populated() -> (VectorIndex, MetadataStore) {
        let mut index = VectorIndex::new(descriptor(), IndexOptions::default());
        let mut store = MetadataStore::new();
        for i in 0..3 {
            let c = chunk("doc", i);
            index.add(&c.id, vec![1.0, i as f32]).unwrap();
            store.put(c);
        }
        (index, store)
    }

    #[test]
    fn test_fresh_directory_has_no_snapshot() {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotDir::new(dir.path());
        assert!(snapshots.load(&descriptor(), IndexOptions::default()).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotDir::new(dir.path());
        let (index, store) = populated();

        let manifest = snapshots.write_checkpoint(&index, &store).unwrap().manifest;
        let state = snapshots
            .load(&descriptor(), IndexOptions::default())
            .unwrap()
            .unwrap();

        assert_eq!(state.manifest, manifest);
        assert_eq!(state.index.len(), 3);
        assert_eq!(state.store.len(), 3);
        let q = [0.5, 1.0];
        assert_eq!(index.search(&q, 3).unwrap(), state.index.search(&q, 3).unwrap());
        assert!(snapshots.journal_path(&manifest).exists());
    }

    #[test]
    fn test_model_mismatch_is_incompatible() {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotDir::new(dir.path());
        let (index, store) = populated();
        snapshots.write_checkpoint(&index, &store).unwrap();

        let err = snapshots.load(&IndexDescriptor::new("other-model", 2), IndexOptions::default());
        assert!(matches!(err, Err(PersistenceError::IncompatibleIndex { .. })));
    }

    #[test]
    fn test_old_generations_removed() {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotDir::new(dir.path());
        let (index, store) = populated();

        let first = snapshots.write_checkpoint(&index, &store).unwrap().manifest;
        let second = snapshots.write_checkpoint(&index, &store).unwrap().manifest;

        assert!(!dir.path().join(&first.vectors).exists());
        assert!(!dir.path().join(&first.journal).exists());
        assert!(dir.path().join(&second.vectors).exists());
        assert!(dir.path().join(&second.metadata).exists());
    }

    #[test]
    fn test_checkpoint_journal_follows_committed_generation() {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotDir::new(dir.path());
        let (index, store) = populated();
        let first = snapshots.write_checkpoint(&index, &store).unwrap();

        let Checkpoint { manifest, mut journal } = snapshots.write_checkpoint(&index, &store).unwrap();
        let record = crate::persistence::JournalRecord::RemoveDocument {
            document_id: "doc".to_string(),
        };
        journal.append(&record).unwrap();
        drop(journal);

        assert!(!snapshots.journal_path(&first.manifest).exists());
        let committed = snapshots.read_manifest().unwrap().unwrap();
        assert_eq!(committed, manifest);
        let (_, records) = Journal::open(&snapshots.journal_path(&committed)).unwrap();
        assert_eq!(records, vec![record]);
    }

    #[test]
    fn test_uncommitted_generation_is_ignored() {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotDir::new(dir.path());
        let (mut index, store) = populated();
        let committed = snapshots.write_checkpoint(&index, &store).unwrap().manifest;

        // A crash after writing blobs but before the manifest rename
        index.add("stray", vec![0.0, 1.0]).unwrap();
        fs::write(dir.path().join("vectors-STRAY.bin"), b"partial").unwrap();

        let state = snapshots
            .load(&descriptor(), IndexOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(state.manifest.generation, committed.generation);
        assert_eq!(state.index.len(), 3);
    }
}
