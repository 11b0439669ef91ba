//! Index Persistence Module
//!
//! Snapshot directories hold a manifest, a vector blob, a metadata record set
//! and an append-only journal. Renaming the manifest into place is the only
//! commit step, so a crash mid-checkpoint leaves the previous generation intact.

pub mod journal;
pub mod snapshot;

use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::documents::metadata::StoreError;
use crate::index::{IndexDescriptor, IndexError};

pub use journal::{Journal, JournalRecord};
pub use snapshot::{Checkpoint, Manifest, SnapshotDir, SnapshotState};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Vector blob encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Incompatible index: expected {expected}, found {found}")]
    IncompatibleIndex {
        expected: IndexDescriptor,
        found: IndexDescriptor,
    },
    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),
    #[error("Index error: {0}")]
    Index(IndexError),
    #[error("Metadata store error: {0}")]
    Store(#[from] StoreError),
}

impl From<IndexError> for PersistenceError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::IncompatibleIndex { expected, found } => {
                PersistenceError::IncompatibleIndex { expected, found }
            }
            other => PersistenceError::Index(other),
        }
    }
}

impl Serialize for PersistenceError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomic write: write and sync a .tmp sibling, then rename into place.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = tmp_sibling(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    // Make the rename itself durable where the platform allows it
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
