//! Append-only journal of committed batches since the last checkpoint.
//!
//! One JSON object per line. A crash mid-append can leave a torn final line;
//! opening the journal drops that tail and truncates the file back to the
//! last complete record.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::PersistenceError;
use crate::documents::chunker::Chunk;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Every chunk of one document with its vector, in insertion order
    Commit {
        document_id: String,
        chunks: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
    },
    RemoveDocument { document_id: String },
}

pub struct Journal {
    path: PathBuf,
    file: File,
    appended: usize,
}

impl Journal {
    /// Open (creating if needed) and return the records already present.
    pub fn open(path: &Path) -> Result<(Self, Vec<JournalRecord>), PersistenceError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        let (records, valid_len) = parse_records(path, &content)?;
        if valid_len < content.len() {
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                appended: 0,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended through this handle
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Append one record and sync it to disk.
    pub fn append(&mut self, record: &JournalRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        self.appended += 1;
        Ok(())
    }
}

/// Parse complete lines. Returns the records and the byte length they span.
fn parse_records(path: &Path, content: &[u8]) -> Result<(Vec<JournalRecord>, usize), PersistenceError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < content.len() {
        let rest = &content[offset..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            warn!(path = ?path, bytes = rest.len(), "Dropping torn journal tail");
            break;
        };
        let line = &rest[..newline];
        let next = offset + newline + 1;

        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<JournalRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if next >= content.len() => {
                    warn!(path = ?path, error = %e, "Dropping unreadable final journal record");
                    break;
                }
                Err(e) => {
                    return Err(PersistenceError::Corrupt(format!(
                        "journal record at byte {}: {}",
                        offset, e
                    )));
                }
            }
        }
        offset = next;
    }

    Ok((records, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn remove(doc: &str) -> JournalRecord {
        JournalRecord::RemoveDocument {
            document_id: doc.to_string(),
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");

        let (mut journal, existing) = Journal::open(&path).unwrap();
        assert!(existing.is_empty());
        journal.append(&remove("a")).unwrap();
        journal.append(&remove("b")).unwrap();
        assert_eq!(journal.appended(), 2);
        drop(journal);

        let (_, records) = Journal::open(&path).unwrap();
        assert_eq!(records, vec![remove("a"), remove("b")]);
    }

    #[test]
    fn test_torn_tail_is_dropped_and_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal.append(&remove("a")).unwrap();
        }
        let mut content = fs::read(&path).unwrap();
        let good_len = content.len();
        content.extend_from_slice(br#"{"op":"remove_document","docu"#);
        fs::write(&path, &content).unwrap();

        let (mut journal, records) = Journal::open(&path).unwrap();
        assert_eq!(records, vec![remove("a")]);
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, good_len);

        journal.append(&remove("b")).unwrap();
        drop(journal);
        let (_, records) = Journal::open(&path).unwrap();
        assert_eq!(records, vec![remove("a"), remove("b")]);
    }

    #[test]
    fn test_corrupt_middle_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        fs::write(&path, "not json\n{\"op\":\"remove_document\",\"document_id\":\"a\"}\n").unwrap();

        assert!(matches!(Journal::open(&path), Err(PersistenceError::Corrupt(_))));
    }
}
