//! Collapse of overlapping retrieval candidates.
//!
//! Consecutive chunks of a document share their boundary tokens, so an
//! over-fetched candidate list often holds near-duplicates. Text chunks of the
//! same document whose token ranges overlap or touch are merged into a single
//! passage that keeps the best score.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::documents::chunker::{Chunk, ChunkKind};

/// A search hit joined with its chunk record
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: Chunk,
    pub score: f64,
    pub seq: u64,
}

/// A passage handed to the answer generator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub content: String,
    pub score: f64,
    pub document_id: String,
    pub section: Option<String>,
    /// Chunks that make up this passage, in document order
    pub chunk_ids: Vec<String>,
    pub start_token: usize,
    pub end_token: usize,
    pub kind: ChunkKind,
    /// cl100k tokens in `content`
    pub context_tokens: u32,
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl RetrievedChunk {
    fn from_candidate(candidate: Candidate) -> Self {
        let Candidate { chunk, score, seq } = candidate;
        Self {
            content: chunk.content,
            score,
            document_id: chunk.document_id,
            section: chunk.section,
            chunk_ids: vec![chunk.id],
            start_token: chunk.start_token,
            end_token: chunk.end_token,
            kind: chunk.kind,
            context_tokens: 0,
            seq,
        }
    }

    fn absorb(&mut self, candidate: Candidate) {
        let Candidate { chunk, score, seq } = candidate;
        if chunk.end_token > self.end_token {
            let shared = self.end_token.saturating_sub(chunk.start_token);
            let (separator, rest) = skip_words(&chunk.content, shared);
            if !rest.is_empty() {
                self.content.push_str(separator);
                self.content.push_str(rest);
            }
            self.end_token = chunk.end_token;
        }
        self.score = self.score.max(score);
        self.seq = self.seq.min(seq);
        self.chunk_ids.push(chunk.id);
    }
}

/// Split off the first `n` words. Returns the whitespace that preceded the
/// next word (normalized to a paragraph break or a space) and the remainder.
fn skip_words(text: &str, n: usize) -> (&'static str, &str) {
    if n == 0 {
        return (" ", text.trim_start());
    }

    let mut words = 0;
    let mut in_word = false;
    let mut gap_start = 0;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if in_word {
                words += 1;
                in_word = false;
                gap_start = i;
            }
        } else if !in_word {
            if words == n {
                let separator = if text[gap_start..i].contains("\n\n") { "\n\n" } else { " " };
                return (separator, &text[i..]);
            }
            in_word = true;
        }
    }
    ("", "")
}

fn rank_order(a: &RetrievedChunk, b: &RetrievedChunk) -> std::cmp::Ordering {
    b.score.total_cmp(&a.score).then(a.seq.cmp(&b.seq))
}

/// Merge overlapping or touching text candidates per document and return the
/// passages ranked by score, ties broken by earliest insertion.
pub fn collapse_overlapping(candidates: Vec<Candidate>) -> Vec<RetrievedChunk> {
    let mut merged = Vec::with_capacity(candidates.len());
    let mut by_document: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        if candidate.chunk.is_table() {
            merged.push(RetrievedChunk::from_candidate(candidate));
        } else {
            by_document
                .entry(candidate.chunk.document_id.clone())
                .or_default()
                .push(candidate);
        }
    }

    for (_, mut group) in by_document {
        group.sort_by_key(|c| (c.chunk.start_token, c.chunk.index));
        let mut current: Option<RetrievedChunk> = None;
        for candidate in group {
            let overlaps = current
                .as_ref()
                .map_or(false, |open| candidate.chunk.start_token <= open.end_token);
            if overlaps {
                if let Some(open) = current.as_mut() {
                    open.absorb(candidate);
                }
            } else if let Some(done) = current.replace(RetrievedChunk::from_candidate(candidate)) {
                merged.push(done);
            }
        }
        merged.extend(current);
    }

    merged.sort_by(rank_order);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::chunker::chunk_id;

    fn words(from: usize, to: usize) -> String {
        (from..to).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    fn candidate(doc: &str, index: u32, start: usize, end: usize, score: f64, seq: u64) -> Candidate {
        Candidate {
            chunk: Chunk {
                id: chunk_id(doc, index),
                document_id: doc.to_string(),
                index,
                content: words(start, end),
                token_count: (end - start) as u32,
                start_pos: 0,
                end_pos: 0,
                start_token: start,
                end_token: end,
                section: Some("Risk Factors".to_string()),
                overlaps_previous: index > 0,
                kind: ChunkKind::Text,
            },
            score,
            seq,
        }
    }

    #[test]
    fn test_overlapping_chunks_merge() {
        let merged = collapse_overlapping(vec![
            candidate("doc", 1, 255, 550, 0.82, 1),
            candidate("doc", 0, 0, 300, 0.77, 0),
        ]);

        assert_eq!(merged.len(), 1);
        let passage = &merged[0];
        assert_eq!(passage.content, words(0, 550));
        assert_eq!(passage.score, 0.82);
        assert_eq!(passage.chunk_ids, vec!["doc#00000", "doc#00001"]);
        assert_eq!((passage.start_token, passage.end_token), (0, 550));
    }

    #[test]
    fn test_distant_chunks_stay_separate() {
        let merged = collapse_overlapping(vec![
            candidate("doc", 0, 0, 300, 0.5, 0),
            candidate("doc", 4, 1000, 1300, 0.9, 4),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].chunk_ids, vec!["doc#00004"]);
    }

    #[test]
    fn test_other_documents_not_merged() {
        let merged = collapse_overlapping(vec![
            candidate("a", 0, 0, 300, 0.5, 0),
            candidate("b", 0, 0, 300, 0.5, 1),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].document_id, "a");
    }

    #[test]
    fn test_touching_chunks_merge() {
        let merged = collapse_overlapping(vec![
            candidate("doc", 0, 0, 10, 0.5, 0),
            candidate("doc", 1, 10, 20, 0.6, 1),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content, words(0, 20));
    }

    #[test]
    fn test_tables_never_merge() {
        let mut table = candidate("doc", 2, 100, 140, 0.7, 2);
        table.chunk.kind = ChunkKind::Table;
        let merged = collapse_overlapping(vec![candidate("doc", 1, 50, 120, 0.6, 1), table]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].kind, ChunkKind::Table);
    }

    #[test]
    fn test_skip_words_keeps_paragraph_break() {
        assert_eq!(skip_words("a b\n\nc d", 2), ("\n\n", "c d"));
        assert_eq!(skip_words("a b c", 1), (" ", "b c"));
        assert_eq!(skip_words("a b", 5), ("", ""));
    }
}
