//! Document Retrieval
//!
//! Embeds the query, over-fetches from the vector index, joins hits with the
//! metadata store, filters, collapses overlapping chunks and truncates to `k`.
//! A hit with no metadata record is a consistency fault: it is logged,
//! counted and skipped, never returned as an error.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::merge::{collapse_overlapping, Candidate, RetrievedChunk};
use crate::config::RetrievalConfig;
use crate::context::TokenCounter;
use crate::documents::metadata::MetadataStore;
use crate::embeddings::{embed_with_timeout, Embedding, EmbeddingClient, EmbeddingError};
use crate::index::{IndexError, VectorIndex};

/// Extra over-fetch applied when results are restricted to one section
const SECTION_OVER_FETCH: usize = 4;

#[derive(Error, Debug)]
pub enum RetrieverError {
    #[error("Query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    /// Logged and counted only
    #[error("Index hit {0} has no metadata record")]
    ConsistencyFault(String),
}

impl Serialize for RetrieverError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveOptions {
    pub k: usize,
    pub min_score: Option<f64>,
    /// Only passages whose section label matches, ignoring case
    pub section: Option<String>,
    /// Retry without the section restriction when it matches nothing
    pub fallback_unscoped: bool,
    /// Cap on the summed cl100k token count of returned passages
    pub token_budget: Option<u32>,
}

impl RetrieveOptions {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            min_score: None,
            section: None,
            fallback_unscoped: true,
            token_budget: None,
        }
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn in_section(mut self, section: &str) -> Self {
        self.section = Some(section.to_string());
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback_unscoped = false;
        self
    }

    pub fn with_token_budget(mut self, budget: u32) -> Self {
        self.token_budget = Some(budget);
        self
    }
}

pub struct Retriever {
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<RwLock<VectorIndex>>,
    store: Arc<RwLock<MetadataStore>>,
    over_fetch: usize,
    embedding_timeout: Duration,
    tokens: TokenCounter,
    faults: AtomicU64,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<RwLock<VectorIndex>>,
        store: Arc<RwLock<MetadataStore>>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            over_fetch: config.over_fetch_multiplier,
            embedding_timeout: config.embedding_timeout(),
            tokens: TokenCounter::default(),
            faults: AtomicU64::new(0),
        }
    }

    /// Index hits skipped because their metadata was missing
    pub fn consistency_faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        min_score: Option<f64>,
    ) -> Result<Vec<RetrievedChunk>, RetrieverError> {
        let mut options = RetrieveOptions::new(k);
        options.min_score = min_score;
        self.retrieve_with(query, &options).await
    }

    pub async fn retrieve_with(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievedChunk>, RetrieverError> {
        if query.trim().is_empty() {
            return Err(RetrieverError::InvalidQuery("query is empty".into()));
        }
        if options.k == 0 {
            return Ok(Vec::new());
        }

        let vector = embed_with_timeout(self.embedder.as_ref(), query, self.embedding_timeout).await?;

        let section = options.section.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let mut results = self.search(&vector, options, section)?;
        if results.is_empty() && section.is_some() && options.fallback_unscoped {
            debug!(section = ?section, "No passages in section, retrying unscoped");
            results = self.search(&vector, options, None)?;
        }

        debug!(k = options.k, results = results.len(), "Retrieved passages");
        Ok(results)
    }

    fn search(
        &self,
        vector: &Embedding,
        options: &RetrieveOptions,
        section: Option<&str>,
    ) -> Result<Vec<RetrievedChunk>, RetrieverError> {
        let mut fetch = options.k.saturating_mul(self.over_fetch);
        if section.is_some() {
            fetch = fetch.saturating_mul(SECTION_OVER_FETCH);
        }

        let hits = self.index.read().search(vector, fetch)?;

        let mut seen = HashSet::with_capacity(hits.len());
        let mut candidates = Vec::with_capacity(hits.len());
        {
            let store = self.store.read();
            for hit in hits {
                if !seen.insert(hit.chunk_id.clone()) {
                    continue;
                }
                if options.min_score.map_or(false, |min| hit.score < min) {
                    continue;
                }
                let chunk = match store.get(&hit.chunk_id) {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        let fault = RetrieverError::ConsistencyFault(hit.chunk_id);
                        warn!(error = %fault, "Skipping index hit");
                        self.faults.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                let in_section = section.map_or(true, |wanted| {
                    chunk
                        .section
                        .as_deref()
                        .map_or(false, |label| label.eq_ignore_ascii_case(wanted))
                });
                if in_section {
                    candidates.push(Candidate {
                        chunk: chunk.clone(),
                        score: hit.score,
                        seq: hit.seq,
                    });
                }
            }
        }

        let mut passages = collapse_overlapping(candidates);
        passages.truncate(options.k);
        for passage in &mut passages {
            passage.context_tokens = self.tokens.count(&passage.content);
        }

        if let Some(budget) = options.token_budget {
            let mut total = 0u32;
            let within = passages
                .iter()
                .take_while(|p| {
                    total = total.saturating_add(p.context_tokens);
                    total <= budget
                })
                .count();
            passages.truncate(within);
        }

        Ok(passages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::chunker::{chunk_id, Chunk, ChunkKind};
    use crate::embeddings::testing::ScriptedEmbedder;
    use crate::index::{IndexDescriptor, IndexOptions};

    struct Fixture {
        retriever: Retriever,
        index: Arc<RwLock<VectorIndex>>,
        store: Arc<RwLock<MetadataStore>>,
    }

    fn chunk(doc: &str, index: u32, start: usize, end: usize, content: &str, section: &str) -> Chunk {
        Chunk {
            id: chunk_id(doc, index),
            document_id: doc.to_string(),
            index,
            content: content.to_string(),
            token_count: (end - start) as u32,
            start_pos: 0,
            end_pos: content.len(),
            start_token: start,
            end_token: end,
            section: Some(section.to_string()),
            overlaps_previous: index > 0,
            kind: ChunkKind::Text,
        }
    }

    fn fixture(entries: Vec<(Chunk, Vec<f32>)>) -> Fixture {
        let embedder = Arc::new(
            ScriptedEmbedder::new(2)
                .with_vector("query", vec![1.0, 0.0])
                .with_vector("sideways", vec![0.0, 1.0]),
        );
        let mut index = VectorIndex::new(IndexDescriptor::new("scripted", 2), IndexOptions::default());
        let mut store = MetadataStore::new();
        for (chunk, vector) in entries {
            index.add(&chunk.id, vector).unwrap();
            store.put(chunk);
        }
        let index = Arc::new(RwLock::new(index));
        let store = Arc::new(RwLock::new(store));
        let retriever = Retriever::new(embedder, index.clone(), store.clone(), &RetrievalConfig::default());
        Fixture {
            retriever,
            index,
            store,
        }
    }

    #[tokio::test]
    async fn test_tie_broken_by_insertion_order() {
        let f = fixture(vec![
            (chunk("a", 0, 0, 3, "alpha one two", "S"), vec![1.0, 0.0]),
            (chunk("c", 0, 0, 3, "gamma one two", "S"), vec![0.4, 0.916_515_1]),
            (chunk("b", 0, 0, 3, "beta one two", "S"), vec![1.0, 0.0]),
        ]);

        let results = f.retriever.retrieve("query", 2, None).await.unwrap();
        let docs: Vec<&str> = results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(docs, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_overlapping_chunks_collapse() {
        let f = fixture(vec![
            (chunk("doc", 0, 0, 4, "one two three four", "S"), vec![1.0, 0.1]),
            (chunk("doc", 1, 2, 6, "three four five six", "S"), vec![1.0, 0.2]),
        ]);

        let results = f.retriever.retrieve("query", 5, Some(0.5)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "one two three four five six");
        assert_eq!(results[0].chunk_ids.len(), 2);
        assert!(results[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_min_score_filters() {
        let f = fixture(vec![
            (chunk("a", 0, 0, 2, "close match", "S"), vec![1.0, 0.0]),
            (chunk("b", 0, 0, 2, "far away", "S"), vec![0.0, 1.0]),
        ]);
        let results = f.retriever.retrieve("query", 5, Some(0.5)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "a");
    }

    #[tokio::test]
    async fn test_missing_metadata_is_skipped() {
        let f = fixture(vec![
            (chunk("a", 0, 0, 2, "first", "S"), vec![1.0, 0.0]),
            (chunk("b", 0, 0, 2, "second", "S"), vec![0.9, 0.1]),
        ]);
        f.store.write().delete_by_document("a");

        let results = f.retriever.retrieve("query", 5, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "b");
        assert_eq!(f.retriever.consistency_faults(), 1);
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let f = fixture(Vec::new());
        assert!(f.retriever.retrieve("query", 3, None).await.unwrap().is_empty());
        assert!(f.index.read().is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let f = fixture(Vec::new());
        assert!(matches!(
            f.retriever.retrieve("  ", 3, None).await,
            Err(RetrieverError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_section_scope_and_fallback() {
        let f = fixture(vec![
            (chunk("a", 0, 0, 2, "revenue table", "Financial Statements"), vec![0.8, 0.2]),
            (chunk("b", 0, 0, 2, "supply risk", "Risk Factors"), vec![1.0, 0.0]),
        ]);

        let scoped = f
            .retriever
            .retrieve_with("query", &RetrieveOptions::new(5).in_section("financial statements"))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].document_id, "a");

        let fallback = f
            .retriever
            .retrieve_with("query", &RetrieveOptions::new(5).in_section("Litigation"))
            .await
            .unwrap();
        assert_eq!(fallback.len(), 2);

        let strict = f
            .retriever
            .retrieve_with(
                "query",
                &RetrieveOptions::new(5).in_section("Litigation").without_fallback(),
            )
            .await
            .unwrap();
        assert!(strict.is_empty());
    }

    #[tokio::test]
    async fn test_token_budget() {
        let long = "word ".repeat(200);
        let f = fixture(vec![
            (chunk("a", 0, 0, 2, "short passage", "S"), vec![1.0, 0.0]),
            (chunk("b", 0, 0, 200, long.trim(), "S"), vec![0.9, 0.1]),
            (chunk("c", 0, 0, 2, "another short", "S"), vec![0.8, 0.2]),
        ]);

        let results = f
            .retriever
            .retrieve_with("query", &RetrieveOptions::new(5).with_token_budget(50))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "a");
        assert!(results[0].context_tokens > 0);
    }
}
