//! Retrieval engine: ingestion pipeline plus query entry points.
//!
//! A document is chunked, its chunks embedded with bounded concurrency, and
//! the chunk/vector pairs committed to the metadata store and vector index as
//! one batch under both write locks. A document either lands completely or
//! not at all. With a snapshot directory attached, every commit is journaled
//! before it is applied and checkpoints are written on request (and
//! periodically after `journal_checkpoint_every` journaled records).

use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::merge::RetrievedChunk;
use super::retriever::{RetrieveOptions, Retriever, RetrieverError};
use crate::config::{ConfigError, RetrievalConfig};
use crate::documents::chunker::{Chunk, Chunker, ChunkerError};
use crate::documents::headers::{HeaderPredicate, SectionHints};
use crate::documents::metadata::MetadataStore;
use crate::embeddings::{
    embed_batch_with_timeout, CacheStats, CachedEmbeddingClient, Embedding, EmbeddingClient, EmbeddingError,
};
use crate::index::{IndexError, IndexStats, VectorIndex};
use crate::persistence::{Journal, JournalRecord, Manifest, PersistenceError, SnapshotDir};

/// Chunks sent per embedding call
const EMBED_BATCH_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Chunking failed: {0}")]
    Chunking(#[from] ChunkerError),
    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Document already ingested: {0}")]
    DuplicateDocument(String),
    #[error("Invalid document ID: {0:?}")]
    InvalidDocumentId(String),
}

impl Serialize for IngestError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A table handed over by the extraction step, kept as one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct TableInput {
    pub text: String,
    pub section: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub document_id: String,
    pub text: String,
    pub section_hints: Vec<String>,
    pub tables: Vec<TableInput>,
}

impl IngestRequest {
    pub fn new(document_id: &str, text: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            text: text.to_string(),
            section_hints: Vec::new(),
            tables: Vec::new(),
        }
    }

    pub fn with_section_hints<I, S>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.section_hints.extend(hints.into_iter().map(Into::into));
        self
    }

    pub fn with_table(mut self, text: &str, section: Option<&str>) -> Self {
        self.tables.push(TableInput {
            text: text.to_string(),
            section: section.map(|s| s.to_string()),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub document_id: String,
    pub chunks: usize,
    pub table_chunks: usize,
    pub tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalStats {
    pub documents: usize,
    pub chunks: usize,
    pub index: IndexStats,
    pub consistency_faults: u64,
    pub cache: Option<CacheStats>,
    /// Journal records written since the last checkpoint
    pub journaled: usize,
}

struct Durability {
    snapshots: SnapshotDir,
    journal: Journal,
}

pub struct RetrievalEngine {
    config: RetrievalConfig,
    chunker: Chunker,
    embedder: Arc<dyn EmbeddingClient>,
    cache: Option<Arc<CachedEmbeddingClient>>,
    index: Arc<RwLock<VectorIndex>>,
    store: Arc<RwLock<MetadataStore>>,
    retriever: Retriever,
    /// Serializes commits and owns the journal when persistence is attached
    commit: Mutex<Option<Durability>>,
}

impl RetrievalEngine {
    /// In-memory engine with no persistence.
    pub fn new(config: RetrievalConfig, embedder: Arc<dyn EmbeddingClient>) -> Result<Self, IngestError> {
        config.validate()?;
        let index = VectorIndex::new(embedder.descriptor(), config.index_options());
        Self::assemble(config, embedder, index, MetadataStore::new(), None)
    }

    /// Open (or create) a snapshot directory, load the committed generation
    /// and replay its journal. A snapshot built for a different model or
    /// dimension is rejected with `IncompatibleIndex`.
    pub fn open(
        dir: &Path,
        config: RetrievalConfig,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        let snapshots = SnapshotDir::new(dir);
        let descriptor = embedder.descriptor();

        let (manifest, journal, records, mut index, mut store) =
            match snapshots.load(&descriptor, config.index_options())? {
                Some(state) => {
                    let (journal, records) = Journal::open(&snapshots.journal_path(&state.manifest))?;
                    (state.manifest, journal, records, state.index, state.store)
                }
                None => {
                    let index = VectorIndex::new(descriptor.clone(), config.index_options());
                    let store = MetadataStore::new();
                    let checkpoint = snapshots.write_checkpoint(&index, &store)?;
                    (checkpoint.manifest, checkpoint.journal, Vec::new(), index, store)
                }
            };

        let replayed = records.len();
        for record in records {
            replay(&mut index, &mut store, record)?;
        }
        info!(
            dir = ?dir,
            generation = %manifest.generation,
            documents = store.document_count(),
            chunks = store.len(),
            replayed,
            "Opened retrieval index"
        );

        let durability = Durability { snapshots, journal };
        Self::assemble(config, embedder, index, store, Some(durability))
    }

    fn assemble(
        config: RetrievalConfig,
        embedder: Arc<dyn EmbeddingClient>,
        index: VectorIndex,
        store: MetadataStore,
        durability: Option<Durability>,
    ) -> Result<Self, IngestError> {
        let chunker = Chunker::new(config.chunker_options())?;
        let (embedder, cache): (Arc<dyn EmbeddingClient>, _) = if config.embedding_cache_capacity > 0 {
            let cached = Arc::new(CachedEmbeddingClient::new(embedder, config.embedding_cache_capacity));
            let shared: Arc<dyn EmbeddingClient> = cached.clone();
            (shared, Some(cached))
        } else {
            (embedder, None)
        };

        let index = Arc::new(RwLock::new(index));
        let store = Arc::new(RwLock::new(store));
        let retriever = Retriever::new(embedder.clone(), index.clone(), store.clone(), &config);

        Ok(Self {
            config,
            chunker,
            embedder,
            cache,
            index,
            store,
            retriever,
            commit: Mutex::new(durability),
        })
    }

    /// Replace the section header heuristic used for new documents.
    pub fn with_header_predicate<P>(mut self, predicate: P) -> Self
    where
        P: HeaderPredicate + 'static,
    {
        self.chunker = self.chunker.with_header_predicate(predicate);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn is_durable(&self) -> bool {
        self.commit.lock().is_some()
    }

    /// Chunk, embed and commit one document. Nothing is indexed unless every
    /// chunk was embedded.
    pub async fn ingest_document(&self, request: IngestRequest) -> Result<IngestReport, IngestError> {
        let document_id = request.document_id.trim().to_string();
        if document_id.is_empty() {
            return Err(IngestError::InvalidDocumentId(request.document_id));
        }
        if self.store.read().contains_document(&document_id) {
            return Err(IngestError::DuplicateDocument(document_id));
        }

        let chunks = self.chunk_request(&document_id, &request);
        if chunks.is_empty() {
            return Err(ChunkerError::EmptyDocument(document_id).into());
        }
        let table_chunks = chunks.iter().filter(|c| c.is_table()).count();
        let tokens = request.text.split_whitespace().count();

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embed_all(&document_id, &texts).await?;

        let report = IngestReport {
            document_id: document_id.clone(),
            chunks: chunks.len(),
            table_chunks,
            tokens,
        };
        let checkpoint_due = self.commit_document(document_id, chunks, vectors)?;
        info!(
            doc_id = %report.document_id,
            chunks = report.chunks,
            tables = report.table_chunks,
            "Ingested document"
        );

        if checkpoint_due {
            if let Err(e) = self.checkpoint() {
                warn!(error = %e, "Periodic checkpoint failed, journal retained");
            }
        }
        Ok(report)
    }

    fn chunk_request(&self, document_id: &str, request: &IngestRequest) -> Vec<Chunk> {
        let hints = SectionHints::new(request.section_hints.iter().cloned());
        let hints = (!hints.is_empty()).then_some(&hints);
        let mut chunks = self.chunker.chunk(document_id, &request.text, hints);

        for table in &request.tables {
            let index = chunks.len() as u32;
            if let Some(chunk) = self
                .chunker
                .table_chunk(document_id, index, &table.text, table.section.as_deref())
            {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Embed every text in order, batches in flight bounded by the worker count.
    async fn embed_all(&self, document_id: &str, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        // Batches are owned: a borrowed closure argument makes the future not `Send`.
        let batches: Vec<Vec<String>> = texts.chunks(EMBED_BATCH_SIZE).map(|batch| batch.to_vec()).collect();
        let batches: Vec<Vec<Embedding>> = stream::iter(batches)
            .map(move |batch| async move { self.embed_with_retry(document_id, &batch).await })
            .buffered(self.config.embedding_workers)
            .try_collect()
            .await?;
        Ok(batches.into_iter().flatten().collect())
    }

    async fn embed_with_retry(&self, document_id: &str, batch: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let timeout = self.config.embedding_timeout();
        let mut attempt = 0u32;
        loop {
            match embed_batch_with_timeout(self.embedder.as_ref(), batch, timeout).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() && attempt < self.config.embedding_max_retries => {
                    let backoff = self.config.retry_backoff(attempt);
                    warn!(
                        doc_id = %document_id,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Embedding failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(doc_id = %document_id, error = %e, "Embedding failed, document not ingested");
                    return Err(e);
                }
            }
        }
    }

    /// Journal then apply one document's chunks. Returns whether a periodic
    /// checkpoint is due.
    fn commit_document(
        &self,
        document_id: String,
        chunks: Vec<Chunk>,
        vectors: Vec<Embedding>,
    ) -> Result<bool, IngestError> {
        let mut durability = self.commit.lock();

        // Re-check under the commit lock: a concurrent ingest may have won.
        if self.store.read().contains_document(&document_id) {
            return Err(IngestError::DuplicateDocument(document_id));
        }
        if chunks.len() != vectors.len() {
            return Err(EmbeddingError::Unavailable(format!(
                "{} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            ))
            .into());
        }
        // Nothing reaches the journal that the index would refuse.
        {
            let index = self.index.read();
            for (chunk, vector) in chunks.iter().zip(&vectors) {
                index.check_insert(&chunk.id, vector)?;
            }
        }
        let mut seen = HashSet::with_capacity(chunks.len());
        if let Some(dup) = chunks.iter().find(|c| !seen.insert(c.id.as_str())) {
            return Err(IndexError::DuplicateId(dup.id.clone()).into());
        }

        let mut checkpoint_due = false;
        if let Some(d) = durability.as_mut() {
            let record = JournalRecord::Commit {
                document_id: document_id.clone(),
                chunks: chunks.clone(),
                vectors: vectors.clone(),
            };
            d.journal.append(&record)?;
            checkpoint_due = d.journal.appended() >= self.config.journal_checkpoint_every;
        }

        apply_commit(&mut self.index.write(), &mut self.store.write(), chunks, vectors)?;
        debug!(doc_id = %document_id, "Committed document batch");
        Ok(checkpoint_due)
    }

    /// Remove every chunk of a document from the store and the index.
    /// Removing an unknown document is a no-op returning 0.
    pub fn remove_document(&self, document_id: &str) -> Result<usize, IngestError> {
        let mut durability = self.commit.lock();
        if !self.store.read().contains_document(document_id) {
            return Ok(0);
        }
        if let Some(d) = durability.as_mut() {
            d.journal.append(&JournalRecord::RemoveDocument {
                document_id: document_id.to_string(),
            })?;
        }

        let removed = apply_removal(&mut self.index.write(), &mut self.store.write(), document_id);
        info!(doc_id = %document_id, chunks = removed, "Removed document");
        Ok(removed)
    }

    /// Write a full snapshot and start a fresh journal. Searches keep running
    /// while the snapshot is written; ingestion waits. Returns `None` for an
    /// in-memory engine.
    pub fn checkpoint(&self) -> Result<Option<Manifest>, IngestError> {
        let mut durability = self.commit.lock();
        let Some(d) = durability.as_mut() else {
            return Ok(None);
        };

        let checkpoint = {
            let mut index = self.index.write();
            index.compact();
            let index = parking_lot::RwLockWriteGuard::downgrade(index);
            let store = self.store.read();
            d.snapshots.write_checkpoint(&index, &store)?
        };
        d.journal = checkpoint.journal;
        Ok(Some(checkpoint.manifest))
    }

    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        min_score: Option<f64>,
    ) -> Result<Vec<RetrievedChunk>, RetrieverError> {
        self.retriever.retrieve(query, k, min_score).await
    }

    pub async fn retrieve_with(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievedChunk>, RetrieverError> {
        self.retriever.retrieve_with(query, options).await
    }

    /// Chunks of one document in order
    pub fn document_chunks(&self, document_id: &str) -> Vec<Chunk> {
        self.store
            .read()
            .chunks_for_document(document_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RetrievalStats {
        let journaled = self
            .commit
            .lock()
            .as_ref()
            .map_or(0, |d| d.journal.appended());
        let index = self.index.read().stats();
        let store = self.store.read();
        RetrievalStats {
            documents: store.document_count(),
            chunks: store.len(),
            index,
            consistency_faults: self.retriever.consistency_faults(),
            cache: self.cache.as_ref().map(|c| c.stats()),
            journaled,
        }
    }
}

fn apply_commit(
    index: &mut VectorIndex,
    store: &mut MetadataStore,
    chunks: Vec<Chunk>,
    vectors: Vec<Embedding>,
) -> Result<(), IndexError> {
    let pairs = chunks
        .iter()
        .map(|c| c.id.clone())
        .zip(vectors)
        .collect();
    index.add_batch(pairs)?;
    store.put_batch(chunks);
    Ok(())
}

fn apply_removal(index: &mut VectorIndex, store: &mut MetadataStore, document_id: &str) -> usize {
    let ids = store.delete_by_document(document_id);
    for id in &ids {
        index.remove(id);
    }
    ids.len()
}

fn replay(index: &mut VectorIndex, store: &mut MetadataStore, record: JournalRecord) -> Result<(), PersistenceError> {
    match record {
        JournalRecord::Commit {
            document_id,
            chunks,
            vectors,
        } => {
            if chunks.len() != vectors.len() {
                return Err(PersistenceError::Corrupt(format!(
                    "journal commit for {} has {} chunks and {} vectors",
                    document_id,
                    chunks.len(),
                    vectors.len()
                )));
            }
            if store.contains_document(&document_id) {
                warn!(doc_id = %document_id, "Journal commit for a document already present, skipping");
                return Ok(());
            }
            apply_commit(index, store, chunks, vectors)?;
        }
        JournalRecord::RemoveDocument { document_id } => {
            apply_removal(index, store, &document_id);
        }
    }
    Ok(())
}
