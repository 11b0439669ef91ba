// Docrag Library
// Retrieval core: chunking, embeddings, vector index, persistence and query path

pub mod config;
pub mod context;
pub mod documents;
pub mod embeddings;
pub mod index;
pub mod persistence;
pub mod retrieval;
pub mod telemetry;

// Re-export commonly used types
pub use config::{ConfigError, RetrievalConfig, SearchMode};
pub use context::{estimate_tokens_quick, TokenCounter};
pub use documents::{
    chunk_id, Chunk, ChunkKind, Chunker, ChunkerError, ChunkerOptions, HeaderPredicate, HeuristicHeaders,
    MetadataStore, SectionHints, StoreError,
};
pub use embeddings::{
    CacheStats, CachedEmbeddingClient, Embedding, EmbeddingCache, EmbeddingClient, EmbeddingError,
    FeatureHashEmbedder, HttpEmbeddingClient, HttpEmbeddingConfig,
};
pub use index::{
    cosine_similarity, IndexDescriptor, IndexError, IndexOptions, IndexStats, SearchHit, VectorIndex,
};
pub use persistence::{Journal, JournalRecord, Manifest, PersistenceError, SnapshotDir};
pub use retrieval::{
    IngestError, IngestReport, IngestRequest, RetrievalEngine, RetrievalStats, RetrieveOptions,
    RetrievedChunk, Retriever, RetrieverError, TableInput,
};
pub use telemetry::init_tracing;
