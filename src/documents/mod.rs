//! Document Handling Module
//!
//! Chunking of document text and the metadata store for chunk records.

pub mod chunker;
pub mod headers;
pub mod metadata;
pub mod tables;

// Re-export key public types
pub use chunker::{chunk_id, Chunk, ChunkKind, Chunker, ChunkerError, ChunkerOptions};
pub use headers::{HeaderPredicate, HeuristicHeaders, SectionHints};
pub use metadata::{MetadataStore, StoreError};
