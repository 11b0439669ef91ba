//! Retrieval Module
//!
//! Ingestion pipeline, query path and passage merging.

pub mod ingest;
pub mod merge;
pub mod retriever;

pub use ingest::{IngestError, IngestReport, IngestRequest, RetrievalEngine, RetrievalStats, TableInput};
pub use merge::{collapse_overlapping, Candidate, RetrievedChunk};
pub use retriever::{RetrieveOptions, Retriever, RetrieverError};
