//! Document processing pipeline: loading, chunking, entity extraction, embedding, and indexing.

pub mod chunking;
pub mod entities;
pub mod loader;
pub mod records;
mod service;
pub mod summarize;
pub mod types;

pub use entities::{EntityExtractor, EntityFilter};
pub use loader::{DocumentLoader, DocumentSource, FileSystemSource, MemorySource};
pub use records::{
    FileRecordStore, KeywordMatch, MemoryRecordStore, RecordCounts, RecordStore, keyword_terms,
};
pub use service::{CommitGuard, DocumentPipeline, PipelineSettings, Unguarded, entity_id};
pub use types::{
    Chunk, ChunkingError, DocumentSummary, Entity, LoadError, ProcessingError, ProcessingOutcome,
    RecordStoreError, SummaryStrategy,
};
