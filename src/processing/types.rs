//! Records and error definitions for the document pipeline.

use crate::embedding::EmbeddingError;
use crate::index::IndexError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Contiguous span of a document; the unit of embedding and extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic identifier derived from the document and chunking parameters.
    pub id: String,
    /// Source document identifier.
    pub document_id: String,
    /// Zero-based position within the document.
    pub ordinal: usize,
    /// Inclusive start offset, in characters.
    pub start: usize,
    /// Exclusive end offset, in characters.
    pub end: usize,
    /// Characters shared with the previous chunk.
    pub overlap: usize,
    /// Chunk contents.
    pub text: String,
}

/// Typed, scored span found inside a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Deterministic identifier derived from chunk, type and span.
    pub id: String,
    /// Type tag such as `EMAIL` or `PERSON`.
    pub entity_type: String,
    /// Matched text.
    pub text: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    /// Start offset within the chunk, in characters.
    pub start: usize,
    /// Exclusive end offset within the chunk, in characters.
    pub end: usize,
    /// Owning chunk.
    pub chunk_id: String,
    /// Source document.
    pub document_id: String,
}

/// How a document summary was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStrategy {
    /// Generated by a provider.
    Abstractive,
    /// Assembled from leading sentences.
    Extractive,
}

/// Summary stored alongside an indexed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    /// Summarized document.
    pub document_id: String,
    /// Summary text.
    pub text: String,
    /// Strategy that produced `text`.
    pub strategy: SummaryStrategy,
    /// Provider that served an abstractive summary.
    pub provider: Option<String>,
}

/// Counters describing one processed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    /// Document identifier.
    pub document_id: String,
    /// Chunks produced and persisted.
    pub chunk_count: usize,
    /// Entities persisted across all chunks.
    pub entity_count: usize,
    /// Vectors new to the index.
    pub inserted: usize,
    /// Vectors replaced in place.
    pub updated: usize,
    /// Summary strategy, when summarization was requested.
    pub summary: Option<SummaryStrategy>,
}

/// Invalid chunking parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkingError {
    /// Chunks must hold at least one character.
    #[error("chunk size must be greater than zero")]
    ZeroSize,
    /// Overlap must leave room for progress.
    #[error("chunk overlap {overlap} must be smaller than chunk size {max_size}")]
    OverlapTooLarge {
        /// Requested overlap.
        overlap: usize,
        /// Requested maximum size.
        max_size: usize,
    },
}

/// Failures while fetching or decoding document bytes.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Reference does not resolve to a document.
    #[error("document not found: {0}")]
    NotFound(String),
    /// Filesystem reference resolves outside the document root.
    #[error("document {0} is outside the document root")]
    OutsideRoot(String),
    /// Bytes could not be turned into text.
    #[error("document {reference} is not valid text: {reason}")]
    Undecodable {
        /// Offending reference.
        reference: String,
        /// Decoder message.
        reason: String,
    },
    /// Storage read failed.
    #[error("failed to read {reference}: {source}")]
    Io {
        /// Reference being read.
        reference: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Failures reported by a record store.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    /// Backend could not be reached or written.
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    /// Reading or writing durable records failed.
    #[error("record store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Durable records could not be encoded or decoded.
    #[error("record store data is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl RecordStoreError {
    /// Outages and I/O errors are transient; corrupt data is not.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Corrupt(_))
    }
}

/// Errors emitted by the document pipeline.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Chunking parameters were rejected.
    #[error("Failed to chunk document: {0}")]
    Chunking(#[from] ChunkingError),
    /// Document could not be loaded.
    #[error("Failed to load document: {0}")]
    Load(#[from] LoadError),
    /// Embedding failed.
    #[error("Failed to generate embeddings: {0}")]
    Embedding(#[from] EmbeddingError),
    /// Index write failed.
    #[error("Failed to index document: {0}")]
    Index(#[from] IndexError),
    /// Chunk or entity write failed.
    #[error("Failed to persist records: {0}")]
    Records(#[from] RecordStoreError),
    /// Job was cancelled while running; results were discarded.
    #[error("job cancelled; results discarded")]
    Cancelled,
    /// Lease is no longer held; results were discarded.
    #[error("lease lost; results discarded")]
    LeaseLost,
}

impl ProcessingError {
    /// Whether the orchestrator should retry the job.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Chunking(_) | Self::Cancelled | Self::LeaseLost => false,
            Self::Load(error) => matches!(error, LoadError::Io { .. }),
            Self::Embedding(error) => error.is_retriable(),
            Self::Index(error) => error.is_retriable(),
            Self::Records(error) => error.is_retriable(),
        }
    }
}
