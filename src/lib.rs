#![deny(missing_docs)]

//! Document ingestion, indexing, and retrieval with durable job orchestration and provider routing.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Embedding clients and the validating embedder.
pub mod embedding;
/// Vector index backends and similarity metrics.
pub mod index;
/// Job orchestration, leases, and workers.
pub mod jobs;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline, job, and routing counters.
pub mod metrics;
/// Document processing pipeline.
pub mod processing;
/// Generation and embedding providers behind a circuit-breaking router.
pub mod providers;
/// Search, question answering, and summaries over indexed chunks.
pub mod retrieval;
/// Service facade used by every front end.
pub mod service;
