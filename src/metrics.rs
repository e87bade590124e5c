use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion, job, and routing activity.
#[derive(Default)]
pub struct PipelineMetrics {
    documents_indexed: AtomicU64,
    chunks_indexed: AtomicU64,
    entities_indexed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    jobs_cancelled: AtomicU64,
    provider_calls: AtomicU64,
    provider_fallbacks: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a processed document with its chunk and entity counts.
    pub fn record_document(&self, chunk_count: u64, entity_count: u64) {
        self.documents_indexed.fetch_add(1, Ordering::Relaxed);
        self.chunks_indexed.fetch_add(chunk_count, Ordering::Relaxed);
        self.entities_indexed
            .fetch_add(entity_count, Ordering::Relaxed);
    }

    /// Record a job reaching `Succeeded`.
    pub fn record_job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job reaching `Failed`.
    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job reaching `DeadLettered`.
    pub fn record_job_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job reaching `Cancelled`.
    pub fn record_job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one routed request and how many providers were skipped or failed before it.
    pub fn record_route(&self, fallbacks: u64) {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        self.provider_fallbacks
            .fetch_add(fallbacks, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            entities_indexed: self.entities_indexed.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            provider_fallbacks: self.provider_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of the counters used for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Documents that have been fully indexed since startup.
    pub documents_indexed: u64,
    /// Chunks written across all indexed documents.
    pub chunks_indexed: u64,
    /// Entities persisted across all indexed documents.
    pub entities_indexed: u64,
    /// Jobs that reached `Succeeded`.
    pub jobs_succeeded: u64,
    /// Jobs that reached `Failed`.
    pub jobs_failed: u64,
    /// Jobs that reached `DeadLettered`.
    pub jobs_dead_lettered: u64,
    /// Jobs that reached `Cancelled`.
    pub jobs_cancelled: u64,
    /// Requests served through the provider router.
    pub provider_calls: u64,
    /// Providers skipped or failed before a request was served.
    pub provider_fallbacks: u64,
}
