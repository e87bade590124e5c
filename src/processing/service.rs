//! Document pipeline coordinating loading, chunking, extraction, embedding, and indexing.

use super::{
    chunking::chunk_text,
    entities::{EntityExtractor, EntityFilter},
    loader::DocumentLoader,
    records::RecordStore,
    summarize::summarize_document,
    types::{Chunk, Entity, ProcessingError, ProcessingOutcome},
};
use crate::{
    embedding::Embedder,
    index::{IndexSummary, VectorIndex, VectorRecord},
    jobs::JobPayload,
    metrics::PipelineMetrics,
    providers::ProviderRouter,
};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt, stream};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// Tuning knobs for [`DocumentPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Chunks processed in parallel within one job.
    pub chunk_concurrency: usize,
    /// Word budget for document summaries.
    pub summary_max_words: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_concurrency: 4,
            summary_max_words: 120,
        }
    }
}

/// Checked immediately before every durable write.
///
/// The worker implements this over its lease so that a job that was cancelled, or whose lease
/// was reclaimed, stops writing as soon as it finds out.
#[async_trait]
pub trait CommitGuard: Send + Sync {
    /// `Ok` if the caller may still persist results.
    async fn ensure_current(&self) -> Result<(), ProcessingError>;
}

/// Guard that never objects; used outside the job system.
pub struct Unguarded;

#[async_trait]
impl CommitGuard for Unguarded {
    async fn ensure_current(&self) -> Result<(), ProcessingError> {
        Ok(())
    }
}

/// Turns a job payload into chunk, vector, entity, and summary records.
///
/// Every write is keyed by a deterministic id, so running the same payload twice leaves the
/// stores exactly as one run would. Stages for one chunk run in order (extract, embed, persist);
/// different chunks run concurrently up to [`PipelineSettings::chunk_concurrency`].
pub struct DocumentPipeline {
    loader: Arc<DocumentLoader>,
    embedder: Embedder,
    extractor: Arc<EntityExtractor>,
    index: Arc<dyn VectorIndex>,
    records: Arc<dyn RecordStore>,
    router: Option<Arc<ProviderRouter>>,
    metrics: Arc<PipelineMetrics>,
    settings: PipelineSettings,
}

struct ChunkOutcome {
    entities: usize,
    index: IndexSummary,
}

impl DocumentPipeline {
    /// Assemble a pipeline. Without a router, summaries are always extractive.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        loader: Arc<DocumentLoader>,
        embedder: Embedder,
        extractor: Arc<EntityExtractor>,
        index: Arc<dyn VectorIndex>,
        records: Arc<dyn RecordStore>,
        router: Option<Arc<ProviderRouter>>,
        metrics: Arc<PipelineMetrics>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            loader,
            embedder,
            extractor,
            index,
            records,
            router,
            metrics,
            settings,
        }
    }

    /// Loader used to resolve document references.
    pub fn loader(&self) -> &Arc<DocumentLoader> {
        &self.loader
    }

    /// Process one document end to end.
    pub async fn process(
        &self,
        payload: &JobPayload,
        guard: &dyn CommitGuard,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let document_id = payload.document_ref.as_str();
        tracing::info!(document_id, "Processing document");

        let text = self.loader.load(&payload.document_ref).await?;
        let chunks = chunk_text(
            document_id,
            &text,
            payload.chunk_size,
            payload.chunk_overlap,
        )?;
        tracing::debug!(
            document_id,
            chunks = chunks.len(),
            chunk_size = payload.chunk_size,
            overlap = payload.chunk_overlap,
            "Document chunked"
        );

        let filter = EntityFilter {
            confidence_threshold: payload.confidence_threshold,
            entity_types: payload.entity_types.clone(),
        };
        let concurrency = self.settings.chunk_concurrency.max(1);
        let outcomes: Vec<ChunkOutcome> = stream::iter(chunks.iter().cloned())
            .map(|chunk| self.process_chunk(chunk, &filter, guard))
            .buffered(concurrency)
            .try_collect()
            .await?;

        // Chunks a previous version of the document produced but this one no longer does.
        let keep: HashSet<String> = chunks.iter().map(|chunk| chunk.id.clone()).collect();
        guard.ensure_current().await?;
        self.index.retain_document(document_id, &keep).await?;
        let pruned = self.records.retain_chunks(document_id, &keep).await?;
        if pruned > 0 {
            tracing::info!(document_id, pruned, "Removed chunks no longer in the document");
        }

        let entity_count = outcomes.iter().map(|outcome| outcome.entities).sum();
        let inserted = outcomes.iter().map(|outcome| outcome.index.inserted).sum();
        let updated = outcomes.iter().map(|outcome| outcome.index.updated).sum();

        let summary = if payload.summarize && !chunks.is_empty() {
            let summary = summarize_document(
                self.router.as_deref(),
                document_id,
                &chunks,
                self.settings.summary_max_words,
            )
            .await;
            let strategy = summary.strategy;
            guard.ensure_current().await?;
            self.records.put_summary(summary).await?;
            Some(strategy)
        } else {
            None
        };

        self.metrics
            .record_document(chunks.len() as u64, entity_count as u64);
        tracing::info!(
            document_id,
            chunks = chunks.len(),
            entities = entity_count,
            inserted,
            updated,
            summarized = summary.is_some(),
            "Document indexed"
        );

        Ok(ProcessingOutcome {
            document_id: document_id.to_string(),
            chunk_count: chunks.len(),
            entity_count,
            inserted,
            updated,
            summary,
        })
    }

    async fn process_chunk(
        &self,
        chunk: Chunk,
        filter: &EntityFilter,
        guard: &dyn CommitGuard,
    ) -> Result<ChunkOutcome, ProcessingError> {
        let entities: Vec<Entity> = self
            .extractor
            .extract(&chunk.text, filter)
            .into_iter()
            .map(|candidate| Entity {
                id: entity_id(&chunk.id, &candidate.entity_type, candidate.start, candidate.end),
                entity_type: candidate.entity_type,
                text: candidate.text,
                confidence: candidate.confidence,
                start: candidate.start,
                end: candidate.end,
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
            })
            .collect();

        let vector = self.embedder.embed(&chunk.text).await?;
        let record = VectorRecord {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            dimension: vector.len(),
            vector,
            model: self.embedder.model().to_string(),
        };

        guard.ensure_current().await?;
        let index = self.index.upsert(vec![record]).await?;
        let entity_count = entities.len();
        let chunk_id = chunk.id.clone();
        let ordinal = chunk.ordinal;
        self.records.put_chunk(chunk).await?;
        self.records.put_entities(&chunk_id, entities).await?;
        tracing::trace!(chunk_id, ordinal, entities = entity_count, "Chunk persisted");

        Ok(ChunkOutcome {
            entities: entity_count,
            index,
        })
    }
}

/// Stable entity identifier.
pub fn entity_id(chunk_id: &str, entity_type: &str, start: usize, end: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chunk_id.as_bytes());
    hasher.update([0]);
    hasher.update(entity_type.as_bytes());
    hasher.update([0]);
    hasher.update(start.to_le_bytes());
    hasher.update(end.to_le_bytes());
    hex::encode(hasher.finalize())
}
