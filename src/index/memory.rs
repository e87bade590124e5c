use super::{
    IndexError, IndexFilter, IndexSummary, ScoredRecord, SimilarityMetric, VectorIndex,
    VectorRecord, check_dimension, check_record, rank,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Process-local index with exact (brute-force) search.
pub struct MemoryIndex {
    dimension: usize,
    metric: SimilarityMetric,
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl MemoryIndex {
    /// Empty index accepting vectors of `dimension`.
    pub fn new(dimension: usize, metric: SimilarityMetric) -> Self {
        Self {
            dimension,
            metric,
            records: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<IndexSummary, IndexError> {
        for record in &records {
            check_record(self.dimension, record)?;
        }

        let mut summary = IndexSummary::default();
        let mut stored = self.records.write().await;
        for record in records {
            match stored.insert(record.chunk_id.clone(), record) {
                Some(_) => summary.updated += 1,
                None => summary.inserted += 1,
            }
        }
        tracing::trace!(
            inserted = summary.inserted,
            updated = summary.updated,
            "Memory index upsert"
        );
        Ok(summary)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<ScoredRecord>, IndexError> {
        check_dimension(self.dimension, vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let stored = self.records.read().await;
        let mut scored: Vec<ScoredRecord> = stored
            .values()
            .filter(|record| filter.admits(record))
            .map(|record| ScoredRecord {
                score: self.metric.score(vector, &record.vector),
                record: record.clone(),
            })
            .collect();
        drop(stored);

        scored.sort_by(rank);
        scored.truncate(k);
        Ok(scored)
    }

    async fn retain_document(
        &self,
        document_id: &str,
        keep: &HashSet<String>,
    ) -> Result<(), IndexError> {
        let mut stored = self.records.write().await;
        let before = stored.len();
        stored.retain(|chunk_id, record| {
            record.document_id != document_id || keep.contains(chunk_id)
        });
        tracing::trace!(document_id, removed = before - stored.len(), "Memory index pruned");
        Ok(())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.records.read().await.len())
    }
}
