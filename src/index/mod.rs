//! Vector storage and nearest-neighbour queries.

mod memory;
mod qdrant;

pub use memory::MemoryIndex;
pub use qdrant::{QdrantIndex, QdrantSettings};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;

/// One embedded chunk as stored in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Deterministic chunk identifier; the upsert key.
    pub chunk_id: String,
    /// Document the chunk came from.
    pub document_id: String,
    /// Embedding values.
    pub vector: Vec<f32>,
    /// Declared width of `vector`.
    pub dimension: usize,
    /// Model that produced the vector.
    pub model: String,
}

/// A record paired with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    /// Matching record.
    pub record: VectorRecord,
    /// Similarity score; larger is closer.
    pub score: f32,
}

/// Optional constraints on a query.
#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    /// Only return chunks from these documents. Empty means any document.
    pub document_ids: Vec<String>,
}

impl IndexFilter {
    fn admits(&self, record: &VectorRecord) -> bool {
        self.document_ids.is_empty() || self.document_ids.contains(&record.document_id)
    }
}

/// How an upsert batch was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSummary {
    /// Records that did not exist before.
    pub inserted: usize,
    /// Records replaced in place.
    pub updated: usize,
}

/// Similarity function applied by the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    /// Cosine of the angle between vectors.
    #[default]
    Cosine,
    /// Raw inner product.
    Dot,
    /// `1 / (1 + euclidean distance)`.
    Euclidean,
}

impl SimilarityMetric {
    /// Score `left` against `right`; larger means more similar.
    pub fn score(self, left: &[f32], right: &[f32]) -> f32 {
        match self {
            Self::Dot => dot(left, right),
            Self::Cosine => {
                let norms = dot(left, left).sqrt() * dot(right, right).sqrt();
                if norms == 0.0 {
                    0.0
                } else {
                    dot(left, right) / norms
                }
            }
            Self::Euclidean => {
                let distance = left
                    .iter()
                    .zip(right)
                    .map(|(l, r)| (l - r) * (l - r))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + distance)
            }
        }
    }
}

fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right).map(|(l, r)| l * r).sum()
}

impl FromStr for SimilarityMetric {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "dot" => Ok(Self::Dot),
            "euclidean" | "euclid" => Ok(Self::Euclidean),
            _ => Err(()),
        }
    }
}

/// Errors returned by index backends.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Vector width differs from the index's configured dimension.
    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Offending width.
        actual: usize,
    },
    /// Backend URL could not be parsed.
    #[error("invalid index URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before a response arrived.
    #[error("index request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Backend answered with an unexpected status.
    #[error("unexpected index response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status.
        status: StatusCode,
        /// Response body.
        body: String,
    },
}

impl IndexError {
    /// Connectivity failures and server-side errors are transient.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::UnexpectedStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::DimensionMismatch { .. } | Self::InvalidUrl(_) => false,
        }
    }
}

/// Storage for chunk vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Dimension every stored vector must have.
    fn dimension(&self) -> usize;

    /// Insert or replace records keyed by chunk id. The whole batch is rejected on any
    /// dimension mismatch.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<IndexSummary, IndexError>;

    /// At most `k` records ordered by descending score, ties by ascending chunk id.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<ScoredRecord>, IndexError>;

    /// Delete records of `document_id` whose chunk id is not in `keep`.
    async fn retain_document(
        &self,
        document_id: &str,
        keep: &HashSet<String>,
    ) -> Result<(), IndexError>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize, IndexError>;
}

pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<(), IndexError> {
    if expected == actual {
        Ok(())
    } else {
        Err(IndexError::DimensionMismatch { expected, actual })
    }
}

pub(crate) fn check_record(expected: usize, record: &VectorRecord) -> Result<(), IndexError> {
    check_dimension(expected, record.dimension)?;
    check_dimension(expected, record.vector.len())
}

/// Descending score, then ascending chunk id.
pub(crate) fn rank(left: &ScoredRecord, right: &ScoredRecord) -> Ordering {
    right
        .score
        .total_cmp(&left.score)
        .then_with(|| left.record.chunk_id.cmp(&right.record.chunk_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_rank_identical_vectors_highest() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        for metric in [
            SimilarityMetric::Cosine,
            SimilarityMetric::Dot,
            SimilarityMetric::Euclidean,
        ] {
            assert!(metric.score(&a, &a) > metric.score(&a, &b), "{metric:?}");
        }
        assert_eq!(SimilarityMetric::Euclidean.score(&a, &a), 1.0);
        assert_eq!(SimilarityMetric::Cosine.score(&a, &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn metric_parses_from_config_values() {
        assert_eq!("COSINE".parse(), Ok(SimilarityMetric::Cosine));
        assert_eq!("euclid".parse(), Ok(SimilarityMetric::Euclidean));
        assert!("manhattan".parse::<SimilarityMetric>().is_err());
    }

    fn scored(chunk_id: &str, score: f32) -> ScoredRecord {
        ScoredRecord {
            record: VectorRecord {
                chunk_id: chunk_id.into(),
                document_id: "doc".into(),
                vector: vec![0.0],
                dimension: 1,
                model: "m".into(),
            },
            score,
        }
    }

    #[test]
    fn ranking_is_total_even_with_nan_scores() {
        let mut hits = vec![
            scored("c", 0.5),
            scored("nan", f32::NAN),
            scored("a", 0.9),
            scored("b", 0.5),
        ];
        hits.sort_by(rank);
        let ids: Vec<_> = hits.iter().map(|hit| hit.record.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["nan", "a", "b", "c"]);
    }

    #[test]
    fn dimension_mismatch_is_not_retriable() {
        let error = check_dimension(4, 3).expect_err("mismatch");
        assert!(!error.is_retriable());
        let server = IndexError::UnexpectedStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(server.is_retriable());
    }
}
