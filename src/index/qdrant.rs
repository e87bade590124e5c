//! Qdrant-backed vector index over the REST API.

use super::{
    IndexError, IndexFilter, IndexSummary, ScoredRecord, SimilarityMetric, VectorIndex,
    VectorRecord, check_dimension, check_record, rank,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Connection parameters for a Qdrant collection.
#[derive(Debug, Clone)]
pub struct QdrantSettings {
    /// Base URL, e.g. `http://localhost:6333`.
    pub url: String,
    /// Collection holding chunk vectors.
    pub collection: String,
    /// Optional API key sent as `api-key`.
    pub api_key: Option<String>,
    /// Vector width of the collection.
    pub dimension: usize,
    /// Distance function used when the collection is created.
    pub metric: SimilarityMetric,
}

/// Index storing one Qdrant point per chunk, keyed by a UUID derived from the chunk id.
pub struct QdrantIndex {
    client: Client,
    base_url: String,
    settings: QdrantSettings,
}

impl QdrantIndex {
    /// Build a client without touching the server.
    pub fn new(settings: QdrantSettings) -> Result<Self, IndexError> {
        let client = Client::builder().user_agent("librarian/0.1").build()?;
        let base_url = normalize_base_url(&settings.url).map_err(IndexError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            collection = %settings.collection,
            has_api_key = settings.api_key.as_deref().is_some_and(|key| !key.is_empty()),
            "Initialized Qdrant index"
        );
        Ok(Self {
            client,
            base_url,
            settings,
        })
    }

    /// Build a client and make sure the collection and its payload index exist.
    pub async fn connect(settings: QdrantSettings) -> Result<Self, IndexError> {
        let index = Self::new(settings)?;
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<(), IndexError> {
        let collection = &self.settings.collection;
        let response = self
            .request(Method::GET, &format!("collections/{collection}"))
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => {
                let info: CollectionInfo = response.json().await?;
                if let Some(size) = info.vector_size() {
                    check_dimension(self.settings.dimension, size)?;
                }
                tracing::debug!(collection = %collection, "Using existing Qdrant collection");
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(IndexError::UnexpectedStatus { status, body });
            }
        }

        let distance = match self.settings.metric {
            SimilarityMetric::Cosine => "Cosine",
            SimilarityMetric::Dot => "Dot",
            SimilarityMetric::Euclidean => "Euclid",
        };
        let response = self
            .request(Method::PUT, &format!("collections/{collection}"))
            .json(&json!({
                "vectors": { "size": self.settings.dimension, "distance": distance }
            }))
            .send()
            .await?;
        ensure_success(response).await?;
        tracing::info!(collection = %collection, distance, "Created Qdrant collection");

        let response = self
            .request(Method::PUT, &format!("collections/{collection}/index"))
            .json(&json!({ "field_name": "document_id", "field_schema": "keyword" }))
            .send()
            .await?;
        if response.status() != StatusCode::CONFLICT {
            ensure_success(response).await?;
        }
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.client.request(method, url);
        if let Some(api_key) = &self.settings.api_key
            && !api_key.is_empty()
        {
            request = request.header("api-key", api_key);
        }
        request
    }

    fn to_score(&self, raw: f32) -> f32 {
        match self.settings.metric {
            // Qdrant reports the raw distance for Euclid.
            SimilarityMetric::Euclidean => 1.0 / (1.0 + raw),
            SimilarityMetric::Cosine | SimilarityMetric::Dot => raw,
        }
    }
}

/// Stable Qdrant point id for a chunk id.
pub(crate) fn point_id(chunk_id: &str) -> Uuid {
    let digest = Sha256::digest(chunk_id.as_bytes());
    let mut bytes = [0_u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn dimension(&self) -> usize {
        self.settings.dimension
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<IndexSummary, IndexError> {
        if records.is_empty() {
            return Ok(IndexSummary::default());
        }
        for record in &records {
            check_record(self.settings.dimension, record)?;
        }

        let points: Vec<_> = records
            .iter()
            .map(|record| {
                json!({
                    "id": point_id(&record.chunk_id).to_string(),
                    "vector": record.vector,
                    "payload": {
                        "chunk_id": record.chunk_id,
                        "document_id": record.document_id,
                        "dimension": record.dimension,
                        "model": record.model,
                    },
                })
            })
            .collect();
        let count = points.len();

        let response = self
            .request(
                Method::PUT,
                &format!("collections/{}/points", self.settings.collection),
            )
            .query(&[("wait", true)])
            .json(&json!({ "points": points }))
            .send()
            .await?;
        ensure_success(response).await?;
        tracing::debug!(collection = %self.settings.collection, points = count, "Points upserted");

        // Qdrant does not say which points already existed.
        Ok(IndexSummary {
            inserted: count,
            updated: 0,
        })
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<ScoredRecord>, IndexError> {
        check_dimension(self.settings.dimension, vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut body = json!({
            "query": vector,
            "limit": k,
            "with_payload": true,
            "with_vector": true,
        });
        if !filter.document_ids.is_empty() {
            body["filter"] = json!({
                "must": [{ "key": "document_id", "match": { "any": filter.document_ids } }]
            });
        }

        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/query", self.settings.collection),
            )
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = IndexError::UnexpectedStatus { status, body };
            tracing::error!(collection = %self.settings.collection, error = %error, "Qdrant query failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResult::Points(points) => points,
            QueryResult::Object { points } => points,
        };
        let mut scored: Vec<ScoredRecord> = points
            .into_iter()
            .filter_map(|point| {
                let record = record_from_point(point.payload?, point.vector?)?;
                Some(ScoredRecord {
                    score: self.to_score(point.score),
                    record,
                })
            })
            .collect();
        scored.sort_by(rank);
        scored.truncate(k);
        Ok(scored)
    }

    async fn retain_document(
        &self,
        document_id: &str,
        keep: &HashSet<String>,
    ) -> Result<(), IndexError> {
        let mut keep_ids: Vec<String> = keep
            .iter()
            .map(|chunk_id| point_id(chunk_id).to_string())
            .collect();
        keep_ids.sort();
        let mut filter = json!({
            "must": [{ "key": "document_id", "match": { "value": document_id } }]
        });
        if !keep_ids.is_empty() {
            filter["must_not"] = json!([{ "has_id": keep_ids }]);
        }

        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/delete", self.settings.collection),
            )
            .query(&[("wait", true)])
            .json(&json!({ "filter": filter }))
            .send()
            .await?;
        ensure_success(response).await?;
        tracing::debug!(
            collection = %self.settings.collection,
            document_id,
            kept = keep.len(),
            "Stale points deleted"
        );
        Ok(())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/count", self.settings.collection),
            )
            .json(&json!({ "exact": true }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::UnexpectedStatus { status, body });
        }
        let payload: CountResponse = response.json().await?;
        Ok(payload.result.count)
    }
}

fn record_from_point(payload: Map<String, Value>, vector: Vec<f32>) -> Option<VectorRecord> {
    let text = |key: &str| payload.get(key)?.as_str().map(str::to_string);
    Some(VectorRecord {
        chunk_id: text("chunk_id")?,
        document_id: text("document_id")?,
        dimension: payload
            .get("dimension")
            .and_then(Value::as_u64)
            .map_or(vector.len(), |value| value as usize),
        model: text("model").unwrap_or_default(),
        vector,
    })
}

async fn ensure_success(response: reqwest::Response) -> Result<(), IndexError> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let error = IndexError::UnexpectedStatus { status, body };
    tracing::error!(error = %error, "Qdrant request failed");
    Err(error)
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
struct QueryPoint {
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

#[derive(Deserialize)]
struct CollectionInfo {
    result: Value,
}

impl CollectionInfo {
    /// Size of the unnamed vector, when the collection has one.
    fn vector_size(&self) -> Option<usize> {
        self.result
            .pointer("/config/params/vectors/size")
            .and_then(Value::as_u64)
            .map(|size| size as usize)
    }
}

#[derive(Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{
        Method::{GET, POST, PUT},
        MockServer,
    };

    fn settings(server: &MockServer, metric: SimilarityMetric) -> QdrantSettings {
        QdrantSettings {
            url: server.base_url(),
            collection: "chunks".into(),
            api_key: Some("key".into()),
            dimension: 2,
            metric,
        }
    }

    #[test]
    fn point_ids_are_stable_per_chunk() {
        assert_eq!(point_id("chunk-1"), point_id("chunk-1"));
        assert_ne!(point_id("chunk-1"), point_id("chunk-2"));
    }

    #[tokio::test]
    async fn connect_creates_missing_collection() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/chunks");
                then.status(404);
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/chunks")
                    .header("api-key", "key")
                    .json_body_partial(r#"{"vectors":{"size":2,"distance":"Dot"}}"#);
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        let payload_index = server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/chunks/index");
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;

        QdrantIndex::connect(settings(&server, SimilarityMetric::Dot))
            .await
            .expect("connected");
        create.assert();
        payload_index.assert();
    }

    #[tokio::test]
    async fn existing_collection_with_other_dimension_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/chunks");
                then.status(200).json_body(json!({
                    "result": { "config": { "params": {
                        "vectors": { "size": 768, "distance": "Cosine" }
                    } } }
                }));
            })
            .await;

        let error = QdrantIndex::connect(settings(&server, SimilarityMetric::Cosine))
            .await
            .err()
            .expect("dimension mismatch");
        assert!(matches!(
            error,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 768
            }
        ));
    }

    #[tokio::test]
    async fn existing_collection_with_matching_dimension_is_reused() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/chunks");
                then.status(200).json_body(json!({
                    "result": { "config": { "params": {
                        "vectors": { "size": 2, "distance": "Cosine" }
                    } } }
                }));
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/chunks");
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;

        QdrantIndex::connect(settings(&server, SimilarityMetric::Cosine))
            .await
            .expect("connected");
        create.assert_hits(0);
    }

    #[tokio::test]
    async fn retain_deletes_other_points_of_the_document() {
        let server = MockServer::start_async().await;
        let kept = point_id("chunk-0").to_string();
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/chunks/points/delete")
                    .query_param("wait", "true")
                    .json_body_partial(
                        r#"{"filter":{"must":[{"key":"document_id","match":{"value":"doc"}}]}}"#,
                    )
                    .body_contains(kept.as_str());
                then.status(200).json_body(json!({ "result": { "status": "completed" } }));
            })
            .await;

        let index = QdrantIndex::new(settings(&server, SimilarityMetric::Cosine)).unwrap();
        index
            .retain_document("doc", &HashSet::from(["chunk-0".to_string()]))
            .await
            .expect("pruned");
        mock.assert();
    }

    #[tokio::test]
    async fn upsert_sends_deterministic_point_ids() {
        let server = MockServer::start_async().await;
        let expected_id = point_id("chunk-1").to_string();
        let mock = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/chunks/points")
                    .query_param("wait", "true")
                    .body_contains(expected_id.as_str());
                then.status(200).json_body(json!({ "result": { "status": "completed" } }));
            })
            .await;

        let index = QdrantIndex::new(settings(&server, SimilarityMetric::Cosine)).unwrap();
        let summary = index
            .upsert(vec![VectorRecord {
                chunk_id: "chunk-1".into(),
                document_id: "doc".into(),
                vector: vec![0.6, 0.8],
                dimension: 2,
                model: "hash-embed-v1".into(),
            }])
            .await
            .expect("upsert");

        mock.assert();
        assert_eq!(summary.inserted, 1);
    }

    #[tokio::test]
    async fn query_rebuilds_records_and_breaks_ties_by_chunk_id() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/chunks/points/query")
                    .json_body_partial(r#"{"limit":2}"#);
                then.status(200).json_body(json!({
                    "result": { "points": [
                        { "id": "x", "score": 0.5, "vector": [1.0, 0.0],
                          "payload": { "chunk_id": "b", "document_id": "doc", "dimension": 2, "model": "m" } },
                        { "id": "y", "score": 0.5, "vector": [0.0, 1.0],
                          "payload": { "chunk_id": "a", "document_id": "doc", "dimension": 2, "model": "m" } }
                    ] }
                }));
            })
            .await;

        let index = QdrantIndex::new(settings(&server, SimilarityMetric::Cosine)).unwrap();
        let hits = index
            .query(&[1.0, 0.0], 2, &IndexFilter::default())
            .await
            .expect("query");
        let ids: Vec<_> = hits.iter().map(|hit| hit.record.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(hits[0].record.vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn query_rejects_wrong_dimension_without_calling_server() {
        let server = MockServer::start_async().await;
        let index = QdrantIndex::new(settings(&server, SimilarityMetric::Cosine)).unwrap();
        let error = index
            .query(&[1.0, 0.0, 0.0], 2, &IndexFilter::default())
            .await
            .expect_err("mismatch");
        assert!(!error.is_retriable());
    }

    #[tokio::test]
    async fn server_errors_are_retriable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/chunks/points/count");
                then.status(503).body("overloaded");
            })
            .await;
        let index = QdrantIndex::new(settings(&server, SimilarityMetric::Cosine)).unwrap();
        let error = index.count().await.expect_err("unavailable");
        assert!(error.is_retriable());
    }
}
