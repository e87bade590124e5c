//! Storage for chunk, entity, and summary records.
//!
//! [`MemoryRecordStore`] keeps everything in process. [`FileRecordStore`] keeps the same tables
//! in memory but writes one JSON file per document before acknowledging any change, so chunk
//! text, entities and summaries survive a restart alongside a durable vector index.

use super::types::{Chunk, DocumentSummary, Entity, RecordStoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Sub-directory of the data directory used by [`FileRecordStore`].
pub const RECORDS_DIR: &str = "records";

/// Record counts, for idempotence checks and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    /// Stored chunks.
    pub chunks: usize,
    /// Stored entities.
    pub entities: usize,
    /// Stored summaries.
    pub summaries: usize,
}

/// A chunk matched by keyword lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordMatch {
    /// Matching chunk.
    pub chunk: Chunk,
    /// Number of distinct query terms found in the chunk text.
    pub score: usize,
}

/// Key-value store for pipeline output. Every write is an idempotent upsert.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a chunk keyed by its id.
    async fn put_chunk(&self, chunk: Chunk) -> Result<(), RecordStoreError>;

    /// Replace the entity set of `chunk_id`.
    async fn put_entities(
        &self,
        chunk_id: &str,
        entities: Vec<Entity>,
    ) -> Result<(), RecordStoreError>;

    /// Insert or replace the summary of a document.
    async fn put_summary(&self, summary: DocumentSummary) -> Result<(), RecordStoreError>;

    /// Delete chunks of `document_id` whose id is not in `keep`, with their entities.
    /// Returns the number of chunks removed.
    async fn retain_chunks(
        &self,
        document_id: &str,
        keep: &HashSet<String>,
    ) -> Result<usize, RecordStoreError>;

    /// Chunk by id.
    async fn chunk(&self, chunk_id: &str) -> Result<Option<Chunk>, RecordStoreError>;

    /// Chunks of a document in ordinal order.
    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, RecordStoreError>;

    /// Entities of a chunk.
    async fn entities(&self, chunk_id: &str) -> Result<Vec<Entity>, RecordStoreError>;

    /// Entity type tags present in each of `chunk_ids`.
    async fn entity_types(
        &self,
        chunk_ids: &[String],
    ) -> Result<HashMap<String, HashSet<String>>, RecordStoreError>;

    /// Up to `limit` chunks containing any of `terms`, best first (score, then chunk id).
    /// `document_ids` restricts the documents searched; empty searches all of them.
    async fn keyword_search(
        &self,
        terms: &[String],
        document_ids: &[String],
        limit: usize,
    ) -> Result<Vec<KeywordMatch>, RecordStoreError>;

    /// Summary of a document.
    async fn summary(&self, document_id: &str) -> Result<Option<DocumentSummary>, RecordStoreError>;

    /// Current record counts.
    async fn counts(&self) -> Result<RecordCounts, RecordStoreError>;
}

/// Lower-cased, de-duplicated whitespace terms of `text`.
pub fn keyword_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
    terms.sort();
    terms.dedup();
    terms
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    chunks: BTreeMap<String, Chunk>,
    entities: BTreeMap<String, Vec<Entity>>,
    summaries: BTreeMap<String, DocumentSummary>,
}

impl Tables {
    fn put_chunk(&mut self, chunk: Chunk) {
        self.chunks.insert(chunk.id.clone(), chunk);
    }

    fn put_entities(&mut self, chunk_id: &str, entities: Vec<Entity>) {
        if entities.is_empty() {
            self.entities.remove(chunk_id);
        } else {
            self.entities.insert(chunk_id.to_string(), entities);
        }
    }

    fn put_summary(&mut self, summary: DocumentSummary) {
        self.summaries.insert(summary.document_id.clone(), summary);
    }

    fn retain_chunks(&mut self, document_id: &str, keep: &HashSet<String>) -> usize {
        let stale: Vec<String> = self
            .chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id && !keep.contains(&chunk.id))
            .map(|chunk| chunk.id.clone())
            .collect();
        for chunk_id in &stale {
            self.chunks.remove(chunk_id);
            self.entities.remove(chunk_id);
        }
        self.entities.retain(|chunk_id, entities| {
            keep.contains(chunk_id) || entities.iter().all(|entity| entity.document_id != document_id)
        });
        stale.len()
    }

    fn document_of(&self, chunk_id: &str, entities: &[Entity]) -> Option<String> {
        self.chunks
            .get(chunk_id)
            .map(|chunk| chunk.document_id.clone())
            .or_else(|| entities.first().map(|entity| entity.document_id.clone()))
            .or_else(|| {
                self.entities
                    .get(chunk_id)
                    .and_then(|stored| stored.first())
                    .map(|entity| entity.document_id.clone())
            })
    }

    /// Records belonging to `document_id` only.
    fn document(&self, document_id: &str) -> Tables {
        Tables {
            chunks: self
                .chunks
                .iter()
                .filter(|(_, chunk)| chunk.document_id == document_id)
                .map(|(id, chunk)| (id.clone(), chunk.clone()))
                .collect(),
            entities: self
                .entities
                .iter()
                .filter(|(_, entities)| {
                    entities.iter().any(|entity| entity.document_id == document_id)
                })
                .map(|(id, entities)| (id.clone(), entities.clone()))
                .collect(),
            summaries: self
                .summaries
                .get(document_id)
                .map(|summary| (document_id.to_string(), summary.clone()))
                .into_iter()
                .collect(),
        }
    }

    /// Swap the records of `document_id` for `replacement`.
    fn replace_document(&mut self, document_id: &str, replacement: Tables) {
        self.chunks.retain(|_, chunk| chunk.document_id != document_id);
        self.entities
            .retain(|_, entities| entities.iter().all(|entity| entity.document_id != document_id));
        self.summaries.remove(document_id);
        self.merge(replacement);
    }

    fn merge(&mut self, other: Tables) {
        self.chunks.extend(other.chunks);
        self.entities.extend(other.entities);
        self.summaries.extend(other.summaries);
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.entities.is_empty() && self.summaries.is_empty()
    }

    fn chunks_for_document(&self, document_id: &str) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = self
            .chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|chunk| chunk.ordinal);
        chunks
    }

    fn entity_types(&self, chunk_ids: &[String]) -> HashMap<String, HashSet<String>> {
        chunk_ids
            .iter()
            .map(|chunk_id| {
                let types = self
                    .entities
                    .get(chunk_id)
                    .map(|entities| {
                        entities
                            .iter()
                            .map(|entity| entity.entity_type.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                (chunk_id.clone(), types)
            })
            .collect()
    }

    fn keyword_search(
        &self,
        terms: &[String],
        document_ids: &[String],
        limit: usize,
    ) -> Vec<KeywordMatch> {
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }
        let mut matches: Vec<KeywordMatch> = self
            .chunks
            .values()
            .filter(|chunk| document_ids.is_empty() || document_ids.contains(&chunk.document_id))
            .filter_map(|chunk| {
                let text = chunk.text.to_lowercase();
                let score = terms.iter().filter(|term| text.contains(term.as_str())).count();
                (score > 0).then(|| KeywordMatch {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();
        matches.sort_by(|left, right| {
            right
                .score
                .cmp(&left.score)
                .then_with(|| left.chunk.id.cmp(&right.chunk.id))
        });
        matches.truncate(limit);
        matches
    }

    fn counts(&self) -> RecordCounts {
        RecordCounts {
            chunks: self.chunks.len(),
            entities: self.entities.values().map(Vec::len).sum(),
            summaries: self.summaries.len(),
        }
    }
}

/// Process-local record store.
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<Tables>,
}

impl MemoryRecordStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put_chunk(&self, chunk: Chunk) -> Result<(), RecordStoreError> {
        self.tables.write().await.put_chunk(chunk);
        Ok(())
    }

    async fn put_entities(
        &self,
        chunk_id: &str,
        entities: Vec<Entity>,
    ) -> Result<(), RecordStoreError> {
        self.tables.write().await.put_entities(chunk_id, entities);
        Ok(())
    }

    async fn put_summary(&self, summary: DocumentSummary) -> Result<(), RecordStoreError> {
        self.tables.write().await.put_summary(summary);
        Ok(())
    }

    async fn retain_chunks(
        &self,
        document_id: &str,
        keep: &HashSet<String>,
    ) -> Result<usize, RecordStoreError> {
        Ok(self.tables.write().await.retain_chunks(document_id, keep))
    }

    async fn chunk(&self, chunk_id: &str) -> Result<Option<Chunk>, RecordStoreError> {
        Ok(self.tables.read().await.chunks.get(chunk_id).cloned())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, RecordStoreError> {
        Ok(self.tables.read().await.chunks_for_document(document_id))
    }

    async fn entities(&self, chunk_id: &str) -> Result<Vec<Entity>, RecordStoreError> {
        Ok(self
            .tables
            .read()
            .await
            .entities
            .get(chunk_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn entity_types(
        &self,
        chunk_ids: &[String],
    ) -> Result<HashMap<String, HashSet<String>>, RecordStoreError> {
        Ok(self.tables.read().await.entity_types(chunk_ids))
    }

    async fn keyword_search(
        &self,
        terms: &[String],
        document_ids: &[String],
        limit: usize,
    ) -> Result<Vec<KeywordMatch>, RecordStoreError> {
        Ok(self
            .tables
            .read()
            .await
            .keyword_search(terms, document_ids, limit))
    }

    async fn summary(&self, document_id: &str) -> Result<Option<DocumentSummary>, RecordStoreError> {
        Ok(self.tables.read().await.summaries.get(document_id).cloned())
    }

    async fn counts(&self) -> Result<RecordCounts, RecordStoreError> {
        Ok(self.tables.read().await.counts())
    }
}

/// Record store writing one JSON file per document under `<data_dir>/records`.
///
/// A change is applied to a copy of the affected document's records, written to a temporary
/// file and renamed into place; only then does the in-memory copy change.
pub struct FileRecordStore {
    dir: PathBuf,
    tables: RwLock<Tables>,
}

impl FileRecordStore {
    /// Open (or create) the store under `data_dir`, loading every document file.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, RecordStoreError> {
        let dir = data_dir.as_ref().join(RECORDS_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        let mut tables = Tables::default();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let document: Tables = serde_json::from_slice(&bytes)?;
            tables.merge(document);
        }
        let counts = tables.counts();
        tracing::info!(
            path = %dir.display(),
            chunks = counts.chunks,
            entities = counts.entities,
            summaries = counts.summaries,
            "Opened record store"
        );
        Ok(Self {
            dir,
            tables: RwLock::new(tables),
        })
    }

    fn document_path(&self, document_id: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(document_id.as_bytes()));
        self.dir.join(format!("{digest}.json"))
    }

    async fn persist(&self, document_id: &str, records: &Tables) -> Result<(), RecordStoreError> {
        let path = self.document_path(document_id);
        if records.is_empty() {
            return match tokio::fs::remove_file(&path).await {
                Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error.into()),
                _ => Ok(()),
            };
        }
        let bytes = serde_json::to_vec_pretty(records)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Apply `change` to the records of `document_id`, persisting before publishing.
    async fn modify<T>(
        &self,
        document_id: &str,
        change: impl FnOnce(&mut Tables) -> T,
    ) -> Result<T, RecordStoreError> {
        let mut tables = self.tables.write().await;
        let mut document = tables.document(document_id);
        let output = change(&mut document);
        self.persist(document_id, &document).await?;
        tables.replace_document(document_id, document);
        Ok(output)
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn put_chunk(&self, chunk: Chunk) -> Result<(), RecordStoreError> {
        let document_id = chunk.document_id.clone();
        self.modify(&document_id, |tables| tables.put_chunk(chunk))
            .await
    }

    async fn put_entities(
        &self,
        chunk_id: &str,
        entities: Vec<Entity>,
    ) -> Result<(), RecordStoreError> {
        let document_id = self.tables.read().await.document_of(chunk_id, &entities);
        let Some(document_id) = document_id else {
            // Nothing stored for this chunk and nothing to store.
            return Ok(());
        };
        self.modify(&document_id, |tables| tables.put_entities(chunk_id, entities))
            .await
    }

    async fn put_summary(&self, summary: DocumentSummary) -> Result<(), RecordStoreError> {
        let document_id = summary.document_id.clone();
        self.modify(&document_id, |tables| tables.put_summary(summary))
            .await
    }

    async fn retain_chunks(
        &self,
        document_id: &str,
        keep: &HashSet<String>,
    ) -> Result<usize, RecordStoreError> {
        self.modify(document_id, |tables| tables.retain_chunks(document_id, keep))
            .await
    }

    async fn chunk(&self, chunk_id: &str) -> Result<Option<Chunk>, RecordStoreError> {
        Ok(self.tables.read().await.chunks.get(chunk_id).cloned())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, RecordStoreError> {
        Ok(self.tables.read().await.chunks_for_document(document_id))
    }

    async fn entities(&self, chunk_id: &str) -> Result<Vec<Entity>, RecordStoreError> {
        Ok(self
            .tables
            .read()
            .await
            .entities
            .get(chunk_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn entity_types(
        &self,
        chunk_ids: &[String],
    ) -> Result<HashMap<String, HashSet<String>>, RecordStoreError> {
        Ok(self.tables.read().await.entity_types(chunk_ids))
    }

    async fn keyword_search(
        &self,
        terms: &[String],
        document_ids: &[String],
        limit: usize,
    ) -> Result<Vec<KeywordMatch>, RecordStoreError> {
        Ok(self
            .tables
            .read()
            .await
            .keyword_search(terms, document_ids, limit))
    }

    async fn summary(&self, document_id: &str) -> Result<Option<DocumentSummary>, RecordStoreError> {
        Ok(self.tables.read().await.summaries.get(document_id).cloned())
    }

    async fn counts(&self) -> Result<RecordCounts, RecordStoreError> {
        Ok(self.tables.read().await.counts())
    }
}
