//! Retrieval over indexed chunks: ranked search, question answering, and document summaries.
//!
//! The engine owns no state of its own. Search embeds the query, asks the vector index for the
//! nearest chunks, and (when entity-type filters are given) keeps only chunks that carry at least
//! one entity of an allowed type. Because that filter runs after the index query, filtered
//! searches over-fetch `k × overfetch_factor` candidates (bounded by `max_fetch`) before trimming
//! to `k`.
//!
//! Hybrid search blends the vector ranking with a keyword ranking from the record store. Each
//! side is divided by its own best score, then mixed as `alpha × semantic + (1 − alpha) ×
//! keyword`; ties are broken by chunk id so equal scores always come back in the same order.

use crate::embedding::{Embedder, EmbeddingError};
use crate::index::{IndexError, IndexFilter, ScoredRecord, VectorIndex};
use crate::processing::summarize::summarize_document;
use crate::processing::{
    DocumentSummary, KeywordMatch, RecordStore, RecordStoreError, keyword_terms,
};
use crate::providers::{
    GenerationRequest, ProviderRequest, ProviderResponse, ProviderRouter, RouteError,
    RoutingDecision,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tiktoken_rs::{CoreBPE, cl100k_base};

static TOKENIZER: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match cl100k_base() {
    Ok(encoding) => Some(encoding),
    Err(error) => {
        tracing::warn!(error = %error, "cl100k_base unavailable; counting whitespace tokens");
        None
    }
});

/// Count tokens with `cl100k_base`, falling back to whitespace splitting.
pub fn count_tokens(text: &str) -> usize {
    match TOKENIZER.as_ref() {
        Some(encoding) => encoding.encode_ordinary(text).len(),
        None => text.split_whitespace().count(),
    }
}

/// Limits applied by the engine.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    /// Token budget for the context passed to generation.
    pub context_token_budget: usize,
    /// Candidate multiplier when entity filters are present.
    pub overfetch_factor: usize,
    /// Upper bound on candidates fetched from the index.
    pub max_fetch: usize,
    /// Word budget when a summary must be produced on demand.
    pub summary_max_words: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            context_token_budget: 3_000,
            overfetch_factor: 3,
            max_fetch: 200,
            summary_max_words: 120,
        }
    }
}

/// Search parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free-text query.
    pub text: String,
    /// Maximum hits returned.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Keep only chunks with at least one entity of these types; empty keeps all.
    #[serde(default)]
    pub entity_types: Vec<String>,
    /// Restrict to these documents; empty searches everything.
    #[serde(default)]
    pub document_ids: Vec<String>,
    /// Weight of the vector score in `[0, 1]`; set to blend in keyword matches.
    #[serde(default)]
    pub hybrid: Option<f32>,
}

fn default_k() -> usize {
    5
}

/// One ranked chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Chunk identifier.
    pub chunk_id: String,
    /// Source document.
    pub document_id: String,
    /// Similarity score; larger is closer.
    pub score: f32,
    /// Chunk text when the record store has it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Generated text with provenance.
#[derive(Debug, Clone, Serialize)]
pub struct Generated {
    /// Provider output.
    pub text: String,
    /// Provider that served the request.
    pub provider: Option<String>,
    /// Routing record.
    pub decision: RoutingDecision,
}

/// Answer grounded in retrieved chunks.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    /// Generated answer.
    pub text: String,
    /// Provider that served the request.
    pub provider: Option<String>,
    /// Chunks included in the context, in rank order.
    pub sources: Vec<SearchHit>,
    /// Tokens used by the included context.
    pub context_tokens: usize,
}

/// Failures surfaced by retrieval operations.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Query text was blank.
    #[error("query text is empty")]
    EmptyQuery,
    /// Hybrid weight outside `[0, 1]`.
    #[error("hybrid weight {0} must be between 0 and 1")]
    InvalidHybridWeight(f32),
    /// Document has no stored chunks.
    #[error("document {0} has not been indexed")]
    UnknownDocument(String),
    /// Generation was requested but no router is configured.
    #[error("no generation providers are configured")]
    NoRouter,
    /// Embedding the query failed.
    #[error("Failed to embed query: {0}")]
    Embedding(#[from] EmbeddingError),
    /// Vector index query failed.
    #[error("Failed to query index: {0}")]
    Index(#[from] IndexError),
    /// Record lookup failed.
    #[error("Failed to read records: {0}")]
    Records(#[from] RecordStoreError),
    /// Provider chain exhausted.
    #[error(transparent)]
    Route(#[from] RouteError),
    /// Router returned a payload of the wrong kind.
    #[error("provider returned an unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Composes the embedder, vector index, record store, and router.
pub struct RetrievalEngine {
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    records: Arc<dyn RecordStore>,
    router: Option<Arc<ProviderRouter>>,
    settings: RetrievalSettings,
}

impl RetrievalEngine {
    /// Engine over shared components. Without a router, only search and stored summaries work.
    pub fn new(
        embedder: Embedder,
        index: Arc<dyn VectorIndex>,
        records: Arc<dyn RecordStore>,
        router: Option<Arc<ProviderRouter>>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            embedder,
            index,
            records,
            router,
            settings,
        }
    }

    /// Top-`k` chunks for `query`, ordered by descending score.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, RetrievalError> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        if let Some(alpha) = query.hybrid
            && !(0.0..=1.0).contains(&alpha)
        {
            return Err(RetrievalError::InvalidHybridWeight(alpha));
        }
        if query.k == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(text).await?;
        let filtered = !query.entity_types.is_empty();
        let fetch = if filtered || query.hybrid.is_some() {
            (query.k.saturating_mul(self.settings.overfetch_factor))
                .min(self.settings.max_fetch)
                .max(query.k)
        } else {
            query.k
        };
        let filter = IndexFilter {
            document_ids: query.document_ids.clone(),
        };
        let semantic = self.index.query(&vector, fetch, &filter).await?;
        let mut ranked = match query.hybrid {
            None => semantic.into_iter().map(SearchHit::from).collect(),
            Some(alpha) => {
                let keyword = self
                    .records
                    .keyword_search(&keyword_terms(text), &query.document_ids, fetch)
                    .await?;
                combine_scores(alpha, semantic, keyword)
            }
        };
        let candidates = ranked.len();

        if filtered {
            let ids: Vec<String> = ranked.iter().map(|hit| hit.chunk_id.clone()).collect();
            let types = self.records.entity_types(&ids).await?;
            ranked.retain(|hit| {
                types.get(&hit.chunk_id).is_some_and(|present| {
                    present.iter().any(|found| {
                        query
                            .entity_types
                            .iter()
                            .any(|wanted| wanted.eq_ignore_ascii_case(found))
                    })
                })
            });
        }
        ranked.truncate(query.k);

        for hit in &mut ranked {
            if hit.text.is_none() {
                hit.text = self
                    .records
                    .chunk(&hit.chunk_id)
                    .await?
                    .map(|chunk| chunk.text);
            }
        }
        tracing::debug!(
            k = query.k,
            fetch,
            candidates,
            returned = ranked.len(),
            entity_filter = filtered,
            hybrid = ?query.hybrid,
            "Search completed"
        );
        Ok(ranked)
    }

    /// Route a raw generation request.
    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: Option<u32>,
    ) -> Result<Generated, RetrievalError> {
        let router = self.router.as_ref().ok_or(RetrievalError::NoRouter)?;
        let mut request = GenerationRequest::new(prompt);
        request.max_tokens = max_tokens;
        let routed = router.route(ProviderRequest::Generate(request)).await?;
        match routed.response {
            ProviderResponse::Text(text) => Ok(Generated {
                text,
                provider: routed.decision.served_by.clone(),
                decision: routed.decision,
            }),
            ProviderResponse::Embeddings(_) => Err(RetrievalError::UnexpectedResponse(
                "embeddings returned for a generation request".into(),
            )),
        }
    }

    /// Answer `query` from the best matching chunks.
    pub async fn answer(&self, query: &SearchQuery) -> Result<Answer, RetrievalError> {
        if self.router.is_none() {
            return Err(RetrievalError::NoRouter);
        }
        let hits = self.search(query).await?;
        let (context, sources, context_tokens) =
            assemble_context(hits, self.settings.context_token_budget);
        let prompt = build_answer_prompt(query.text.trim(), &context);
        let generated = self.generate(&prompt, None).await?;
        tracing::info!(
            sources = sources.len(),
            context_tokens,
            provider = generated.provider.as_deref().unwrap_or("none"),
            "Answer generated"
        );
        Ok(Answer {
            text: generated.text,
            provider: generated.provider,
            sources,
            context_tokens,
        })
    }

    /// Stored summary of a document, or one produced now from its chunks.
    pub async fn summarize(&self, document_id: &str) -> Result<DocumentSummary, RetrievalError> {
        if let Some(summary) = self.records.summary(document_id).await? {
            return Ok(summary);
        }
        let chunks = self.records.chunks_for_document(document_id).await?;
        if chunks.is_empty() {
            return Err(RetrievalError::UnknownDocument(document_id.to_string()));
        }
        Ok(summarize_document(
            self.router.as_deref(),
            document_id,
            &chunks,
            self.settings.summary_max_words,
        )
        .await)
    }
}

impl From<ScoredRecord> for SearchHit {
    fn from(hit: ScoredRecord) -> Self {
        Self {
            chunk_id: hit.record.chunk_id,
            document_id: hit.record.document_id,
            score: hit.score,
            text: None,
        }
    }
}

/// Union of both rankings scored `alpha × sem / max_sem + (1 − alpha) × kw / max_kw`.
///
/// A side with no positive score divides by 1. Sorted by score, then chunk id.
fn combine_scores(
    alpha: f32,
    semantic: Vec<ScoredRecord>,
    keyword: Vec<KeywordMatch>,
) -> Vec<SearchHit> {
    let best_semantic = semantic.iter().map(|hit| hit.score).fold(0.0_f32, f32::max);
    let best_semantic = if best_semantic > 0.0 { best_semantic } else { 1.0 };
    let best_keyword = keyword.iter().map(|found| found.score).max().unwrap_or(0).max(1) as f32;

    let mut merged: HashMap<String, SearchHit> = HashMap::with_capacity(semantic.len());
    for hit in semantic {
        let mut hit = SearchHit::from(hit);
        hit.score = alpha * hit.score / best_semantic;
        merged.insert(hit.chunk_id.clone(), hit);
    }
    for found in keyword {
        let weight = (1.0 - alpha) * found.score as f32 / best_keyword;
        match merged.entry(found.chunk.id) {
            Entry::Occupied(mut entry) => {
                let hit = entry.get_mut();
                hit.score += weight;
                hit.text = Some(found.chunk.text);
            }
            Entry::Vacant(entry) => {
                let chunk_id = entry.key().clone();
                entry.insert(SearchHit {
                    chunk_id,
                    document_id: found.chunk.document_id,
                    score: weight,
                    text: Some(found.chunk.text),
                });
            }
        }
    }

    let mut hits: Vec<SearchHit> = merged.into_values().collect();
    hits.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.chunk_id.cmp(&right.chunk_id))
    });
    hits
}

/// Pack passages in rank order until the next one would exceed `budget` tokens.
///
/// Returns the context text, the hits that made it in, and the tokens used.
pub fn assemble_context(hits: Vec<SearchHit>, budget: usize) -> (String, Vec<SearchHit>, usize) {
    let mut context = String::new();
    let mut used = 0;
    let mut included = Vec::new();
    for hit in hits {
        let Some(text) = hit.text.as_deref() else {
            continue;
        };
        let passage = format!(
            "[{}] ({})\n{}\n\n",
            included.len() + 1,
            hit.document_id,
            text.trim()
        );
        let tokens = count_tokens(&passage);
        if used + tokens > budget {
            break;
        }
        used += tokens;
        context.push_str(&passage);
        included.push(hit);
    }
    (context, included, used)
}

fn build_answer_prompt(question: &str, context: &str) -> String {
    if context.is_empty() {
        return format!(
            "System: No indexed passages matched. Say that the answer is not in the library.\n\n\
             Question: {question}\nAnswer:"
        );
    }
    format!(
        "System: Answer using only the numbered passages below and cite them as [n]. If they do \
         not contain the answer, say so.\n\n{context}Question: {question}\nAnswer:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbedderSettings, HashEmbeddingClient};
    use crate::index::{MemoryIndex, SimilarityMetric, VectorRecord};
    use crate::processing::{Chunk, Entity, MemoryRecordStore, SummaryStrategy};
    use crate::providers::{RouterSettings, StubProvider};
    use crate::providers::stub::DEGRADED_ANSWER;

    const DIMENSION: usize = 256;

    fn embedder() -> Embedder {
        Embedder::new(
            Arc::new(HashEmbeddingClient::new(DIMENSION)),
            EmbedderSettings {
                model: "hash-test".into(),
                dimension: DIMENSION,
                max_chars: 1_000,
            },
        )
    }

    async fn seeded(router: Option<Arc<ProviderRouter>>) -> RetrievalEngine {
        let embedder = embedder();
        let index = Arc::new(MemoryIndex::new(DIMENSION, SimilarityMetric::Cosine));
        let records = Arc::new(MemoryRecordStore::new());
        let texts = [
            ("c1", "doc-a", "the harbor lighthouse was rebuilt in stone"),
            ("c2", "doc-a", "contact the keeper at keeper@harbor.org"),
            ("c3", "doc-b", "grain prices rose sharply after the drought"),
        ];
        for (ordinal, (id, document, text)) in texts.into_iter().enumerate() {
            let vector = embedder.embed(text).await.unwrap();
            index
                .upsert(vec![VectorRecord {
                    chunk_id: id.into(),
                    document_id: document.into(),
                    dimension: vector.len(),
                    vector,
                    model: "hash-test".into(),
                }])
                .await
                .unwrap();
            records
                .put_chunk(Chunk {
                    id: id.into(),
                    document_id: document.into(),
                    ordinal,
                    start: 0,
                    end: text.chars().count(),
                    overlap: 0,
                    text: text.into(),
                })
                .await
                .unwrap();
        }
        records
            .put_entities(
                "c2",
                vec![Entity {
                    id: "e1".into(),
                    entity_type: "EMAIL".into(),
                    text: "keeper@harbor.org".into(),
                    confidence: 0.95,
                    start: 16,
                    end: 33,
                    chunk_id: "c2".into(),
                    document_id: "doc-a".into(),
                }],
            )
            .await
            .unwrap();
        RetrievalEngine::new(embedder, index, records, router, RetrievalSettings::default())
    }

    fn stub_router() -> Arc<ProviderRouter> {
        Arc::new(ProviderRouter::new(
            vec![Arc::new(StubProvider::new("hash-test", DIMENSION))],
            RouterSettings::default(),
        ))
    }

    fn query(text: &str, k: usize) -> SearchQuery {
        SearchQuery {
            text: text.into(),
            k,
            ..SearchQuery::default()
        }
    }

    #[tokio::test]
    async fn search_ranks_and_bounds_results() {
        let engine = seeded(None).await;
        let hits = engine
            .search(&query("harbor lighthouse stone", 2))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].score >= hits[1].score);
        assert!(hits[0].text.as_deref().unwrap().contains("lighthouse"));
    }

    #[tokio::test]
    async fn entity_filter_keeps_only_matching_chunks() {
        let engine = seeded(None).await;
        let hits = engine
            .search(&SearchQuery {
                entity_types: vec!["email".into()],
                ..query("harbor lighthouse stone", 3)
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c2");
    }

    #[tokio::test]
    async fn document_filter_restricts_sources() {
        let engine = seeded(None).await;
        let hits = engine
            .search(&SearchQuery {
                document_ids: vec!["doc-b".into()],
                ..query("harbor", 5)
            })
            .await
            .unwrap();
        assert!(hits.iter().all(|hit| hit.document_id == "doc-b"));
    }

    #[tokio::test]
    async fn keyword_only_weighting_ranks_by_matched_terms() {
        let engine = seeded(None).await;
        let hits = engine
            .search(&SearchQuery {
                hybrid: Some(0.0),
                ..query("keeper harbor", 3)
            })
            .await
            .unwrap();
        let ranked: Vec<(&str, f32)> = hits
            .iter()
            .map(|hit| (hit.chunk_id.as_str(), hit.score))
            .collect();
        assert_eq!(&ranked[..2], &[("c2", 1.0), ("c1", 0.5)]);
        assert!(hits[2].score.abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn hybrid_ties_are_ordered_by_chunk_id() {
        let engine = seeded(None).await;
        let hits = engine
            .search(&SearchQuery {
                hybrid: Some(0.0),
                ..query("the", 3)
            })
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|hit| hit.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert!(hits.iter().all(|hit| hit.text.is_some()));
    }

    #[tokio::test]
    async fn hybrid_blend_normalizes_each_side() {
        let engine = seeded(None).await;
        let semantic = engine.search(&query("grain drought", 3)).await.unwrap();
        let blended = engine
            .search(&SearchQuery {
                hybrid: Some(0.5),
                ..query("grain drought", 3)
            })
            .await
            .unwrap();
        assert_eq!(blended[0].chunk_id, "c3");
        let best = semantic[0].score;
        let own = semantic
            .iter()
            .find(|hit| hit.chunk_id == "c3")
            .map(|hit| hit.score)
            .unwrap();
        let expected = 0.5 * own / best + 0.5;
        assert!((blended[0].score - expected).abs() < 1e-5);
        assert!(blended.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[tokio::test]
    async fn hybrid_weight_outside_unit_range_is_rejected() {
        let engine = seeded(None).await;
        for alpha in [-0.1, 1.5, f32::NAN] {
            assert!(matches!(
                engine
                    .search(&SearchQuery {
                        hybrid: Some(alpha),
                        ..query("harbor", 3)
                    })
                    .await,
                Err(RetrievalError::InvalidHybridWeight(_))
            ));
        }
    }

    #[test]
    fn keyword_side_alone_is_normalized_by_its_best_match() {
        let found = |id: &str, score: usize| KeywordMatch {
            chunk: Chunk {
                id: id.into(),
                document_id: "doc".into(),
                ordinal: 0,
                start: 0,
                end: 4,
                overlap: 0,
                text: "text".into(),
            },
            score,
        };
        let hits = combine_scores(0.25, Vec::new(), vec![found("b", 4), found("a", 2), found("c", 2)]);
        let ranked: Vec<(&str, f32)> = hits
            .iter()
            .map(|hit| (hit.chunk_id.as_str(), hit.score))
            .collect();
        assert_eq!(ranked, vec![("b", 0.75), ("a", 0.375), ("c", 0.375)]);
        assert!(combine_scores(0.5, Vec::new(), Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let engine = seeded(None).await;
        assert!(matches!(
            engine.search(&query("   ", 3)).await,
            Err(RetrievalError::EmptyQuery)
        ));
    }

    #[test]
    fn context_respects_token_budget() {
        let hit = |id: &str| SearchHit {
            chunk_id: id.into(),
            document_id: "doc".into(),
            score: 1.0,
            text: Some("alpha beta gamma delta ".repeat(10)),
        };
        let (_, all, used_all) = assemble_context(vec![hit("a"), hit("b")], 10_000);
        assert_eq!(all.len(), 2);

        let (context, included, used) = assemble_context(vec![hit("a"), hit("b")], used_all - 1);
        assert_eq!(included.len(), 1);
        assert!(used < used_all);
        assert!(context.starts_with("[1] (doc)"));
    }

    #[tokio::test]
    async fn answer_routes_through_chain() {
        let engine = seeded(Some(stub_router())).await;
        let answer = engine.answer(&query("lighthouse", 2)).await.unwrap();
        assert_eq!(answer.text, DEGRADED_ANSWER);
        assert_eq!(answer.provider.as_deref(), Some("stub"));
        assert_eq!(answer.sources.len(), 2);
        assert!(answer.context_tokens > 0);
    }

    #[tokio::test]
    async fn answer_without_router_is_an_error() {
        let engine = seeded(None).await;
        assert!(matches!(
            engine.answer(&query("lighthouse", 2)).await,
            Err(RetrievalError::NoRouter)
        ));
    }

    #[tokio::test]
    async fn summary_is_built_on_demand() {
        let engine = seeded(None).await;
        let summary = engine.summarize("doc-b").await.unwrap();
        assert_eq!(summary.strategy, SummaryStrategy::Extractive);
        assert!(matches!(
            engine.summarize("missing").await,
            Err(RetrievalError::UnknownDocument(_))
        ));
    }
}
