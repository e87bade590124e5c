//! Text-to-vector clients and the guard that pins model, dimension, and input size.

use crate::providers::{EmbeddingRequest, ProviderRequest, ProviderResponse, ProviderRouter};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while producing embeddings.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Input exceeds the configured character limit.
    #[error("input of {chars} characters exceeds the {limit}-character embedding limit")]
    Oversized {
        /// Characters in the rejected input.
        chars: usize,
        /// Configured limit.
        limit: usize,
    },
    /// Backend produced vectors of the wrong width for the pinned model.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension returned.
        actual: usize,
    },
    /// No backend could serve the request right now.
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
    /// Backend answered with something other than one vector per input.
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

impl EmbeddingError {
    /// Transient backend outages are retried; everything else is a configuration problem.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce one vector per text using `model`.
    async fn generate_embeddings(
        &self,
        model: &str,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Deterministic feature-hashing embedding of `text` into `dimension` slots.
///
/// Lower-cased alphanumeric tokens are hashed (FNV-1a) to a slot and sign, then the vector is
/// L2-normalized. Texts sharing vocabulary land close together under cosine similarity.
pub fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut embedding = vec![0.0_f32; dimension];
    if dimension == 0 {
        return embedding;
    }

    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
    {
        let hash = fnv1a(&token.to_lowercase());
        let slot = (hash % dimension as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        embedding[slot] += sign;
    }

    let norm = embedding
        .iter()
        .map(|value| value * value)
        .sum::<f32>()
        .sqrt();
    if norm > 0.0 {
        for value in &mut embedding {
            *value /= norm;
        }
    }
    embedding
}

fn fnv1a(token: &str) -> u64 {
    token.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Local hashing client; never fails and never leaves the process.
pub struct HashEmbeddingClient {
    dimension: usize,
}

impl HashEmbeddingClient {
    /// Client producing vectors of `dimension` slots.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn generate_embeddings(
        &self,
        model: &str,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        tracing::trace!(model, count = texts.len(), "Hash-embedding texts");
        Ok(texts
            .iter()
            .map(|text| hash_embed(text, self.dimension))
            .collect())
    }
}

/// Embeddings served through the provider router, pinned to the requested model.
pub struct RouterEmbeddingClient {
    router: Arc<ProviderRouter>,
}

impl RouterEmbeddingClient {
    /// Wrap a shared router.
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl EmbeddingClient for RouterEmbeddingClient {
    async fn generate_embeddings(
        &self,
        model: &str,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = ProviderRequest::Embed(EmbeddingRequest {
            model: model.to_string(),
            texts,
        });
        let routed = self
            .router
            .route(request)
            .await
            .map_err(|error| EmbeddingError::Unavailable(error.to_string()))?;
        match routed.response {
            ProviderResponse::Embeddings(vectors) => Ok(vectors),
            ProviderResponse::Text(_) => Err(EmbeddingError::InvalidResponse(
                "router returned text for an embedding request".into(),
            )),
        }
    }
}

/// Pinned embedding model parameters.
#[derive(Debug, Clone)]
pub struct EmbedderSettings {
    /// Model identifier recorded with every vector.
    pub model: String,
    /// Width of every produced vector.
    pub dimension: usize,
    /// Longest accepted input, in characters.
    pub max_chars: usize,
}

/// Validating front of an [`EmbeddingClient`].
#[derive(Clone)]
pub struct Embedder {
    client: Arc<dyn EmbeddingClient>,
    settings: EmbedderSettings,
}

impl Embedder {
    /// Guard `client` with `settings`.
    pub fn new(client: Arc<dyn EmbeddingClient>, settings: EmbedderSettings) -> Self {
        Self { client, settings }
    }

    /// Model identifier recorded with every vector.
    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// Width of every produced vector.
    pub fn dimension(&self) -> usize {
        self.settings.dimension
    }

    /// Embed one text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no vector returned".into()))
    }

    /// Embed several texts, failing fast on oversized input before any backend call.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        for text in &texts {
            let chars = text.chars().count();
            if chars > self.settings.max_chars {
                return Err(EmbeddingError::Oversized {
                    chars,
                    limit: self.settings.max_chars,
                });
            }
        }

        let expected = texts.len();
        let vectors = self
            .client
            .generate_embeddings(&self.settings.model, texts)
            .await?;
        if vectors.len() != expected {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {expected} vectors, got {}",
                vectors.len()
            )));
        }
        if let Some(vector) = vectors
            .iter()
            .find(|vector| vector.len() != self.settings.dimension)
        {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.settings.dimension,
                actual: vector.len(),
            });
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dimension: usize, max_chars: usize) -> EmbedderSettings {
        EmbedderSettings {
            model: "hash-embed-v1".into(),
            dimension,
            max_chars,
        }
    }

    fn cosine(left: &[f32], right: &[f32]) -> f32 {
        left.iter().zip(right).map(|(l, r)| l * r).sum()
    }

    #[test]
    fn hash_embedding_is_normalized_and_deterministic() {
        let first = hash_embed("Rust ownership and borrowing", 64);
        let second = hash_embed("Rust ownership and borrowing", 64);
        assert_eq!(first, second);
        let norm: f32 = first.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(hash_embed("", 16).iter().all(|value| *value == 0.0));
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let query = hash_embed("ownership rules", 256);
        let related = hash_embed("Rust enforces ownership rules at compile time", 256);
        let unrelated = hash_embed("The weather in Lisbon was mild", 256);
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[tokio::test]
    async fn oversized_input_fails_fast_and_is_not_retriable() {
        let embedder = Embedder::new(Arc::new(HashEmbeddingClient::new(8)), settings(8, 5));
        let error = embedder.embed("too long").await.expect_err("oversized");
        assert!(matches!(
            error,
            EmbeddingError::Oversized { chars: 8, limit: 5 }
        ));
        assert!(!error.is_retriable());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let embedder = Embedder::new(Arc::new(HashEmbeddingClient::new(4)), settings(8, 100));
        let error = embedder.embed("hello").await.expect_err("mismatch");
        assert!(matches!(
            error,
            EmbeddingError::DimensionMismatch {
                expected: 8,
                actual: 4
            }
        ));
        assert!(!error.is_retriable());
    }

    #[tokio::test]
    async fn router_exhaustion_is_retriable() {
        use crate::providers::{
            Capability, Provider, ProviderDescriptor, ProviderError, RouterSettings,
        };

        struct Down(ProviderDescriptor);

        #[async_trait]
        impl Provider for Down {
            fn descriptor(&self) -> &ProviderDescriptor {
                &self.0
            }

            async fn call(
                &self,
                _request: ProviderRequest,
            ) -> Result<ProviderResponse, ProviderError> {
                Err(ProviderError::Unavailable("offline".into()))
            }
        }

        let provider: Arc<dyn Provider> = Arc::new(Down(
            ProviderDescriptor::new("down", 1, &[Capability::Embedding])
                .with_embedding_model("hash-embed-v1"),
        ));
        let router = Arc::new(ProviderRouter::new(
            vec![provider],
            RouterSettings::default(),
        ));
        let embedder = Embedder::new(
            Arc::new(RouterEmbeddingClient::new(router)),
            settings(8, 100),
        );

        let error = embedder.embed("hello").await.expect_err("unavailable");
        assert!(error.is_retriable());
        assert!(error.to_string().contains("down"));
    }

    #[tokio::test]
    async fn empty_batch_skips_backend() {
        let embedder = Embedder::new(Arc::new(HashEmbeddingClient::new(8)), settings(8, 10));
        assert!(embedder.embed_batch(Vec::new()).await.unwrap().is_empty());
    }
}
