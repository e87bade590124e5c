//! Deterministic last-resort provider.

use super::types::{
    Capability, Provider, ProviderDescriptor, ProviderError, ProviderRequest, ProviderResponse,
};
use crate::embedding::hash_embed;
use async_trait::async_trait;

/// Text returned for every generation request.
pub const DEGRADED_ANSWER: &str =
    "No generation backend is currently available; returning a degraded response.";

/// Always answers: a fixed string for generation and hash vectors for embedding.
pub struct StubProvider {
    descriptor: ProviderDescriptor,
    dimension: usize,
}

impl StubProvider {
    /// Stub embedding with `embedding_model` at `dimension`, ordered after every other provider.
    pub fn new(embedding_model: impl Into<String>, dimension: usize) -> Self {
        let descriptor =
            ProviderDescriptor::new("stub", 0, &[Capability::Generation, Capability::Embedding])
                .with_embedding_model(embedding_model)
                .as_fallback();
        Self {
            descriptor,
            dimension,
        }
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Ok(match request {
            ProviderRequest::Generate(_) => ProviderResponse::Text(DEGRADED_ANSWER.to_string()),
            ProviderRequest::Embed(request) => ProviderResponse::Embeddings(
                request
                    .texts
                    .iter()
                    .map(|text| hash_embed(text, self.dimension))
                    .collect(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::{EmbeddingRequest, GenerationRequest};

    #[tokio::test]
    async fn answers_are_deterministic() {
        let stub = StubProvider::new("hash-embed-v1", 8);
        assert!(stub.descriptor().fallback_only);

        let first = stub
            .call(ProviderRequest::Generate(GenerationRequest::new("a")))
            .await
            .unwrap();
        let second = stub
            .call(ProviderRequest::Generate(GenerationRequest::new("b")))
            .await
            .unwrap();
        assert_eq!(first, second);

        let request = EmbeddingRequest {
            model: "hash-embed-v1".into(),
            texts: vec!["same".into(), "same".into()],
        };
        match stub.call(ProviderRequest::Embed(request)).await.unwrap() {
            ProviderResponse::Embeddings(vectors) => {
                assert_eq!(vectors.len(), 2);
                assert_eq!(vectors[0].len(), 8);
                assert_eq!(vectors[0], vectors[1]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
