//! Ollama runtime adapter serving generation (`/api/generate`) and embeddings (`/api/embed`).

use super::types::{
    Capability, EmbeddingRequest, GenerationRequest, Provider, ProviderDescriptor, ProviderError,
    ProviderRequest, ProviderResponse,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

/// Default local Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// HTTP client for a local or remote Ollama runtime.
pub struct OllamaProvider {
    http: Client,
    base_url: String,
    generation_model: Option<String>,
    descriptor: ProviderDescriptor,
}

impl OllamaProvider {
    /// Build a provider; capabilities follow from which models are configured.
    pub fn new(
        name: impl Into<String>,
        priority: u32,
        base_url: impl Into<String>,
        generation_model: Option<String>,
        embedding_model: Option<String>,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .user_agent("librarian/ollama")
            .build()
            .map_err(|error| ProviderError::Unavailable(error.to_string()))?;

        let mut capabilities = Vec::new();
        if generation_model.is_some() {
            capabilities.push(Capability::Generation);
        }
        if embedding_model.is_some() {
            capabilities.push(Capability::Embedding);
        }
        let mut descriptor = ProviderDescriptor::new(name, priority, &capabilities);
        descriptor.embedding_model = embedding_model;

        Ok(Self {
            http,
            base_url: base_url.into(),
            generation_model,
            descriptor,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn generate(&self, request: GenerationRequest) -> Result<String, ProviderError> {
        let model = self
            .generation_model
            .as_deref()
            .ok_or(ProviderError::Unsupported(Capability::Generation))?;
        let mut options = json!({
            "temperature": request.temperature.unwrap_or(0.1),
        });
        if let Some(max_tokens) = request.max_tokens {
            options["num_predict"] = json!(max_tokens);
        }
        let payload = json!({
            "model": model,
            "prompt": request.prompt,
            "stream": false,
            "options": options,
        });

        let body: GenerateResponse = self.post_json("generate", &payload).await?;
        if !body.done {
            return Err(ProviderError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }
        Ok(body.response.trim().to_string())
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<Vec<Vec<f32>>, ProviderError> {
        let payload = json!({
            "model": request.model,
            "input": request.texts,
        });
        let body: EmbedResponse = self.post_json("embed", &payload).await?;
        Ok(body.embeddings)
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<T, ProviderError> {
        let endpoint = self.endpoint(path);
        let response = self
            .http
            .post(&endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|error| {
                ProviderError::Unavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::Unavailable(format!(
                "Ollama endpoint {endpoint} returned 404"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        response.json().await.map_err(|error| {
            ProviderError::InvalidResponse(format!("failed to decode Ollama response: {error}"))
        })
    }
}

pub(crate) fn classify_status(status: StatusCode, body: String) -> ProviderError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Unavailable(format!("returned {status}: {body}"))
    } else {
        ProviderError::Rejected(format!("returned {status}: {body}"))
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    done: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Provider for OllamaProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match request {
            ProviderRequest::Generate(request) => {
                self.generate(request).await.map(ProviderResponse::Text)
            }
            ProviderRequest::Embed(request) => {
                self.embed(request).await.map(ProviderResponse::Embeddings)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn provider(server: &MockServer) -> OllamaProvider {
        OllamaProvider::new(
            "ollama",
            10,
            server.base_url(),
            Some("llama3".into()),
            Some("nomic-embed-text".into()),
        )
        .expect("provider")
    }

    #[tokio::test]
    async fn generate_returns_trimmed_text() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).json_body(json!({
                    "response": "  Summary text \n",
                    "done": true
                }));
            })
            .await;

        let response = provider(&server)
            .call(ProviderRequest::Generate(GenerationRequest::new("Summarize")))
            .await
            .expect("summary");

        mock.assert();
        assert_eq!(response, ProviderResponse::Text("Summary text".into()));
    }

    #[tokio::test]
    async fn server_errors_are_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(500).body("boom");
            })
            .await;

        let error = provider(&server)
            .call(ProviderRequest::Generate(GenerationRequest::new("Summarize")))
            .await
            .expect_err("error response");

        assert!(matches!(error, ProviderError::Unavailable(message) if message.contains("500")));
    }

    #[tokio::test]
    async fn embed_returns_one_vector_per_text() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/embed")
                    .json_body_partial(r#"{"model":"nomic-embed-text"}"#);
                then.status(200).json_body(json!({
                    "embeddings": [[0.1, 0.2], [0.3, 0.4]]
                }));
            })
            .await;

        let response = provider(&server)
            .call(ProviderRequest::Embed(EmbeddingRequest {
                model: "nomic-embed-text".into(),
                texts: vec!["a".into(), "b".into()],
            }))
            .await
            .expect("embeddings");

        mock.assert();
        assert_eq!(
            response,
            ProviderResponse::Embeddings(vec![vec![0.1, 0.2], vec![0.3, 0.4]])
        );
    }

    #[test]
    fn capabilities_follow_configured_models() {
        let provider =
            OllamaProvider::new("ollama", 1, DEFAULT_OLLAMA_URL, None, Some("nomic".into()))
                .expect("provider");
        assert!(provider.descriptor().supports(Capability::Embedding));
        assert!(!provider.descriptor().supports(Capability::Generation));
    }
}
