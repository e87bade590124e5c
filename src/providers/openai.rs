//! OpenAI-compatible HTTP adapter (`/chat/completions`, `/embeddings`).
//!
//! Works against the hosted API and against gateways that mirror its wire format.

use super::ollama::classify_status;
use super::types::{
    Capability, EmbeddingRequest, GenerationRequest, Provider, ProviderDescriptor, ProviderError,
    ProviderRequest, ProviderResponse,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

/// Client for one OpenAI-compatible endpoint.
pub struct OpenAiCompatibleProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    chat_model: Option<String>,
    descriptor: ProviderDescriptor,
}

impl OpenAiCompatibleProvider {
    /// Build a provider; capabilities follow from which models are configured.
    pub fn new(
        name: impl Into<String>,
        priority: u32,
        base_url: impl Into<String>,
        api_key: Option<String>,
        chat_model: Option<String>,
        embedding_model: Option<String>,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .user_agent("librarian/openai")
            .build()
            .map_err(|error| ProviderError::Unavailable(error.to_string()))?;

        let mut capabilities = Vec::new();
        if chat_model.is_some() {
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
            api_key,
            chat_model,
            descriptor,
        })
    }

    async fn complete(&self, request: GenerationRequest) -> Result<String, ProviderError> {
        let model = self
            .chat_model
            .as_deref()
            .ok_or(ProviderError::Unsupported(Capability::Generation))?;
        let mut payload = json!({
            "model": model,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        let body: ChatResponse = self.post_json("chat/completions", &payload).await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("no completion content".into()))
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<Vec<Vec<f32>>, ProviderError> {
        let payload = json!({
            "model": request.model,
            "input": request.texts,
        });
        let mut body: EmbeddingsResponse = self.post_json("embeddings", &payload).await?;
        body.data.sort_by_key(|item| item.index);
        Ok(body.data.into_iter().map(|item| item.embedding).collect())
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        payload: &Value,
    ) -> Result<T, ProviderError> {
        let url = format!("{}/{path}", self.base_url.trim_end_matches('/'));
        let mut builder = self.http.post(&url).json(payload);
        if let Some(key) = self.api_key.as_deref()
            && !key.is_empty()
        {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|error| {
            ProviderError::Unavailable(format!("failed to reach {url}: {error}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        response.json().await.map_err(|error| {
            ProviderError::InvalidResponse(format!("failed to decode response: {error}"))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match request {
            ProviderRequest::Generate(request) => {
                self.complete(request).await.map(ProviderResponse::Text)
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

    fn provider(server: &MockServer) -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new(
            "openai",
            20,
            server.url("/v1"),
            Some("secret".into()),
            Some("gpt-4o-mini".into()),
            Some("text-embedding-3-small".into()),
        )
        .expect("provider")
    }

    #[tokio::test]
    async fn chat_completion_sends_bearer_and_reads_first_choice() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(json!({
                    "choices": [{ "message": { "role": "assistant", "content": "Answer." } }]
                }));
            })
            .await;

        let response = provider(&server)
            .call(ProviderRequest::Generate(GenerationRequest::new("Question?")))
            .await
            .expect("completion");

        mock.assert();
        assert_eq!(response, ProviderResponse::Text("Answer.".into()));
    }

    #[tokio::test]
    async fn embeddings_are_reordered_by_index() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(200).json_body(json!({
                    "data": [
                        { "index": 1, "embedding": [0.0, 1.0] },
                        { "index": 0, "embedding": [1.0, 0.0] }
                    ]
                }));
            })
            .await;

        let response = provider(&server)
            .call(ProviderRequest::Embed(EmbeddingRequest {
                model: "text-embedding-3-small".into(),
                texts: vec!["first".into(), "second".into()],
            }))
            .await
            .expect("embeddings");

        assert_eq!(
            response,
            ProviderResponse::Embeddings(vec![vec![1.0, 0.0], vec![0.0, 1.0]])
        );
    }

    #[tokio::test]
    async fn client_errors_are_rejections() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(401).body("bad key");
            })
            .await;

        let error = provider(&server)
            .call(ProviderRequest::Generate(GenerationRequest::new("Question?")))
            .await
            .expect_err("unauthorized");
        assert!(matches!(error, ProviderError::Rejected(message) if message.contains("401")));
    }
}
