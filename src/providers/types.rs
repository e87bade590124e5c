//! Request, response, and descriptor types shared by every provider backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What a backend can be asked to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Turn text into vectors.
    Embedding,
    /// Produce text from a prompt.
    Generation,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedding => f.write_str("embedding"),
            Self::Generation => f.write_str("generation"),
        }
    }
}

/// Text generation input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Fully assembled prompt.
    pub prompt: String,
    /// Optional response length cap understood by the backend.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Optional sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    /// Build a request with backend defaults for length and temperature.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Embedding input pinned to one model identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Model the caller expects vectors from; providers serving another model are skipped.
    pub model: String,
    /// Texts to embed, one vector per entry.
    pub texts: Vec<String>,
}

/// A request routed to one provider.
#[derive(Debug, Clone)]
pub enum ProviderRequest {
    /// Embedding call.
    Embed(EmbeddingRequest),
    /// Generation call.
    Generate(GenerationRequest),
}

impl ProviderRequest {
    /// Capability required to serve this request.
    pub fn capability(&self) -> Capability {
        match self {
            Self::Embed(_) => Capability::Embedding,
            Self::Generate(_) => Capability::Generation,
        }
    }
}

/// A provider's successful answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    /// One vector per requested text.
    Embeddings(Vec<Vec<f32>>),
    /// Generated text.
    Text(String),
}

/// Failures surfaced by a single provider call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    /// Call did not finish within its time bound.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Backend could not be reached or reported a server-side failure.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// Backend refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// Backend answered with a body we could not interpret.
    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
    /// Backend was asked for something it does not do.
    #[error("capability {0} not supported")]
    Unsupported(Capability),
}

/// Static description of a registered backend.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    /// Unique name; also the health-table key.
    pub name: String,
    /// Capabilities this backend serves.
    pub capabilities: Vec<Capability>,
    /// Higher weights are tried first.
    pub priority: u32,
    /// Embedding model served, if the backend embeds.
    pub embedding_model: Option<String>,
    /// Per-provider timeout overriding the router default.
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// Always ordered after every regular provider.
    pub fallback_only: bool,
}

impl ProviderDescriptor {
    /// Describe a provider with the given name, priority and capabilities.
    pub fn new(name: impl Into<String>, priority: u32, capabilities: &[Capability]) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.to_vec(),
            priority,
            embedding_model: None,
            timeout: None,
            fallback_only: false,
        }
    }

    /// Declare the embedding model served by this provider.
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    /// Override the router's default call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark as the terminal fallback of every chain.
    pub fn as_fallback(mut self) -> Self {
        self.fallback_only = true;
        self
    }

    /// Whether this provider advertises `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Interface implemented by every generation/embedding backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Static description used for ordering and eligibility.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Serve one request. Time bounds are enforced by the router.
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}
