//! Generation and embedding backends behind a health-aware router.

pub mod health;
pub mod ollama;
pub mod openai;
pub mod router;
pub mod stub;
mod types;

pub use health::{HealthSnapshot, HealthState};
pub use ollama::OllamaProvider;
pub use openai::OpenAiCompatibleProvider;
pub use router::{
    AttemptOutcome, ProviderAttempt, ProviderRouter, ProviderStatus, RouteError, Routed,
    RouterSettings, RoutingDecision, SkipReason,
};
pub use stub::StubProvider;
pub use types::{
    Capability, EmbeddingRequest, GenerationRequest, Provider, ProviderDescriptor, ProviderError,
    ProviderRequest, ProviderResponse,
};
