use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::embedding::EmbedderSettings;
use crate::index::SimilarityMetric;
use crate::jobs::{OrchestratorSettings, WorkerSettings};
use crate::processing::PipelineSettings;
use crate::providers::RouterSettings;
use crate::retrieval::RetrievalSettings;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the Librarian server and CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding durable job state. `None` keeps jobs in memory.
    pub data_dir: Option<PathBuf>,
    /// Pinned embedding model identifier.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Inputs longer than this many characters are rejected before embedding.
    pub embedding_max_chars: usize,
    /// Which client produces embeddings.
    pub embedding_backend: EmbeddingBackend,
    /// Which vector index stores embeddings.
    pub vector_backend: VectorBackend,
    /// Base URL of the Qdrant instance (required for the `qdrant` backend).
    pub qdrant_url: Option<String>,
    /// Name of the Qdrant collection used for chunk vectors.
    pub qdrant_collection_name: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Similarity function used by the in-memory index.
    pub similarity_metric: SimilarityMetric,
    /// Attempt ceiling before a job is dead-lettered.
    pub job_max_attempts: u32,
    /// Lease visibility timeout.
    pub job_visibility_timeout: Duration,
    /// Hard wall-clock limit for a single running attempt.
    pub job_execution_limit: Duration,
    /// Base delay for exponential retry backoff.
    pub job_backoff_base: Duration,
    /// Upper bound for retry backoff.
    pub job_backoff_max: Duration,
    /// Number of in-process workers started by `serve`.
    pub worker_count: usize,
    /// Idle poll interval for workers.
    pub worker_poll_interval: Duration,
    /// Parallelism across chunks of one job.
    pub chunk_concurrency: usize,
    /// Chunk size applied when a submission omits one.
    pub default_chunk_size: usize,
    /// Chunk overlap applied when a submission omits one.
    pub default_chunk_overlap: usize,
    /// Entity confidence threshold applied when a submission omits one.
    pub default_confidence_threshold: f32,
    /// Consecutive failures that open a provider's circuit.
    pub router_failure_threshold: u32,
    /// Time an open circuit waits before a probe.
    pub router_cooldown: Duration,
    /// Default timeout applied to every provider call.
    pub provider_timeout: Duration,
    /// Base URL of a local Ollama runtime, enabling the Ollama provider.
    pub ollama_url: Option<String>,
    /// Generation model served by Ollama.
    pub ollama_generation_model: Option<String>,
    /// Embedding model served by Ollama.
    pub ollama_embedding_model: Option<String>,
    /// Base URL of an OpenAI-compatible API, enabling that provider.
    pub openai_base_url: Option<String>,
    /// API key for the OpenAI-compatible provider.
    pub openai_api_key: Option<String>,
    /// Chat model for the OpenAI-compatible provider.
    pub openai_model: Option<String>,
    /// Whether the deterministic stub provider closes the fallback chain.
    pub router_stub_fallback: bool,
    /// Token budget for retrieved context handed to generation.
    pub context_token_budget: usize,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// File-system document references must resolve inside this directory.
    pub document_root: PathBuf,
    /// JSON file mapping entity types to the terms that identify them.
    pub entity_dictionary_path: Option<PathBuf>,
    /// Finished jobs older than this are purged.
    pub job_retention: Duration,
}

/// Supported embedding clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Deterministic local hashing; no external calls.
    Hash,
    /// Embeddings served through the provider router.
    Router,
}

/// Supported vector index backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// Process-local index.
    Memory,
    /// Remote Qdrant collection.
    Qdrant,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            embedding_model: "hash-embed-v1".to_string(),
            embedding_dimension: 384,
            embedding_max_chars: 8000,
            embedding_backend: EmbeddingBackend::Hash,
            vector_backend: VectorBackend::Memory,
            qdrant_url: None,
            qdrant_collection_name: "librarian".to_string(),
            qdrant_api_key: None,
            similarity_metric: SimilarityMetric::Cosine,
            job_max_attempts: 3,
            job_visibility_timeout: Duration::from_secs(60),
            job_execution_limit: Duration::from_secs(600),
            job_backoff_base: Duration::from_millis(1000),
            job_backoff_max: Duration::from_millis(300_000),
            worker_count: 2,
            worker_poll_interval: Duration::from_millis(500),
            chunk_concurrency: 4,
            default_chunk_size: 1000,
            default_chunk_overlap: 100,
            default_confidence_threshold: 0.5,
            router_failure_threshold: 3,
            router_cooldown: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(30),
            ollama_url: None,
            ollama_generation_model: None,
            ollama_embedding_model: None,
            openai_base_url: None,
            openai_api_key: None,
            openai_model: None,
            router_stub_fallback: true,
            context_token_budget: 3000,
            server_port: None,
            document_root: PathBuf::from("."),
            entity_dictionary_path: None,
            job_retention: Duration::from_secs(86_400),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    ///
    /// Unset variables take the values of [`Config::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            data_dir: load_env_optional("LIBRARIAN_DATA_DIR").map(PathBuf::from),
            embedding_model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or(defaults.embedding_model),
            embedding_dimension: parse_or("EMBEDDING_DIMENSION", defaults.embedding_dimension)?,
            embedding_max_chars: parse_or("EMBEDDING_MAX_CHARS", defaults.embedding_max_chars)?,
            embedding_backend: parse_or("EMBEDDING_BACKEND", defaults.embedding_backend)?,
            vector_backend: parse_or("VECTOR_BACKEND", defaults.vector_backend)?,
            qdrant_url: load_env_optional("QDRANT_URL"),
            qdrant_collection_name: load_env_optional("QDRANT_COLLECTION_NAME")
                .unwrap_or(defaults.qdrant_collection_name),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            similarity_metric: parse_or("SIMILARITY_METRIC", defaults.similarity_metric)?,
            job_max_attempts: parse_or("JOB_MAX_ATTEMPTS", defaults.job_max_attempts)?,
            job_visibility_timeout: parse_secs(
                "JOB_VISIBILITY_TIMEOUT_SECS",
                defaults.job_visibility_timeout,
            )?,
            job_execution_limit: parse_secs(
                "JOB_EXECUTION_LIMIT_SECS",
                defaults.job_execution_limit,
            )?,
            job_backoff_base: parse_millis("JOB_BACKOFF_BASE_MS", defaults.job_backoff_base)?,
            job_backoff_max: parse_millis("JOB_BACKOFF_MAX_MS", defaults.job_backoff_max)?,
            worker_count: parse_or("WORKER_COUNT", defaults.worker_count)?,
            worker_poll_interval: parse_millis(
                "WORKER_POLL_INTERVAL_MS",
                defaults.worker_poll_interval,
            )?,
            chunk_concurrency: parse_or("CHUNK_CONCURRENCY", defaults.chunk_concurrency)?,
            default_chunk_size: parse_or("DEFAULT_CHUNK_SIZE", defaults.default_chunk_size)?,
            default_chunk_overlap: parse_or(
                "DEFAULT_CHUNK_OVERLAP",
                defaults.default_chunk_overlap,
            )?,
            default_confidence_threshold: parse_or(
                "DEFAULT_CONFIDENCE_THRESHOLD",
                defaults.default_confidence_threshold,
            )?,
            router_failure_threshold: parse_or(
                "ROUTER_FAILURE_THRESHOLD",
                defaults.router_failure_threshold,
            )?,
            router_cooldown: parse_secs("ROUTER_COOLDOWN_SECS", defaults.router_cooldown)?,
            provider_timeout: parse_secs("PROVIDER_TIMEOUT_SECS", defaults.provider_timeout)?,
            ollama_url: load_env_optional("OLLAMA_URL"),
            ollama_generation_model: load_env_optional("OLLAMA_GENERATION_MODEL"),
            ollama_embedding_model: load_env_optional("OLLAMA_EMBEDDING_MODEL"),
            openai_base_url: load_env_optional("OPENAI_BASE_URL"),
            openai_api_key: load_env_optional("OPENAI_API_KEY"),
            openai_model: load_env_optional("OPENAI_MODEL"),
            router_stub_fallback: parse_or("ROUTER_STUB_FALLBACK", defaults.router_stub_fallback)?,
            context_token_budget: parse_or(
                "CONTEXT_TOKEN_BUDGET",
                defaults.context_token_budget,
            )?,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
            document_root: load_env_optional("LIBRARIAN_DOCUMENT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.document_root),
            entity_dictionary_path: load_env_optional("ENTITY_DICTIONARY_PATH").map(PathBuf::from),
            job_retention: parse_secs("JOB_RETENTION_SECS", defaults.job_retention)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }
        if self.job_max_attempts == 0 {
            return Err(ConfigError::InvalidValue("JOB_MAX_ATTEMPTS".into()));
        }
        if self.default_chunk_overlap >= self.default_chunk_size {
            return Err(ConfigError::InvalidValue("DEFAULT_CHUNK_OVERLAP".into()));
        }
        if !(0.0..=1.0).contains(&self.default_confidence_threshold) {
            return Err(ConfigError::InvalidValue(
                "DEFAULT_CONFIDENCE_THRESHOLD".into(),
            ));
        }
        if self.vector_backend == VectorBackend::Qdrant && self.qdrant_url.is_none() {
            return Err(ConfigError::MissingVariable("QDRANT_URL".into()));
        }
        Ok(())
    }

    /// Orchestrator timing and retry policy.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_attempts: self.job_max_attempts,
            visibility_timeout: self.job_visibility_timeout,
            execution_limit: self.job_execution_limit,
            backoff_base: self.job_backoff_base,
            backoff_max: self.job_backoff_max,
        }
    }

    /// Circuit-breaker and timeout policy for the provider router.
    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            failure_threshold: self.router_failure_threshold,
            cooldown: self.router_cooldown,
            call_timeout: self.provider_timeout,
            ..RouterSettings::default()
        }
    }

    /// Pinned embedding model parameters.
    pub fn embedder_settings(&self) -> EmbedderSettings {
        EmbedderSettings {
            model: self.embedding_model.clone(),
            dimension: self.embedding_dimension,
            max_chars: self.embedding_max_chars,
        }
    }

    /// Worker polling and heartbeat cadence.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings::for_visibility(self.worker_poll_interval, self.job_visibility_timeout)
    }

    /// Retrieval limits derived from configuration.
    pub fn retrieval_settings(&self) -> RetrievalSettings {
        RetrievalSettings {
            context_token_budget: self.context_token_budget,
            ..RetrievalSettings::default()
        }
    }

    /// Pipeline parallelism and summary budget.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            chunk_concurrency: self.chunk_concurrency.max(1),
            ..PipelineSettings::default()
        }
    }
}

fn parse_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(key, default.as_secs()).map(Duration::from_secs)
}

fn parse_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(key, default).map(Duration::from_millis)
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl FromStr for EmbeddingBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "router" => Ok(Self::Router),
            _ => Err(()),
        }
    }
}

impl FromStr for VectorBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        data_dir = ?config.data_dir,
        embedding_model = %config.embedding_model,
        embedding_dimension = config.embedding_dimension,
        vector_backend = ?config.vector_backend,
        document_root = %config.document_root.display(),
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backends_parse_case_insensitively() {
        assert_eq!("HASH".parse(), Ok(EmbeddingBackend::Hash));
        assert_eq!("Qdrant".parse(), Ok(VectorBackend::Qdrant));
        assert!("faiss".parse::<VectorBackend>().is_err());
    }

    #[test]
    fn defaults_pass_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.orchestrator_settings().max_attempts, 3);
        assert_eq!(config.embedder_settings().dimension, 384);
        assert_eq!(config.document_root, PathBuf::from("."));
        assert_eq!(config.job_retention, Duration::from_secs(86_400));
    }

    #[test]
    fn qdrant_backend_requires_url() {
        let config = Config {
            vector_backend: VectorBackend::Qdrant,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingVariable(name)) if name == "QDRANT_URL"
        ));
    }

    #[test]
    fn parse_or_falls_back_to_default_when_unset() {
        let value: u32 = parse_or("LIBRARIAN_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
