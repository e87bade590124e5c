//! Service facade wiring the orchestrator, pipeline, retrieval engine, and provider router.
//!
//! Front ends (HTTP, CLI) talk to [`LibrarianApi`] only; none of them touch job state directly.
//! Filesystem references are confined to the configured document root, and finished jobs are
//! purged after the retention period together with inline bodies nothing else refers to.

use crate::{
    config::{Config, EmbeddingBackend, VectorBackend},
    embedding::{Embedder, EmbeddingClient, HashEmbeddingClient, RouterEmbeddingClient},
    index::{IndexError, MemoryIndex, QdrantIndex, QdrantSettings, VectorIndex},
    jobs::{
        Clock, FileJobStore, JobPayload, JobSnapshot, JobStatus, JobStore, MemoryJobStore,
        Orchestrator, OrchestratorError, PurgeReport, StoreError, SystemClock, Worker,
        WorkerSettings,
    },
    metrics::{MetricsSnapshot, PipelineMetrics},
    processing::{
        DocumentLoader, DocumentPipeline, DocumentSummary, EntityExtractor, FileRecordStore,
        FileSystemSource, LoadError, MemoryRecordStore, RecordStore, RecordStoreError,
        entities::DictionaryStrategy,
    },
    providers::{
        OllamaProvider, OpenAiCompatibleProvider, Provider, ProviderError, ProviderRouter,
        ProviderStatus, RoutingDecision, StubProvider, ollama::DEFAULT_OLLAMA_URL,
    },
    retrieval::{Answer, Generated, RetrievalEngine, RetrievalError, SearchHit, SearchQuery},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const MAINTENANCE_POLLS: u32 = 10;

/// Errors surfaced by the facade.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Caller supplied an unusable request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Startup wiring could not be completed.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Job orchestration failed.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    /// Search, answer, or generation failed.
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    /// Job store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Record store could not be opened.
    #[error(transparent)]
    Records(#[from] RecordStoreError),
    /// Vector index could not be initialized.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Provider client could not be built.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Job submission; unset parameters take configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// File path or `mem://` reference. With `text`, used as the in-memory key.
    #[serde(default)]
    pub document_ref: Option<String>,
    /// Inline document contents, stored in memory before submission.
    #[serde(default)]
    pub text: Option<String>,
    /// Maximum chunk length, in characters.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Characters shared by consecutive chunks.
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
    /// Minimum entity confidence kept.
    #[serde(default)]
    pub confidence_threshold: Option<f32>,
    /// Entity types to keep; empty keeps all.
    #[serde(default)]
    pub entity_types: Vec<String>,
    /// Store a document summary after indexing.
    #[serde(default)]
    pub summarize: bool,
}

/// Defaults applied to submissions.
#[derive(Debug, Clone)]
struct JobDefaults {
    chunk_size: usize,
    chunk_overlap: usize,
    confidence_threshold: f32,
}

/// Operations available to front ends.
#[async_trait]
pub trait LibrarianApi: Send + Sync {
    /// Submit a document for processing.
    async fn submit(&self, request: SubmitRequest) -> Result<Uuid, ServiceError>;

    /// Latest durable state of a job.
    async fn status(&self, id: Uuid) -> Result<JobSnapshot, ServiceError>;

    /// Cancel a job; `false` if it was already terminal.
    async fn cancel(&self, id: Uuid) -> Result<bool, ServiceError>;

    /// Jobs, optionally restricted to one status.
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobSnapshot>, ServiceError>;

    /// Return a dead-lettered job to the queue.
    async fn requeue(&self, id: Uuid) -> Result<JobSnapshot, ServiceError>;

    /// Ranked chunks for a query.
    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>, ServiceError>;

    /// Answer a question from retrieved chunks.
    async fn answer(&self, query: SearchQuery) -> Result<Answer, ServiceError>;

    /// Route a raw generation prompt.
    async fn generate(
        &self,
        prompt: String,
        max_tokens: Option<u32>,
    ) -> Result<Generated, ServiceError>;

    /// Summary of an indexed document.
    async fn summarize(&self, document_id: String) -> Result<DocumentSummary, ServiceError>;

    /// Pipeline, job, and routing counters.
    fn metrics(&self) -> MetricsSnapshot;

    /// Provider chain with live health.
    fn providers(&self) -> Vec<ProviderStatus>;

    /// Recent routing decisions, oldest first.
    fn routing_decisions(&self) -> Vec<RoutingDecision>;
}

/// Externally supplied pieces; everything else is derived from [`Config`].
pub struct Components {
    /// Job table.
    pub job_store: Arc<dyn JobStore>,
    /// Time source for leases and backoff.
    pub clock: Arc<dyn Clock>,
    /// Vector storage.
    pub index: Arc<dyn VectorIndex>,
    /// Chunk, entity and summary records.
    pub records: Arc<dyn RecordStore>,
    /// Provider chain; `None` disables generation and router embeddings.
    pub router: Option<Arc<ProviderRouter>>,
}

/// The assembled system.
pub struct Librarian {
    orchestrator: Arc<Orchestrator>,
    pipeline: Arc<DocumentPipeline>,
    retrieval: RetrievalEngine,
    router: Option<Arc<ProviderRouter>>,
    loader: Arc<DocumentLoader>,
    files: FileSystemSource,
    metrics: Arc<PipelineMetrics>,
    worker_settings: WorkerSettings,
    worker_count: usize,
    job_retention: Duration,
    defaults: JobDefaults,
}

impl Librarian {
    /// Build every component described by `config`.
    pub async fn from_config(config: &Config) -> Result<Self, ServiceError> {
        config
            .validate()
            .map_err(|error| ServiceError::Configuration(error.to_string()))?;
        let metrics = Arc::new(PipelineMetrics::new());

        let job_store: Arc<dyn JobStore>;
        let records: Arc<dyn RecordStore>;
        match &config.data_dir {
            Some(dir) => {
                job_store = Arc::new(FileJobStore::open(dir).await?);
                records = Arc::new(FileRecordStore::open(dir).await?);
            }
            None => {
                tracing::warn!("LIBRARIAN_DATA_DIR unset; jobs and records are kept in memory only");
                job_store = Arc::new(MemoryJobStore::new());
                records = Arc::new(MemoryRecordStore::new());
            }
        }

        let index: Arc<dyn VectorIndex> = match config.vector_backend {
            VectorBackend::Memory => Arc::new(MemoryIndex::new(
                config.embedding_dimension,
                config.similarity_metric,
            )),
            VectorBackend::Qdrant => {
                let url = config.qdrant_url.clone().ok_or_else(|| {
                    ServiceError::Configuration("QDRANT_URL is required for qdrant".into())
                })?;
                Arc::new(
                    QdrantIndex::connect(QdrantSettings {
                        url,
                        collection: config.qdrant_collection_name.clone(),
                        api_key: config.qdrant_api_key.clone(),
                        dimension: config.embedding_dimension,
                        metric: config.similarity_metric,
                    })
                    .await?,
                )
            }
        };

        let providers = build_providers(config)?;
        let router = if providers.is_empty() {
            tracing::warn!("No generation providers configured");
            None
        } else {
            Some(Arc::new(
                ProviderRouter::new(providers, config.router_settings())
                    .with_metrics(metrics.clone()),
            ))
        };

        Self::from_parts_with_metrics(
            config,
            Components {
                job_store,
                clock: Arc::new(SystemClock),
                index,
                records,
                router,
            },
            metrics,
        )
    }

    /// Assemble from explicit components, deriving the rest from `config`.
    pub fn from_parts(config: &Config, components: Components) -> Result<Self, ServiceError> {
        Self::from_parts_with_metrics(config, components, Arc::new(PipelineMetrics::new()))
    }

    fn from_parts_with_metrics(
        config: &Config,
        components: Components,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ServiceError> {
        let Components {
            job_store,
            clock,
            index,
            records,
            router,
        } = components;

        if index.dimension() != config.embedding_dimension {
            return Err(ServiceError::Configuration(format!(
                "index dimension {} does not match EMBEDDING_DIMENSION {}",
                index.dimension(),
                config.embedding_dimension
            )));
        }

        let client: Arc<dyn EmbeddingClient> = match config.embedding_backend {
            EmbeddingBackend::Hash => Arc::new(HashEmbeddingClient::new(config.embedding_dimension)),
            EmbeddingBackend::Router => {
                let router = router.clone().ok_or_else(|| {
                    ServiceError::Configuration(
                        "EMBEDDING_BACKEND=router needs at least one provider".into(),
                    )
                })?;
                Arc::new(RouterEmbeddingClient::new(router))
            }
        };
        let embedder = Embedder::new(client, config.embedder_settings());
        let files = FileSystemSource::confined(&config.document_root);
        let loader =
            Arc::new(DocumentLoader::default().with_files(Arc::new(files.clone())));
        let extractor = entity_extractor(config.entity_dictionary_path.as_deref())?;

        let orchestrator = Arc::new(Orchestrator::new(
            job_store,
            clock,
            config.orchestrator_settings(),
            metrics.clone(),
        ));
        let pipeline = Arc::new(DocumentPipeline::new(
            loader.clone(),
            embedder.clone(),
            Arc::new(extractor),
            index.clone(),
            records.clone(),
            router.clone(),
            metrics.clone(),
            config.pipeline_settings(),
        ));
        let retrieval = RetrievalEngine::new(
            embedder,
            index,
            records,
            router.clone(),
            config.retrieval_settings(),
        );

        tracing::info!(
            embedding_backend = ?config.embedding_backend,
            vector_backend = ?config.vector_backend,
            document_root = %config.document_root.display(),
            providers = router.as_ref().map_or(0, |router| router.chain().len()),
            workers = config.worker_count,
            "Librarian assembled"
        );

        Ok(Self {
            orchestrator,
            pipeline,
            retrieval,
            router,
            loader,
            files,
            metrics,
            worker_settings: config.worker_settings(),
            worker_count: config.worker_count,
            job_retention: config.job_retention,
            defaults: JobDefaults {
                chunk_size: config.default_chunk_size,
                chunk_overlap: config.default_chunk_overlap,
                confidence_threshold: config.default_confidence_threshold,
            },
        })
    }

    /// Shared orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// A worker bound to this instance's orchestrator and pipeline.
    pub fn worker(&self, name: impl Into<String>) -> Worker {
        Worker::new(
            name,
            self.orchestrator.clone(),
            self.pipeline.clone(),
            self.worker_settings.clone(),
        )
    }

    /// Start the configured number of workers plus the retention task; all of them stop when
    /// `shutdown` becomes `true`.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = (0..self.worker_count.max(1))
            .map(|slot| {
                let worker = self.worker(format!("worker-{slot}"));
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect();

        let orchestrator = self.orchestrator.clone();
        let loader = self.loader.clone();
        let retention = self.job_retention;
        let interval = self.worker_settings.poll_interval * MAINTENANCE_POLLS;
        let mut shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if let Err(error) = purge(&orchestrator, &loader, retention).await {
                    tracing::warn!(error = %error, "Retention purge failed");
                }
            }
        }));
        handles
    }

    /// Delete finished jobs older than the retention period and evict inline bodies that no
    /// remaining job refers to.
    pub async fn purge_finished(&self) -> Result<PurgeReport, ServiceError> {
        purge(&self.orchestrator, &self.loader, self.job_retention).await
    }

    async fn check_document_root(&self, reference: &str) -> Result<(), ServiceError> {
        match self.files.resolve(reference).await {
            Err(error @ LoadError::OutsideRoot(_)) => {
                Err(ServiceError::InvalidRequest(error.to_string()))
            }
            // Missing or unreadable files fail the job when it is loaded.
            _ => Ok(()),
        }
    }

    fn payload(&self, request: &SubmitRequest, document_ref: String) -> JobPayload {
        JobPayload {
            document_ref,
            chunk_size: request.chunk_size.unwrap_or(self.defaults.chunk_size),
            chunk_overlap: request.chunk_overlap.unwrap_or(self.defaults.chunk_overlap),
            confidence_threshold: request
                .confidence_threshold
                .unwrap_or(self.defaults.confidence_threshold),
            entity_types: request.entity_types.clone(),
            summarize: request.summarize,
        }
    }
}

#[async_trait]
impl LibrarianApi for Librarian {
    async fn submit(&self, request: SubmitRequest) -> Result<Uuid, ServiceError> {
        let document_ref = match (&request.text, &request.document_ref) {
            (Some(text), key) => {
                let key = key.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
                self.loader.memory().insert(&key, text.as_bytes()).await
            }
            (None, Some(reference)) => {
                if !DocumentLoader::is_memory(reference) {
                    self.check_document_root(reference).await?;
                }
                reference.clone()
            }
            (None, None) => {
                return Err(ServiceError::InvalidRequest(
                    "either document_ref or text is required".into(),
                ));
            }
        };
        let payload = self.payload(&request, document_ref);
        Ok(self.orchestrator.submit(payload).await?)
    }

    async fn status(&self, id: Uuid) -> Result<JobSnapshot, ServiceError> {
        Ok(self.orchestrator.get_status(id).await?)
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.orchestrator.cancel(id).await?)
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobSnapshot>, ServiceError> {
        Ok(self.orchestrator.list(status).await?)
    }

    async fn requeue(&self, id: Uuid) -> Result<JobSnapshot, ServiceError> {
        Ok(self.orchestrator.requeue_dead_letter(id).await?)
    }

    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>, ServiceError> {
        Ok(self.retrieval.search(&query).await?)
    }

    async fn answer(&self, query: SearchQuery) -> Result<Answer, ServiceError> {
        Ok(self.retrieval.answer(&query).await?)
    }

    async fn generate(
        &self,
        prompt: String,
        max_tokens: Option<u32>,
    ) -> Result<Generated, ServiceError> {
        if prompt.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("prompt is empty".into()));
        }
        Ok(self.retrieval.generate(&prompt, max_tokens).await?)
    }

    async fn summarize(&self, document_id: String) -> Result<DocumentSummary, ServiceError> {
        Ok(self.retrieval.summarize(&document_id).await?)
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn providers(&self) -> Vec<ProviderStatus> {
        self.router
            .as_ref()
            .map(|router| router.health_report())
            .unwrap_or_default()
    }

    fn routing_decisions(&self) -> Vec<RoutingDecision> {
        self.router
            .as_ref()
            .map(|router| router.recent_decisions())
            .unwrap_or_default()
    }
}

async fn purge(
    orchestrator: &Orchestrator,
    loader: &DocumentLoader,
    retention: Duration,
) -> Result<PurgeReport, ServiceError> {
    let report = orchestrator.purge_finished(retention).await?;
    let inline: Vec<&String> = report
        .document_refs
        .iter()
        .filter(|reference| DocumentLoader::is_memory(reference))
        .collect();
    if inline.is_empty() {
        return Ok(report);
    }

    let referenced: HashSet<String> = orchestrator
        .list(None)
        .await?
        .into_iter()
        .map(|job| job.document_ref)
        .collect();
    let mut evicted = 0;
    for reference in inline {
        if !referenced.contains(reference.as_str()) && loader.memory().remove(reference).await {
            evicted += 1;
        }
    }
    if evicted > 0 {
        tracing::debug!(evicted, "Evicted inline documents of purged jobs");
    }
    Ok(report)
}

/// Default extractor, plus a dictionary strategy when `path` names a `type -> terms` JSON file.
pub fn entity_extractor(path: Option<&Path>) -> Result<EntityExtractor, ServiceError> {
    let extractor = EntityExtractor::default();
    let Some(path) = path else {
        return Ok(extractor);
    };
    let configuration = |detail: String| {
        ServiceError::Configuration(format!(
            "entity dictionary {}: {detail}",
            path.display()
        ))
    };
    let raw = std::fs::read_to_string(path).map_err(|error| configuration(error.to_string()))?;
    let dictionary: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&raw).map_err(|error| configuration(error.to_string()))?;
    let strategy =
        DictionaryStrategy::new(&dictionary).map_err(|error| configuration(error.to_string()))?;
    tracing::info!(
        path = %path.display(),
        types = dictionary.len(),
        "Loaded entity dictionary"
    );
    Ok(extractor.with_strategy(strategy))
}

/// Provider chain described by `config`: Ollama, then OpenAI-compatible, then the stub.
pub fn build_providers(config: &Config) -> Result<Vec<Arc<dyn Provider>>, ProviderError> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    let router_embeddings = config.embedding_backend == EmbeddingBackend::Router;

    let ollama_embedding = config
        .ollama_embedding_model
        .clone()
        .filter(|_| router_embeddings);
    if config.ollama_generation_model.is_some() || ollama_embedding.is_some() {
        let url = config
            .ollama_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        providers.push(Arc::new(OllamaProvider::new(
            "ollama",
            100,
            url,
            config.ollama_generation_model.clone(),
            ollama_embedding,
        )?));
    }

    if config.openai_api_key.is_some() || config.openai_base_url.is_some() {
        let url = config
            .openai_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        let embedding_model = router_embeddings.then(|| config.embedding_model.clone());
        if config.openai_model.is_some() || embedding_model.is_some() {
            providers.push(Arc::new(OpenAiCompatibleProvider::new(
                "openai",
                50,
                url,
                config.openai_api_key.clone(),
                config.openai_model.clone(),
                embedding_model,
            )?));
        }
    }

    if config.router_stub_fallback {
        providers.push(Arc::new(StubProvider::new(
            config.embedding_model.clone(),
            config.embedding_dimension,
        )));
    }

    tracing::debug!(
        providers = ?providers
            .iter()
            .map(|provider| provider.descriptor().name.clone())
            .collect::<Vec<_>>(),
        "Provider chain built"
    );
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_includes_configured_backends_in_priority_order() {
        let config = Config {
            ollama_generation_model: Some("llama3".into()),
            openai_api_key: Some("sk-test".into()),
            openai_model: Some("gpt-4o-mini".into()),
            ..Config::default()
        };
        let providers = build_providers(&config).unwrap();
        let names: Vec<_> = providers
            .iter()
            .map(|provider| provider.descriptor().name.clone())
            .collect();
        assert_eq!(names, vec!["ollama", "openai", "stub"]);
    }

    #[test]
    fn stub_can_be_disabled() {
        let config = Config {
            router_stub_fallback: false,
            ..Config::default()
        };
        assert!(build_providers(&config).unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_requires_a_document() {
        let librarian = Librarian::from_config(&Config::default()).await.unwrap();
        let error = librarian
            .submit(SubmitRequest::default())
            .await
            .expect_err("no document");
        assert!(matches!(error, ServiceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn inline_text_is_stored_and_defaults_applied() {
        let librarian = Librarian::from_config(&Config::default()).await.unwrap();
        let id = librarian
            .submit(SubmitRequest {
                document_ref: Some("notes".into()),
                text: Some("hello".into()),
                ..SubmitRequest::default()
            })
            .await
            .unwrap();
        let snapshot = librarian.status(id).await.unwrap();
        assert_eq!(snapshot.document_ref, "mem://notes");
        assert_eq!(snapshot.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn dictionary_terms_become_searchable_entities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dictionary.json");
        std::fs::write(&path, r#"{"ORG": ["Northwind Traders"]}"#).unwrap();
        let config = Config {
            entity_dictionary_path: Some(path),
            ..Config::default()
        };
        let librarian = Librarian::from_config(&config).await.unwrap();
        let id = librarian
            .submit(SubmitRequest {
                document_ref: Some("supplier".into()),
                text: Some("the shipment from northwind traders arrived late".into()),
                ..SubmitRequest::default()
            })
            .await
            .unwrap();
        librarian.worker("w").run_once().await.unwrap();
        assert_eq!(librarian.status(id).await.unwrap().status, JobStatus::Succeeded);

        let hits = librarian
            .search(SearchQuery {
                text: "shipment".into(),
                k: 5,
                entity_types: vec!["org".into()],
                ..SearchQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "mem://supplier");
    }

    #[test]
    fn unreadable_dictionary_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dictionary.json");
        std::fs::write(&path, "[not a map]").unwrap();
        assert!(matches!(
            entity_extractor(Some(path.as_path())),
            Err(ServiceError::Configuration(_))
        ));
        assert!(matches!(
            entity_extractor(Some(dir.path().join("missing.json").as_path())),
            Err(ServiceError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn references_outside_the_document_root_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("inside.txt"), "inside").unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        let config = Config {
            document_root: root.path().to_path_buf(),
            ..Config::default()
        };
        let librarian = Librarian::from_config(&config).await.unwrap();

        let error = librarian
            .submit(SubmitRequest {
                document_ref: Some(outside.path().join("secret.txt").display().to_string()),
                ..SubmitRequest::default()
            })
            .await
            .expect_err("outside the root");
        assert!(matches!(error, ServiceError::InvalidRequest(_)));

        let id = librarian
            .submit(SubmitRequest {
                document_ref: Some("inside.txt".into()),
                ..SubmitRequest::default()
            })
            .await
            .unwrap();
        librarian.worker("w").run_once().await.unwrap();
        assert_eq!(librarian.status(id).await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn purge_evicts_inline_bodies_of_removed_jobs() {
        let config = Config {
            job_retention: Duration::ZERO,
            ..Config::default()
        };
        let librarian = Librarian::from_config(&config).await.unwrap();
        let submit = |key: &str| SubmitRequest {
            document_ref: Some(key.into()),
            text: Some("Short inline body.".into()),
            ..SubmitRequest::default()
        };
        let finished = librarian.submit(submit("done")).await.unwrap();
        librarian.worker("w").run_once().await.unwrap();
        let waiting = librarian.submit(submit("queued")).await.unwrap();

        let report = librarian.purge_finished().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.document_refs, vec!["mem://done".to_string()]);
        assert!(matches!(
            librarian.status(finished).await,
            Err(ServiceError::Orchestrator(OrchestratorError::NotFound(_)))
        ));
        assert_eq!(librarian.loader.memory().len().await, 1);
        assert_eq!(
            librarian.status(waiting).await.unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn records_survive_a_restart_with_a_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        {
            let librarian = Librarian::from_config(&config).await.unwrap();
            librarian
                .submit(SubmitRequest {
                    document_ref: Some("kept".into()),
                    text: Some("The archive keeps every ledger.".into()),
                    summarize: true,
                    ..SubmitRequest::default()
                })
                .await
                .unwrap();
            librarian.worker("w").run_once().await.unwrap();
        }

        let restarted = Librarian::from_config(&config).await.unwrap();
        let summary = restarted.summarize("mem://kept".into()).await.unwrap();
        assert_eq!(summary.document_id, "mem://kept");
        assert!(dir.path().join("records").is_dir());
    }

    #[tokio::test]
    async fn router_embeddings_need_a_router() {
        let config = Config {
            embedding_backend: EmbeddingBackend::Router,
            ..Config::default()
        };
        let result = Librarian::from_parts(
            &config,
            Components {
                job_store: Arc::new(MemoryJobStore::new()),
                clock: Arc::new(SystemClock),
                index: Arc::new(MemoryIndex::new(
                    config.embedding_dimension,
                    config.similarity_metric,
                )),
                records: Arc::new(MemoryRecordStore::new()),
                router: None,
            },
        );
        assert!(matches!(result, Err(ServiceError::Configuration(_))));
    }
}
