//! HTTP surface for the librarian.
//!
//! A thin Axum adapter over [`LibrarianApi`]:
//!
//! - `POST /jobs` – Submit a document (path, `mem://` reference, or inline `text`) for processing.
//! - `GET /jobs` – List jobs, optionally `?status=dead_lettered`.
//! - `GET /jobs/:id` – Job status, attempt count, error detail, and result reference.
//! - `POST /jobs/:id/cancel` – Cancel a job.
//! - `POST /jobs/:id/requeue` – Return a dead-lettered job to the queue.
//! - `POST /search` – Ranked chunks for a free-text query.
//! - `POST /answer` – Answer a question from retrieved chunks.
//! - `POST /generate` – Route a raw prompt through the provider chain.
//! - `POST /summarize` – Summary of an indexed document.
//! - `GET /metrics`, `GET /providers`, `GET /routing` – Counters, provider health, recent routing.
//! - `GET /commands` – Machine-readable command catalog.

use crate::jobs::{JobSnapshot, JobStatus, OrchestratorError};
use crate::retrieval::{RetrievalError, SearchHit, SearchQuery};
use crate::service::{LibrarianApi, ServiceError, SubmitRequest};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Build the HTTP router over a [`LibrarianApi`] implementation.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: LibrarianApi + 'static,
{
    Router::new()
        .route("/jobs", get(list_jobs::<S>).post(submit_job::<S>))
        .route("/jobs/:id", get(job_status::<S>))
        .route("/jobs/:id/cancel", post(cancel_job::<S>))
        .route("/jobs/:id/requeue", post(requeue_job::<S>))
        .route("/search", post(search::<S>))
        .route("/answer", post(answer::<S>))
        .route("/generate", post(generate::<S>))
        .route("/summarize", post(summarize::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/providers", get(get_providers::<S>))
        .route("/routing", get(get_routing::<S>))
        .route("/commands", get(get_commands))
        .with_state(service)
}

#[derive(Serialize)]
struct SubmitResponse {
    job_id: Uuid,
}

async fn submit_job<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError>
where
    S: LibrarianApi,
{
    let job_id = service.submit(request).await?;
    tracing::info!(job_id = %job_id, "Submit request accepted");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Serialize)]
struct JobsResponse {
    jobs: Vec<JobSnapshot>,
}

async fn list_jobs<S>(
    State(service): State<Arc<S>>,
    Query(params): Query<ListParams>,
) -> Result<Json<JobsResponse>, AppError>
where
    S: LibrarianApi,
{
    let jobs = service.list_jobs(params.status).await?;
    Ok(Json(JobsResponse { jobs }))
}

async fn job_status<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, AppError>
where
    S: LibrarianApi,
{
    Ok(Json(service.status(id).await?))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_job<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, AppError>
where
    S: LibrarianApi,
{
    let cancelled = service.cancel(id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn requeue_job<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, AppError>
where
    S: LibrarianApi,
{
    Ok(Json(service.requeue(id).await?))
}

#[derive(Serialize)]
struct SearchResponse {
    hits: Vec<SearchHit>,
}

async fn search<S>(
    State(service): State<Arc<S>>,
    Json(query): Json<SearchQuery>,
) -> Result<Json<SearchResponse>, AppError>
where
    S: LibrarianApi,
{
    let hits = service.search(query).await?;
    Ok(Json(SearchResponse { hits }))
}

async fn answer<S>(
    State(service): State<Arc<S>>,
    Json(query): Json<SearchQuery>,
) -> Result<Response, AppError>
where
    S: LibrarianApi,
{
    Ok(Json(service.answer(query).await?).into_response())
}

#[derive(Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    max_tokens: Option<u32>,
}

async fn generate<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, AppError>
where
    S: LibrarianApi,
{
    let generated = service.generate(request.prompt, request.max_tokens).await?;
    Ok(Json(generated).into_response())
}

#[derive(Deserialize)]
struct SummarizeRequest {
    document_id: String,
}

async fn summarize<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<SummarizeRequest>,
) -> Result<Response, AppError>
where
    S: LibrarianApi,
{
    Ok(Json(service.summarize(request.document_id).await?).into_response())
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Response
where
    S: LibrarianApi,
{
    Json(service.metrics()).into_response()
}

async fn get_providers<S>(State(service): State<Arc<S>>) -> Response
where
    S: LibrarianApi,
{
    Json(json!({ "providers": service.providers() })).into_response()
}

async fn get_routing<S>(State(service): State<Arc<S>>) -> Response
where
    S: LibrarianApi,
{
    Json(json!({ "decisions": service.routing_decisions() })).into_response()
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "submit",
                method: "POST",
                path: "/jobs",
                description: "Queue a document for chunking, entity extraction, embedding, and indexing. Returns { \"job_id\": uuid }.",
                request_example: Some(json!({
                    "document_ref": "/data/reports/q3.txt",
                    "chunk_size": 1000,
                    "chunk_overlap": 100,
                    "confidence_threshold": 0.5,
                    "entity_types": ["EMAIL", "DATE"],
                    "summarize": true
                })),
            },
            CommandDescriptor {
                name: "status",
                method: "GET",
                path: "/jobs/:id",
                description: "Job status, attempt count and history, error detail, and result reference.",
                request_example: None,
            },
            CommandDescriptor {
                name: "cancel",
                method: "POST",
                path: "/jobs/:id/cancel",
                description: "Cancel a pending or running job; running jobs discard their results.",
                request_example: None,
            },
            CommandDescriptor {
                name: "search",
                method: "POST",
                path: "/search",
                description: "Top-k chunks by similarity, optionally limited to chunks carrying given entity types. Set hybrid to a vector weight in [0, 1] to blend in keyword matches.",
                request_example: Some(json!({
                    "text": "quarterly revenue",
                    "k": 5,
                    "entity_types": ["MONEY"],
                    "hybrid": 0.7
                })),
            },
            CommandDescriptor {
                name: "generate",
                method: "POST",
                path: "/generate",
                description: "Route a prompt through the provider chain; errors name every exhausted provider.",
                request_example: Some(json!({ "prompt": "Say hello", "max_tokens": 64 })),
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Documents, chunks, and entities indexed; job outcomes; router calls and fallbacks.",
                request_example: None,
            },
        ],
    })
}

struct AppError(ServiceError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Orchestrator(error) => match error {
                OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
                OrchestratorError::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
                OrchestratorError::StaleLease { .. }
                | OrchestratorError::InvalidTransition { .. }
                | OrchestratorError::Contention(_) => StatusCode::CONFLICT,
                OrchestratorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServiceError::Retrieval(error) => match error {
                RetrievalError::EmptyQuery | RetrievalError::InvalidHybridWeight(_) => {
                    StatusCode::BAD_REQUEST
                }
                RetrievalError::UnknownDocument(_) => StatusCode::NOT_FOUND,
                RetrievalError::NoRouter => StatusCode::SERVICE_UNAVAILABLE,
                RetrievalError::Route(_) => StatusCode::BAD_GATEWAY,
                RetrievalError::Embedding(error) if !error.is_retriable() => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(inner: ServiceError) -> Self {
        Self(inner)
    }
}
