//! Worker loop: sweep, lease, process with heartbeats, report.
//!
//! Every heartbeat tick sweeps first, so a single worker stuck on a hung job still enforces the
//! execution limit on its own attempt.

use super::orchestrator::{
    FailureReport, LeaseCheck, Orchestrator, OrchestratorError, SweepReport,
};
use super::types::{JobStatus, Lease};
use crate::processing::{CommitGuard, DocumentPipeline, ProcessingError, ProcessingOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Polling and heartbeat cadence.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
    /// How often a held lease is extended.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

impl WorkerSettings {
    /// Heartbeat at a third of the visibility timeout.
    pub fn for_visibility(poll_interval: Duration, visibility_timeout: Duration) -> Self {
        Self {
            poll_interval,
            heartbeat_interval: (visibility_timeout / 3).max(Duration::from_millis(10)),
        }
    }
}

/// What one iteration of the worker did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing was dispatchable.
    Idle,
    /// A job was processed and reported; its new status.
    Reported(JobStatus),
    /// The lease was lost mid-flight; results were dropped without reporting.
    Abandoned,
}

/// Pulls jobs from the orchestrator and runs them through the pipeline.
pub struct Worker {
    name: String,
    orchestrator: Arc<Orchestrator>,
    pipeline: Arc<DocumentPipeline>,
    settings: WorkerSettings,
}

/// Lease check performed before each durable write.
struct LeaseGuard<'a> {
    orchestrator: &'a Orchestrator,
    lease: &'a Lease,
}

#[async_trait]
impl CommitGuard for LeaseGuard<'_> {
    async fn ensure_current(&self) -> Result<(), ProcessingError> {
        match self.orchestrator.verify_lease(self.lease).await {
            Ok(LeaseCheck::Valid) => Ok(()),
            Ok(LeaseCheck::CancelRequested) => Err(ProcessingError::Cancelled),
            Err(error) => {
                tracing::warn!(job_id = %self.lease.job_id, error = %error, "Lease check failed");
                Err(ProcessingError::LeaseLost)
            }
        }
    }
}

impl Worker {
    /// Worker named `name` (used in logs).
    pub fn new(
        name: impl Into<String>,
        orchestrator: Arc<Orchestrator>,
        pipeline: Arc<DocumentPipeline>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            name: name.into(),
            orchestrator,
            pipeline,
            settings,
        }
    }

    /// Poll until `shutdown` flips to `true`. A job in flight is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.name, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(WorkOutcome::Idle) => true,
                Ok(_) => false,
                Err(error) => {
                    tracing::error!(worker = %self.name, error = %error, "Worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!(worker = %self.name, "Worker stopped");
    }

    /// Sweep expired leases, then lease and process at most one job.
    pub async fn run_once(&self) -> Result<WorkOutcome, OrchestratorError> {
        let report = self.orchestrator.sweep().await?;
        if report != SweepReport::default() {
            tracing::info!(worker = %self.name, ?report, "Sweep reclaimed leases");
        }

        let Some(lease) = self.orchestrator.lease().await? else {
            return Ok(WorkOutcome::Idle);
        };
        tracing::info!(
            worker = %self.name,
            job_id = %lease.job_id,
            attempt = lease.attempt,
            document = %lease.payload.document_ref,
            "Processing job"
        );

        let Some(result) = self.process_with_heartbeats(&lease).await else {
            return Ok(WorkOutcome::Abandoned);
        };
        self.report(&lease, result).await
    }

    async fn process_with_heartbeats(
        &self,
        lease: &Lease,
    ) -> Option<Result<ProcessingOutcome, ProcessingError>> {
        let guard = LeaseGuard {
            orchestrator: &self.orchestrator,
            lease,
        };
        let work = self.pipeline.process(&lease.payload, &guard);
        tokio::pin!(work);

        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                result = &mut work => return Some(result),
                _ = ticker.tick() => {
                    // Fails this attempt once it outlives the execution limit; the heartbeat
                    // below then sees a stale lease.
                    if let Err(error) = self.orchestrator.sweep().await {
                        tracing::warn!(job_id = %lease.job_id, error = %error, "Sweep failed");
                    }
                    match self.orchestrator.heartbeat(lease).await {
                        Ok(_) => tracing::debug!(job_id = %lease.job_id, "Heartbeat sent"),
                        Err(OrchestratorError::StaleLease { .. } | OrchestratorError::NotFound(_)) => {
                            tracing::warn!(
                                worker = %self.name,
                                job_id = %lease.job_id,
                                "Lease lost during processing; abandoning attempt"
                            );
                            return None;
                        }
                        Err(error) => {
                            tracing::warn!(job_id = %lease.job_id, error = %error, "Heartbeat failed");
                        }
                    }
                }
            }
        }
    }

    async fn report(
        &self,
        lease: &Lease,
        result: Result<ProcessingOutcome, ProcessingError>,
    ) -> Result<WorkOutcome, OrchestratorError> {
        let reported = match result {
            Ok(outcome) => self.orchestrator.complete(lease, outcome.into()).await,
            Err(ProcessingError::LeaseLost) => {
                tracing::warn!(job_id = %lease.job_id, "Results discarded after losing lease");
                return Ok(WorkOutcome::Abandoned);
            }
            Err(error) => {
                let report = FailureReport {
                    message: error.to_string(),
                    retriable: error.is_retriable(),
                };
                self.orchestrator.fail(lease, report).await
            }
        };

        match reported {
            Ok(status) => Ok(WorkOutcome::Reported(status)),
            // Another party already moved the job on; our attempt no longer counts.
            Err(OrchestratorError::StaleLease { .. }) => {
                tracing::warn!(job_id = %lease.job_id, "Report rejected as stale");
                Ok(WorkOutcome::Abandoned)
            }
            Err(error) => Err(error),
        }
    }
}
