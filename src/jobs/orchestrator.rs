//! Job orchestrator: submission, leasing, reporting, cancellation, and the expiry sweep.
//!
//! All state lives in a [`JobStore`]; every transition is a versioned compare-and-swap that
//! completes (durably, for the file store) before the call returns. Lifecycle:
//!
//! - `Pending`/`Retrying` → `Running` when a worker leases the job. The attempt counter is
//!   incremented at this point and a fresh lease token is issued.
//! - `Running` → `Succeeded` on [`Orchestrator::complete`].
//! - `Running` → `Retrying` on a retriable [`Orchestrator::fail`] with budget left; the job becomes
//!   dispatchable again after `min(base × 2^attempt, max)`.
//! - `Running` → `DeadLettered` on a failure once `attempt == max_attempts`.
//! - `Running` → `Failed` on a non-retriable failure, or when the sweep finds the attempt older
//!   than the hard execution limit.
//! - `Running` → `Pending` when the sweep finds the lease's visibility deadline passed.
//! - Any non-terminal state → `Cancelled` through [`Orchestrator::cancel`]; a running job is
//!   cancelled when its worker next reports.

use super::clock::Clock;
use super::store::{JobStore, StoreError};
use super::types::{
    AttemptResult, Job, JobPayload, JobResult, JobSnapshot, JobStatus, Lease, LeaseState,
};
use crate::metrics::PipelineMetrics;
use crate::processing::chunking::validate_params;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

const MAX_CAS_RETRIES: usize = 16;

/// Retry and timing policy.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Attempts allowed before dead-lettering.
    pub max_attempts: u32,
    /// Lease visibility timeout.
    pub visibility_timeout: Duration,
    /// Hard wall-clock limit for one attempt.
    pub execution_limit: Duration,
    /// Backoff base delay.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(60),
            execution_limit: Duration::from_secs(600),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl OrchestratorSettings {
    /// Delay before the job that just failed its `attempt`-th dispatch becomes available.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No job with this id.
    #[error("job {0} not found")]
    NotFound(Uuid),
    /// Payload failed validation; nothing was stored.
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    /// Caller does not hold the job's current lease.
    #[error("stale lease for job {job_id}")]
    StaleLease {
        /// Job the lease referred to.
        job_id: Uuid,
    },
    /// Requested transition is not legal from the job's current state.
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Job id.
        job_id: Uuid,
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },
    /// Concurrent writers kept winning the compare-and-swap.
    #[error("job {0} is under heavy contention; try again")]
    Contention(Uuid),
    /// Job store failed.
    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

/// What the worker learns when checking its lease before persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseCheck {
    /// Lease is current; results may be persisted.
    Valid,
    /// Lease is current but the job was cancelled; results must be discarded.
    CancelRequested,
}

/// Failure reported by a worker.
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// Error description recorded on the job.
    pub message: String,
    /// Whether the failure is transient.
    pub retriable: bool,
}

/// Counts of jobs moved by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired leases returned to `Pending`.
    pub requeued: usize,
    /// Expired leases whose budget was spent.
    pub dead_lettered: usize,
    /// Attempts that exceeded the execution limit.
    pub timed_out: usize,
    /// Expired leases of cancel-requested jobs.
    pub cancelled: usize,
}

/// Finished jobs removed by [`Orchestrator::purge_finished`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Number of jobs deleted.
    pub removed: usize,
    /// Document references those jobs pointed at, deduplicated.
    pub document_refs: Vec<String>,
}

/// Accepts jobs, hands out leases, and records every transition.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
    metrics: Arc<PipelineMetrics>,
}

impl Orchestrator {
    /// Orchestrator over `store`, using `clock` for every time decision.
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            metrics,
        }
    }

    /// Retry and timing policy in effect.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Validate and persist a new job.
    pub async fn submit(&self, payload: JobPayload) -> Result<Uuid, OrchestratorError> {
        validate_params(payload.chunk_size, payload.chunk_overlap)
            .map_err(|error| OrchestratorError::InvalidPayload(error.to_string()))?;
        if !(0.0..=1.0).contains(&payload.confidence_threshold) {
            return Err(OrchestratorError::InvalidPayload(format!(
                "confidence threshold {} is outside [0, 1]",
                payload.confidence_threshold
            )));
        }
        if payload.document_ref.trim().is_empty() {
            return Err(OrchestratorError::InvalidPayload(
                "document reference is empty".into(),
            ));
        }

        let job = Job::new(payload, self.clock.now());
        let id = job.id;
        self.store.insert(job).await?;
        tracing::info!(job_id = %id, "Job submitted");
        Ok(id)
    }

    /// Latest durable state of a job.
    pub async fn get_status(&self, id: Uuid) -> Result<JobSnapshot, OrchestratorError> {
        self.store
            .get(id)
            .await?
            .map(|job| JobSnapshot::from(&job))
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Jobs, optionally restricted to one status, oldest first.
    pub async fn list(
        &self,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobSnapshot>, OrchestratorError> {
        let mut jobs = self.store.list().await?;
        jobs.retain(|job| status.is_none_or(|wanted| job.status == wanted));
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs.iter().map(JobSnapshot::from).collect())
    }

    /// Lease the next dispatchable job, if any.
    ///
    /// Dispatchable: `Pending`, or `Retrying` past its backoff, with attempts left and no
    /// cancellation pending. Oldest availability wins.
    pub async fn lease(&self) -> Result<Option<Lease>, OrchestratorError> {
        let now = self.clock.now();
        let mut candidates: Vec<Job> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|job| self.is_dispatchable(job, now))
            .collect();
        candidates.sort_by_key(|job| (job.available_at, job.created_at, job.id));

        for mut job in candidates {
            let token = Uuid::new_v4();
            job.attempt += 1;
            if !job.transition(JobStatus::Running, now) {
                continue;
            }
            let expires_at = now + self.settings.visibility_timeout;
            job.lease = Some(LeaseState {
                token,
                started_at: now,
                expires_at,
            });
            let (job_id, attempt) = (job.id, job.attempt);
            let payload = job.payload.clone();
            if self.store.compare_and_swap(job).await? {
                tracing::info!(job_id = %job_id, attempt, "Lease granted");
                return Ok(Some(Lease {
                    job_id,
                    payload,
                    token,
                    attempt,
                    expires_at,
                }));
            }
            tracing::debug!(job_id = %job_id, "Lost lease race; trying next job");
        }
        Ok(None)
    }

    fn is_dispatchable(&self, job: &Job, now: OffsetDateTime) -> bool {
        matches!(job.status, JobStatus::Pending | JobStatus::Retrying)
            && job.available_at <= now
            && job.attempt < self.settings.max_attempts
            && !job.cancel_requested
    }

    /// Extend the lease's visibility deadline.
    pub async fn heartbeat(&self, lease: &Lease) -> Result<Lease, OrchestratorError> {
        let expires_at = self.clock.now() + self.settings.visibility_timeout;
        self.update(lease.job_id, |job| {
            let state = owned_lease(job, lease)?;
            state.expires_at = expires_at;
            Ok(())
        })
        .await?;
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    /// Confirm the lease is still held, reporting a pending cancellation.
    pub async fn verify_lease(&self, lease: &Lease) -> Result<LeaseCheck, OrchestratorError> {
        let mut job = self
            .store
            .get(lease.job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(lease.job_id))?;
        owned_lease(&mut job, lease)?;
        Ok(if job.cancel_requested {
            LeaseCheck::CancelRequested
        } else {
            LeaseCheck::Valid
        })
    }

    /// Record success. A cancel-requested job becomes `Cancelled` instead.
    pub async fn complete(
        &self,
        lease: &Lease,
        result: JobResult,
    ) -> Result<JobStatus, OrchestratorError> {
        let now = self.clock.now();
        let job = self
            .update(lease.job_id, |job| {
                owned_lease(job, lease)?;
                if job.cancel_requested {
                    job.record_attempt(AttemptResult::Cancelled, now);
                    job.transition(JobStatus::Cancelled, now);
                } else {
                    job.record_attempt(AttemptResult::Succeeded, now);
                    job.transition(JobStatus::Succeeded, now);
                    job.result = Some(result.clone());
                    job.error = None;
                }
                Ok(())
            })
            .await?;

        self.observe_terminal(&job);
        tracing::info!(job_id = %job.id, status = %job.status, attempt = job.attempt, "Job completed");
        Ok(job.status)
    }

    /// Record a failure and decide between retry, dead-letter, and terminal failure.
    pub async fn fail(
        &self,
        lease: &Lease,
        report: FailureReport,
    ) -> Result<JobStatus, OrchestratorError> {
        let now = self.clock.now();
        let settings = &self.settings;
        let job = self
            .update(lease.job_id, |job| {
                owned_lease(job, lease)?;
                job.error = Some(report.message.clone());
                if job.cancel_requested {
                    job.record_attempt(AttemptResult::Cancelled, now);
                    job.transition(JobStatus::Cancelled, now);
                    return Ok(());
                }
                job.record_attempt(
                    AttemptResult::Failed {
                        error: report.message.clone(),
                        retriable: report.retriable,
                    },
                    now,
                );
                if !report.retriable {
                    job.transition(JobStatus::Failed, now);
                } else if job.attempt >= settings.max_attempts {
                    job.transition(JobStatus::DeadLettered, now);
                } else {
                    job.transition(JobStatus::Retrying, now);
                    job.available_at = now + settings.backoff(job.attempt);
                }
                Ok(())
            })
            .await?;

        self.observe_terminal(&job);
        tracing::warn!(
            job_id = %job.id,
            status = %job.status,
            attempt = job.attempt,
            retriable = report.retriable,
            error = %report.message,
            "Job attempt failed"
        );
        Ok(job.status)
    }

    /// Cancel a job. Returns `false` if it was already terminal.
    ///
    /// Pending and retrying jobs are cancelled immediately; a running job is flagged and
    /// cancelled when its worker reports.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, OrchestratorError> {
        let now = self.clock.now();
        let mut accepted = false;
        let job = self
            .update(id, |job| {
                accepted = false;
                match job.status {
                    JobStatus::Pending | JobStatus::Retrying => {
                        job.transition(JobStatus::Cancelled, now);
                        accepted = true;
                    }
                    JobStatus::Running => {
                        job.cancel_requested = true;
                        job.updated_at = now;
                        accepted = true;
                    }
                    _ => {}
                }
                Ok(())
            })
            .await?;
        if job.status == JobStatus::Cancelled && accepted {
            self.metrics.record_job_cancelled();
        }
        tracing::info!(job_id = %id, status = %job.status, accepted, "Cancellation requested");
        Ok(accepted)
    }

    /// Return a dead-lettered job to `Pending` with a fresh attempt budget.
    pub async fn requeue_dead_letter(&self, id: Uuid) -> Result<JobSnapshot, OrchestratorError> {
        let now = self.clock.now();
        let job = self
            .update(id, |job| {
                if job.status != JobStatus::DeadLettered || !job.transition(JobStatus::Pending, now)
                {
                    return Err(OrchestratorError::InvalidTransition {
                        job_id: job.id,
                        from: job.status,
                        to: JobStatus::Pending,
                    });
                }
                job.attempt = 0;
                job.available_at = now;
                job.error = None;
                Ok(())
            })
            .await?;
        tracing::info!(job_id = %id, "Dead-lettered job requeued");
        Ok(JobSnapshot::from(&job))
    }

    /// Reclaim abandoned and stuck leases.
    ///
    /// The execution limit is checked first: an attempt running longer than it fails the job
    /// outright. Otherwise an expired lease returns the job to `Pending`, or dead-letters it when
    /// no attempts remain.
    pub async fn sweep(&self) -> Result<SweepReport, OrchestratorError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for job in self.store.list().await? {
            if job.status != JobStatus::Running {
                continue;
            }
            let Some(lease) = job.lease.clone() else {
                continue;
            };
            let timed_out = lease.started_at + self.settings.execution_limit <= now;
            let expired = lease.expires_at <= now;
            if !timed_out && !expired {
                continue;
            }

            let mut updated = job.clone();
            let next = if timed_out {
                updated.record_attempt(AttemptResult::TimedOut, now);
                updated.error = Some(format!(
                    "attempt {} exceeded the execution limit of {:?}",
                    updated.attempt, self.settings.execution_limit
                ));
                JobStatus::Failed
            } else {
                updated.record_attempt(AttemptResult::Expired, now);
                if updated.cancel_requested {
                    JobStatus::Cancelled
                } else if updated.attempt >= self.settings.max_attempts {
                    updated.error = Some(format!(
                        "lease expired on final attempt {}",
                        updated.attempt
                    ));
                    JobStatus::DeadLettered
                } else {
                    updated.available_at = now;
                    JobStatus::Pending
                }
            };
            updated.transition(next, now);

            // A losing swap means the holder reported first; leave the job alone.
            if !self.store.compare_and_swap(updated.clone()).await? {
                continue;
            }
            match next {
                JobStatus::Failed => report.timed_out += 1,
                JobStatus::DeadLettered => report.dead_lettered += 1,
                JobStatus::Cancelled => report.cancelled += 1,
                _ => report.requeued += 1,
            }
            self.observe_terminal(&updated);
            tracing::warn!(
                job_id = %updated.id,
                attempt = updated.attempt,
                status = %next,
                "Reclaimed lease"
            );
        }
        Ok(report)
    }

    /// Delete succeeded, failed and cancelled jobs whose last transition is older than
    /// `retention`. Dead-lettered jobs stay until an operator requeues them.
    pub async fn purge_finished(
        &self,
        retention: Duration,
    ) -> Result<PurgeReport, OrchestratorError> {
        let cutoff = self.clock.now() - retention;
        let expired: Vec<Job> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|job| {
                matches!(
                    job.status,
                    JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
                ) && job.updated_at <= cutoff
            })
            .collect();
        if expired.is_empty() {
            return Ok(PurgeReport::default());
        }

        let ids: Vec<Uuid> = expired.iter().map(|job| job.id).collect();
        let removed = self.store.remove(&ids).await?;
        let mut document_refs: Vec<String> = expired
            .into_iter()
            .map(|job| job.payload.document_ref)
            .collect();
        document_refs.sort();
        document_refs.dedup();
        tracing::info!(removed, ?retention, "Purged finished jobs");
        Ok(PurgeReport {
            removed,
            document_refs,
        })
    }

    fn observe_terminal(&self, job: &Job) {
        match job.status {
            JobStatus::Succeeded => self.metrics.record_job_succeeded(),
            JobStatus::Failed => self.metrics.record_job_failed(),
            JobStatus::DeadLettered => self.metrics.record_job_dead_lettered(),
            JobStatus::Cancelled => self.metrics.record_job_cancelled(),
            _ => {}
        }
    }

    async fn update<F>(&self, id: Uuid, mut apply: F) -> Result<Job, OrchestratorError>
    where
        F: FnMut(&mut Job) -> Result<(), OrchestratorError>,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let mut job = self
                .store
                .get(id)
                .await?
                .ok_or(OrchestratorError::NotFound(id))?;
            apply(&mut job)?;
            if self.store.compare_and_swap(job.clone()).await? {
                job.version += 1;
                return Ok(job);
            }
        }
        Err(OrchestratorError::Contention(id))
    }
}

fn owned_lease<'a>(
    job: &'a mut Job,
    lease: &Lease,
) -> Result<&'a mut LeaseState, OrchestratorError> {
    let stale = OrchestratorError::StaleLease { job_id: lease.job_id };
    if job.status != JobStatus::Running {
        return Err(stale);
    }
    match job.lease.as_mut() {
        Some(state) if state.token == lease.token => Ok(state),
        _ => Err(stale),
    }
}
