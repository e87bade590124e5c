//! Job records and the status state machine.

use crate::processing::ProcessingOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Leased by a worker.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Failed without retry: non-retriable error or execution limit exceeded.
    Failed,
    /// Waiting out a backoff before the next attempt.
    Retrying,
    /// Attempt budget exhausted; needs operator intervention.
    DeadLettered,
    /// Cancelled by a caller.
    Cancelled,
}

impl JobStatus {
    /// Terminal states accept no further transitions except an operator requeue of
    /// `DeadLettered`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::DeadLettered | Self::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Retrying, Running)
                | (Retrying, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, DeadLettered)
                | (Running, Pending)
                | (Running, Cancelled)
                | (DeadLettered, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "dead_lettered" | "deadlettered" => Ok(Self::DeadLettered),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

/// Processing parameters submitted with a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// File path or `mem://` reference of the document.
    pub document_ref: String,
    /// Maximum chunk length, in characters.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks.
    pub chunk_overlap: usize,
    /// Entities below this confidence are dropped.
    pub confidence_threshold: f32,
    /// Entity types to keep; empty keeps all.
    #[serde(default)]
    pub entity_types: Vec<String>,
    /// Whether to store a document summary after indexing.
    #[serde(default)]
    pub summarize: bool,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptResult {
    /// Worker completed the job.
    Succeeded,
    /// Worker reported an error.
    Failed {
        /// Error description.
        error: String,
        /// Whether the error was classified as transient.
        retriable: bool,
    },
    /// Lease visibility timeout elapsed without a report.
    Expired,
    /// Hard execution limit exceeded.
    TimedOut,
    /// Cancelled while running.
    Cancelled,
}

/// History entry for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// One-based attempt number.
    pub attempt: u32,
    /// When the lease was granted.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// When the attempt ended.
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    /// Outcome.
    pub result: AttemptResult,
}

/// Lease currently held on a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseState {
    /// Token the holder must present.
    pub token: Uuid,
    /// When the current attempt started.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Visibility deadline; extended by heartbeats.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Result reference stored on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Indexed document.
    pub document_id: String,
    /// Chunks written.
    pub chunk_count: usize,
    /// Entities written.
    pub entity_count: usize,
    /// Whether a summary was stored.
    pub summarized: bool,
}

impl From<ProcessingOutcome> for JobResult {
    fn from(outcome: ProcessingOutcome) -> Self {
        Self {
            document_id: outcome.document_id,
            chunk_count: outcome.chunk_count,
            entity_count: outcome.entity_count,
            summarized: outcome.summary.is_some(),
        }
    }
}

/// Durable job record. Mutated only through the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: Uuid,
    /// Current status.
    pub status: JobStatus,
    /// Dispatches so far.
    pub attempt: u32,
    /// Submitted parameters.
    pub payload: JobPayload,
    /// Creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last transition time.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Earliest time the job may be leased.
    #[serde(with = "time::serde::rfc3339")]
    pub available_at: OffsetDateTime,
    /// Active lease while `Running`.
    pub lease: Option<LeaseState>,
    /// Set when a running job is asked to stop.
    pub cancel_requested: bool,
    /// Result reference on success.
    pub result: Option<JobResult>,
    /// Last error detail.
    pub error: Option<String>,
    /// One entry per finished attempt.
    pub history: Vec<AttemptRecord>,
    /// Optimistic-concurrency counter bumped by every store write.
    pub version: u64,
}

impl Job {
    /// New pending job.
    pub fn new(payload: JobPayload, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            attempt: 0,
            payload,
            created_at: now,
            updated_at: now,
            available_at: now,
            lease: None,
            cancel_requested: false,
            result: None,
            error: None,
            history: Vec::new(),
            version: 0,
        }
    }

    /// Move to `next`, returning `false` (and changing nothing) if illegal.
    pub(crate) fn transition(&mut self, next: JobStatus, now: OffsetDateTime) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        if next != JobStatus::Running {
            self.lease = None;
        }
        true
    }

    /// Close the current attempt with `result`.
    pub(crate) fn record_attempt(&mut self, result: AttemptResult, now: OffsetDateTime) {
        let started_at = self
            .lease
            .as_ref()
            .map_or(self.updated_at, |lease| lease.started_at);
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            result,
        });
    }
}

/// Caller-facing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job id.
    pub id: Uuid,
    /// Current status.
    pub status: JobStatus,
    /// Dispatches so far.
    pub attempt: u32,
    /// Submitted document reference.
    pub document_ref: String,
    /// Whether cancellation is pending on a running job.
    pub cancel_requested: bool,
    /// Result reference on success.
    pub result: Option<JobResult>,
    /// Last error detail.
    pub error: Option<String>,
    /// Attempt history.
    pub history: Vec<AttemptRecord>,
    /// Creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last transition time.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            attempt: job.attempt,
            document_ref: job.payload.document_ref.clone(),
            cancel_requested: job.cancel_requested,
            result: job.result.clone(),
            error: job.error.clone(),
            history: job.history.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Proof of ownership handed to the worker that leased a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// Leased job.
    pub job_id: Uuid,
    /// Parameters to process.
    pub payload: JobPayload,
    /// Ownership token.
    pub token: Uuid,
    /// Attempt number this lease represents.
    pub attempt: u32,
    /// Visibility deadline at grant or last heartbeat.
    pub expires_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_only_allow_dead_letter_requeue() {
        for status in [
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(JobStatus::Pending));
            assert!(!status.can_transition_to(JobStatus::Running));
        }
        assert!(JobStatus::DeadLettered.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::DeadLettered.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn running_is_only_reached_by_lease() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Retrying.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Retrying.can_transition_to(JobStatus::DeadLettered));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Retrying,
            JobStatus::DeadLettered,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse(), Ok(status));
        }
    }
}
