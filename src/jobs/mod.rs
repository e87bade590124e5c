//! Asynchronous job orchestration: durable job state, leases, retries, and workers.

pub mod clock;
mod orchestrator;
pub mod store;
mod types;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use orchestrator::{
    FailureReport, LeaseCheck, Orchestrator, OrchestratorError, OrchestratorSettings, PurgeReport,
    SweepReport,
};
pub use store::{FileJobStore, JobStore, MemoryJobStore, StoreError};
pub use types::{
    AttemptRecord, AttemptResult, Job, JobPayload, JobResult, JobSnapshot, JobStatus, Lease,
    LeaseState,
};
pub use worker::{WorkOutcome, Worker, WorkerSettings};
