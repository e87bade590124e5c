//! Durable job state behind optimistic concurrency.
//!
//! Every write is a compare-and-swap on [`Job::version`]: the store accepts a replacement only if
//! the stored version still equals the version the caller read, then bumps it. This is the
//! per-key atomicity that lets concurrent workers and the expiry sweep race safely.

use super::types::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// File name used by [`FileJobStore`] inside its data directory.
pub const JOBS_FILE: &str = "jobs.json";

/// Failures surfaced by a job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A job with this id already exists.
    #[error("job {0} already exists")]
    Duplicate(Uuid),
    /// Reading or writing durable state failed.
    #[error("job store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Durable state could not be encoded or decoded.
    #[error("job store data is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    /// I/O problems are transient; duplicates and corruption are not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Durable job table.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    /// Load one job.
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Load every job.
    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    /// Replace `job` if the stored version equals `job.version`; the stored copy gets
    /// `version + 1`. Returns `false` when another writer got there first.
    async fn compare_and_swap(&self, job: Job) -> Result<bool, StoreError>;

    /// Delete the listed jobs; returns how many existed.
    async fn remove(&self, ids: &[Uuid]) -> Result<usize, StoreError>;
}

/// `job` with its version bumped, if the stored copy still has `job.version`.
fn next_version(jobs: &HashMap<Uuid, Job>, mut job: Job) -> Option<Job> {
    match jobs.get(&job.id) {
        Some(current) if current.version == job.version => {
            job.version += 1;
            Some(job)
        }
        _ => None,
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }

    async fn compare_and_swap(&self, job: Job) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(next) = next_version(&jobs, job) else {
            return Ok(false);
        };
        jobs.insert(next.id, next);
        Ok(true)
    }

    async fn remove(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.lock().await;
        Ok(ids.iter().filter(|id| jobs.remove(id).is_some()).count())
    }
}

/// Store persisting the whole table to `jobs.json` after every write.
///
/// Writes go to a temporary file that is then renamed over the previous snapshot, so a crash
/// leaves either the old or the new table on disk. The in-memory copy only changes after the
/// rename succeeds; callers never observe a state that is not durable.
pub struct FileJobStore {
    path: PathBuf,
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl FileJobStore {
    /// Open (or create) the store in `data_dir`.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(JOBS_FILE);
        let jobs = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<Job> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|job| (job.id, job)).collect()
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(error) => return Err(error.into()),
        };
        tracing::info!(path = %path.display(), jobs = jobs.len(), "Opened job store");
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    async fn persist<'a>(&self, jobs: impl Iterator<Item = &'a Job>) -> Result<(), StoreError> {
        let mut list: Vec<&Job> = jobs.collect();
        list.sort_by_key(|job| (job.created_at, job.id));
        let bytes = serde_json::to_vec_pretty(&list)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        self.persist(jobs.values().chain(std::iter::once(&job)))
            .await?;
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }

    async fn compare_and_swap(&self, job: Job) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(next) = next_version(&jobs, job) else {
            return Ok(false);
        };
        self.persist(
            jobs.values()
                .map(|current| if current.id == next.id { &next } else { current }),
        )
        .await?;
        jobs.insert(next.id, next);
        Ok(true)
    }

    async fn remove(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let present = ids.iter().filter(|id| jobs.contains_key(id)).count();
        if present == 0 {
            return Ok(0);
        }
        self.persist(jobs.values().filter(|job| !ids.contains(&job.id)))
            .await?;
        for id in ids {
            jobs.remove(id);
        }
        Ok(present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobPayload, JobStatus};
    use time::OffsetDateTime;

    fn job() -> Job {
        Job::new(
            JobPayload {
                document_ref: "mem://doc".into(),
                chunk_size: 100,
                chunk_overlap: 10,
                confidence_threshold: 0.5,
                entity_types: Vec::new(),
                summarize: false,
            },
            OffsetDateTime::now_utc(),
        )
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemoryJobStore::new();
        let original = job();
        store.insert(original.clone()).await.unwrap();

        let mut first = original.clone();
        first.status = JobStatus::Running;
        assert!(store.compare_and_swap(first).await.unwrap());

        let mut second = original.clone();
        second.status = JobStatus::Cancelled;
        assert!(!store.compare_and_swap(second).await.unwrap());

        let stored = store.get(original.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let store = MemoryJobStore::new();
        let job = job();
        store.insert(job.clone()).await.unwrap();
        assert!(matches!(
            store.insert(job).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let job = job();
        {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            store.insert(job.clone()).await.unwrap();
            let mut running = job.clone();
            running.status = JobStatus::Running;
            assert!(store.compare_and_swap(running).await.unwrap());
        }

        let reopened = FileJobStore::open(dir.path()).await.unwrap();
        let stored = reopened.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.version, 1);
        assert!(!dir.path().join("jobs.json.tmp").exists());
    }

    #[tokio::test]
    async fn removed_jobs_stay_gone_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (kept, dropped) = (job(), job());
        {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            store.insert(kept.clone()).await.unwrap();
            store.insert(dropped.clone()).await.unwrap();
            assert_eq!(store.remove(&[dropped.id, Uuid::new_v4()]).await.unwrap(), 1);
            assert_eq!(store.remove(&[dropped.id]).await.unwrap(), 0);
        }

        let reopened = FileJobStore::open(dir.path()).await.unwrap();
        let ids: Vec<Uuid> = reopened.list().await.unwrap().iter().map(|job| job.id).collect();
        assert_eq!(ids, vec![kept.id]);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(JOBS_FILE), b"not json").unwrap();
        let error = FileJobStore::open(dir.path())
            .await
            .err()
            .expect("corrupt store");
        assert!(!error.is_retriable());
    }
}
