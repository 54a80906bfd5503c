use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use super::{InvalidTransition, Job, JobFilter, JobId, JobStatus};

/// Applied to a job while the store holds it, after the status change.
pub type JobUpdate = Box<dyn FnOnce(&mut Job) + Send>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no job with id {0}")]
    NotFound(JobId),
    #[error("job {0} already exists")]
    Duplicate(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Where jobs live. Status only ever changes through
/// [`JobStore::compare_and_set`], so two callers racing on one job cannot
/// both win.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    fn next_id(&self) -> JobId;

    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Option<Job>;

    async fn find(&self, external_id: &str) -> Option<Job>;

    /// Matching jobs, newest first.
    async fn list(&self, filter: &JobFilter) -> Vec<Job>;

    /// Move job `id` from `expected` to `to` and apply `update`, all under
    /// one lock. Fails without touching the job if it is not `expected`.
    async fn compare_and_set(
        &self,
        id: JobId,
        expected: JobStatus,
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    next: AtomicU64,
    jobs: Mutex<BTreeMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn next_id(&self) -> JobId {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(job.id()) {
            return Err(StoreError::Duplicate(*job.id()));
        }
        jobs.insert(*job.id(), job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().await.get(&id).cloned()
    }

    async fn find(&self, external_id: &str) -> Option<Job> {
        self.jobs
            .lock()
            .await
            .values()
            .find(|job| job.external_id() == external_id)
            .cloned()
    }

    async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        let matching = jobs
            .values()
            .rev()
            .filter(|job| filter.matches(job))
            .skip(filter.offset)
            .cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    async fn compare_and_set(
        &self,
        id: JobId,
        expected: JobStatus,
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if *job.status() != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: *job.status(),
            });
        }
        job.transition(to)?;
        update(job);
        Ok(job.clone())
    }
}
