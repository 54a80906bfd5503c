use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use super::store::{JobStore, StoreError};
use super::{InvalidTransition, Job, JobFilter, JobId, JobRequest, JobStatus};
use crate::inventory::{HostInventory, HostTarget};
use crate::log::*;
use crate::procedure::{ProcedureLibrary, ProcedureOutcome, ValidationError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("invalid parameters: {0}")]
    Validation(#[from] ValidationError),
    #[error("host `{0}` is not in the inventory")]
    UnknownHost(String),
    #[error("no job with id {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => JobError::NotFound(id),
            StoreError::Transition(err) => JobError::Transition(err),
            other => JobError::Store(other),
        }
    }
}

/// Accepts jobs, runs each one in its own task, and keeps the store current.
/// Cheap to clone; clones share everything.
#[derive(Debug, Clone)]
pub struct JobEngine {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    library: ProcedureLibrary,
    hosts: Arc<dyn HostInventory>,
    store: Arc<dyn JobStore>,
    host_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Woken whenever a job reaches a terminal state.
    settled: Notify,
}

impl JobEngine {
    pub fn new(
        library: ProcedureLibrary,
        hosts: Arc<dyn HostInventory>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                library,
                hosts,
                store,
                host_locks: Mutex::new(HashMap::new()),
                settled: Notify::new(),
            }),
        }
    }

    /// Validate and record a job as pending without dispatching it.
    #[tracing::instrument(skip(self, request), fields(host = %request.host(), kind = %request.kind()))]
    pub async fn enqueue(&self, request: JobRequest) -> Result<Job, JobError> {
        self.inner
            .library
            .validate(*request.kind(), request.params())?;
        if self.inner.hosts.resolve(request.host()).await.is_none() {
            return Err(JobError::UnknownHost(request.host().clone()));
        }

        let job = Job::new(self.inner.store.next_id(), &request);
        self.inner.store.insert(job.clone()).await?;
        info!("job {} ({}) pending", job.id(), job.external_id());
        Ok(job)
    }

    /// Enqueue a job and dispatch it in the background. Returns as soon as
    /// the job is recorded.
    pub async fn submit(&self, request: JobRequest) -> Result<Job, JobError> {
        let job = self.enqueue(request).await?;
        let engine = self.clone();
        let id = *job.id();
        tokio::spawn(async move {
            if let Err(err) = engine.dispatch(id).await {
                debug!("job {} not dispatched: {}", id, err);
            }
        });
        Ok(job)
    }

    /// Run a pending job to completion. Only the first caller for a given
    /// job gets past the pending -> running swap; the others get
    /// [`JobError::Store`] back.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch(&self, id: JobId) -> Result<Job, JobError> {
        let store = &self.inner.store;
        let job = store
            .compare_and_set(id, JobStatus::Pending, JobStatus::Running, Box::new(|_| {}))
            .await?;
        info!("job {} ({}) running on {}", id, job.external_id(), job.host());

        let outcome = self.execute(&job).await;
        let status = if *outcome.success() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let finished = store
            .compare_and_set(
                id,
                JobStatus::Running,
                status,
                Box::new(move |job| job.record(outcome)),
            )
            .await;
        self.inner.settled.notify_waiters();

        let finished = finished?;
        info!("job {} {}", id, finished.status());
        Ok(finished)
    }

    async fn execute(&self, job: &Job) -> ProcedureOutcome {
        let host = job.host().clone();
        let Some(target) = self.inner.hosts.resolve(&host).await else {
            return ProcedureOutcome::internal(
                format!("host `{host}` is not in the inventory"),
                *job.is_dry_run(),
            );
        };

        if !self.inner.library.config().engine.serialize_per_host {
            return self.run_procedure(job, target).await;
        }

        let lock = {
            let mut locks = self.inner.host_locks.lock().await;
            locks.entry(host.clone()).or_default().clone()
        };
        if lock.try_lock().is_err() {
            debug!("waiting for another job on {}", host);
        }
        let guard = lock.clone().lock_owned().await;
        let outcome = self.run_procedure(job, target).await;
        drop(guard);
        drop(lock);
        self.release_host_lock(&host).await;
        outcome
    }

    /// Forget a host's lock once no job holds or waits for it.
    async fn release_host_lock(&self, host: &str) {
        let mut locks = self.inner.host_locks.lock().await;
        if locks.get(host).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(host);
        }
    }

    async fn run_procedure(&self, job: &Job, target: HostTarget) -> ProcedureOutcome {
        let host = job.host().clone();
        let library = self.inner.library.clone();
        let kind = *job.kind();
        let params = job.params().clone();
        let is_dry_run = *job.is_dry_run();
        let task_host = host.clone();
        let handle = tokio::spawn(async move {
            library
                .run(kind, &task_host, &target, &params, is_dry_run)
                .await
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                let reason = if err.is_panic() {
                    format!("procedure panicked: {}", panic_message(err.into_panic()))
                } else {
                    format!("procedure task failed: {err}")
                };
                error!("job {} on {}: {}", job.id(), host, reason);
                ProcedureOutcome::internal(reason, is_dry_run)
            }
        }
    }

    /// Cancel a job that has not started yet.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        let result = self
            .inner
            .store
            .compare_and_set(id, JobStatus::Pending, JobStatus::Cancelled, Box::new(|_| {}))
            .await;
        match result {
            Ok(job) => {
                self.inner.settled.notify_waiters();
                info!("job {} cancelled", id);
                Ok(job)
            }
            Err(StoreError::Conflict { actual, .. }) => Err(JobError::Transition(InvalidTransition {
                id,
                from: actual,
                to: JobStatus::Cancelled,
            })),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.inner.store.get(id).await
    }

    pub async fn find(&self, external_id: &str) -> Option<Job> {
        self.inner.store.find(external_id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.inner.store.list(filter).await
    }

    /// Wait until the job is completed, failed or cancelled.
    pub async fn wait(&self, id: JobId) -> Result<Job, JobError> {
        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let job = self.get(id).await.ok_or(JobError::NotFound(id))?;
            if job.status().is_terminal() {
                return Ok(job);
            }
            settled.await;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
