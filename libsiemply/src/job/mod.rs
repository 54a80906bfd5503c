//! Jobs: one procedure against one host, tracked from submission to a
//! terminal state.
//!
//! ```text
//! pending -> running -> completed
//!                    -> failed
//! pending -> cancelled
//! ```
//!
//! Any other transition is refused with [`InvalidTransition`] and leaves the
//! job untouched.

use std::fmt;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::log::redact;
use crate::procedure::{dry_run_flag, ProcedureKind, ProcedureOutcome};

pub mod engine;
pub mod store;

pub use engine::{JobEngine, JobError};
pub use store::{JobStore, MemoryJobStore, StoreError};

pub type JobId = u64;

/// Parameter names whose values are never shown.
const SECRET_PARAMS: &[&str] = &["admin_password", "auth_token", "password"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_become(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("job {id} cannot go from {from} to {to}")]
pub struct InvalidTransition {
    pub id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// What a caller asks for.
#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    host: String,
    kind: ProcedureKind,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    is_dry_run: bool,
}

impl JobRequest {
    pub fn new<S: Into<String>>(host: S, kind: ProcedureKind, params: Value) -> Self {
        Self {
            host: host.into(),
            kind,
            params,
            is_dry_run: false,
        }
    }

    pub fn dry_run(mut self, is_dry_run: bool) -> Self {
        self.is_dry_run = is_dry_run;
        self
    }
}

#[derive(Getters, Clone, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    external_id: String,
    host: String,
    kind: ProcedureKind,
    params: Value,
    is_dry_run: bool,
    status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    submitted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    completed_at: Option<OffsetDateTime>,
    stdout: String,
    stderr: String,
    return_code: Option<i32>,
    result: Option<ProcedureOutcome>,
}

impl Job {
    pub fn new(id: JobId, request: &JobRequest) -> Self {
        Self {
            id,
            external_id: format!("{}-{}", request.kind, nanoid::nanoid!()),
            host: request.host.clone(),
            kind: request.kind,
            is_dry_run: request.is_dry_run || dry_run_flag(&request.params),
            params: request.params.clone(),
            status: JobStatus::Pending,
            submitted_at: OffsetDateTime::now_utc(),
            started_at: None,
            completed_at: None,
            stdout: String::new(),
            stderr: String::new(),
            return_code: None,
            result: None,
        }
    }

    /// Move to `to`, stamping start and completion times.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_become(to) {
            return Err(InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        let now = OffsetDateTime::now_utc();
        if to == JobStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = to;
        Ok(())
    }

    /// Copy a procedure's output onto the job.
    pub fn record(&mut self, outcome: ProcedureOutcome) {
        self.stdout = outcome.stdout().clone();
        self.stderr = outcome.stderr().clone();
        self.return_code = Some(*outcome.return_code());
        self.result = Some(outcome);
    }

    /// Parameters with secret values redacted, for display.
    pub fn redacted_params(&self) -> Value {
        let mut params = self.params.clone();
        if let Value::Object(map) = &mut params {
            for (key, value) in map.iter_mut() {
                if let Value::String(secret) = value {
                    if SECRET_PARAMS.contains(&key.as_str()) {
                        *secret = redact(secret);
                    }
                }
            }
        }
        params
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("external_id", &self.external_id)
            .field("host", &self.host)
            .field("kind", &self.kind)
            .field("params", &self.redacted_params())
            .field("is_dry_run", &self.is_dry_run)
            .field("status", &self.status)
            .field("submitted_at", &self.submitted_at)
            .field("started_at", &self.started_at)
            .field("completed_at", &self.completed_at)
            .field("return_code", &self.return_code)
            .finish_non_exhaustive()
    }
}

/// Which jobs [`JobStore::list`] returns. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub host: Option<String>,
    pub kind: Option<ProcedureKind>,
    pub status: Option<JobStatus>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.host.as_ref().map_or(true, |h| *h == job.host)
            && self.kind.map_or(true, |k| k == job.kind)
            && self.status.map_or(true, |s| s == job.status)
    }
}
