use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use super::params::ValidationError;
use crate::audit::StepRecord;
use crate::executor::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
    /// Never contacted, e.g. because validation failed first.
    Unknown,
}

/// Why a procedure did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Validation,
    Offline,
    Step,
    Timeout,
    Transport,
    Internal,
}

/// Result of one procedure run against one host.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureOutcome {
    success: bool,
    skipped: bool,
    message: String,
    is_dry_run: bool,
    host_status: HostStatus,
    failure: Option<FailureKind>,
    /// Every command attempted or planned, masked, in order.
    commands: Vec<String>,
    steps: Vec<StepRecord>,
    warnings: Vec<String>,
    stdout: String,
    stderr: String,
    return_code: i32,
}

impl ProcedureOutcome {
    pub fn invalid(err: &ValidationError, is_dry_run: bool) -> Self {
        Self::failed(
            FailureKind::Validation,
            HostStatus::Unknown,
            format!("invalid parameters: {err}"),
            is_dry_run,
        )
    }

    pub fn offline(err: &ConnectionError, is_dry_run: bool) -> Self {
        let kind = if *err.timed_out() {
            FailureKind::Timeout
        } else {
            FailureKind::Offline
        };
        Self::failed(kind, HostStatus::Offline, err.to_string(), is_dry_run)
    }

    pub fn internal<S: Into<String>>(message: S, is_dry_run: bool) -> Self {
        Self::failed(
            FailureKind::Internal,
            HostStatus::Unknown,
            message.into(),
            is_dry_run,
        )
    }

    fn failed(failure: FailureKind, host_status: HostStatus, message: String, is_dry_run: bool) -> Self {
        Self {
            success: false,
            skipped: false,
            stderr: message.clone(),
            message,
            is_dry_run,
            host_status,
            failure: Some(failure),
            commands: vec![],
            steps: vec![],
            warnings: vec![],
            stdout: String::new(),
            return_code: -1,
        }
    }

    /// Error text of each failed step, in order.
    pub fn step_errors(&self) -> Vec<&str> {
        self.steps.iter().filter_map(|s| s.error().as_deref()).collect()
    }
}

/// Builder used by [`super::step::StepContext`] to assemble an outcome.
#[derive(Debug)]
pub(crate) struct OutcomeParts {
    pub success: bool,
    pub skipped: bool,
    pub message: String,
    pub is_dry_run: bool,
    pub failure: Option<FailureKind>,
    pub steps: Vec<StepRecord>,
    pub warnings: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

impl From<OutcomeParts> for ProcedureOutcome {
    fn from(parts: OutcomeParts) -> Self {
        Self {
            success: parts.success,
            skipped: parts.skipped,
            message: parts.message,
            is_dry_run: parts.is_dry_run,
            host_status: HostStatus::Online,
            failure: parts.failure,
            commands: parts.steps.iter().map(|s| s.command().clone()).collect(),
            steps: parts.steps,
            warnings: parts.warnings,
            stdout: parts.stdout,
            stderr: parts.stderr,
            return_code: parts.return_code,
        }
    }
}
