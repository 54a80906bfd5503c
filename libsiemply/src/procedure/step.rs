use std::time::Duration;

use thiserror::Error;

use super::outcome::{FailureKind, OutcomeParts, ProcedureOutcome};
use crate::audit::{StepEvent, StepRecord, StepSink};
use crate::executor::{CommandError, CommandResult, CommandRunner, Session};
use crate::log::*;
use crate::shell::ShellCommand;

pub const EXISTENCE_CHECK: &str = "existence-check";

/// Why a procedure stopped early.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    #[error("{step} failed with exit code {exit_code}: {detail}")]
    Step {
        step: String,
        exit_code: i32,
        detail: String,
        stdout: String,
        stderr: String,
    },
    #[error("{step} timed out after {after:?}")]
    Timeout { step: String, after: Duration },
    #[error("{step}: connection lost: {cause}")]
    Transport { step: String, cause: String },
    #[error("{step}: {message}")]
    Failed { step: String, message: String },
}

impl Halt {
    pub fn failed<S: Into<String>, M: Into<String>>(step: S, message: M) -> Self {
        Halt::Failed {
            step: step.into(),
            message: message.into(),
        }
    }

    fn kind(&self) -> FailureKind {
        match self {
            Halt::Step { .. } | Halt::Failed { .. } => FailureKind::Step,
            Halt::Timeout { .. } => FailureKind::Timeout,
            Halt::Transport { .. } => FailureKind::Transport,
        }
    }
}

/// How a procedure that did not halt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finish {
    message: String,
    skipped: bool,
}

impl Finish {
    pub fn done<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            skipped: false,
        }
    }

    pub fn skipped<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            skipped: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Read-only; executes even in a dry run. Non-zero exits are returned.
    Probe,
    /// Mutating; a non-zero exit halts the procedure.
    Run,
    /// Mutating; non-zero exits and timeouts are returned for the caller
    /// to judge.
    Attempt,
}

/// Everything one procedure run needs to issue commands: the session, the
/// audit sink and the trace being built.
pub struct StepContext<'a> {
    session: &'a mut dyn Session,
    sink: &'a dyn StepSink,
    runner: CommandRunner,
    host: String,
    dry_run: bool,
    timeout: Duration,
    steps: Vec<StepRecord>,
    warnings: Vec<String>,
    captured: Option<CommandResult>,
}

impl<'a> StepContext<'a> {
    pub fn new<S: Into<String>>(
        session: &'a mut dyn Session,
        sink: &'a dyn StepSink,
        host: S,
        dry_run: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            session,
            sink,
            runner: CommandRunner,
            host: host.into(),
            dry_run,
            timeout,
            steps: vec![],
            warnings: vec![],
            captured: None,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub async fn probe(&mut self, name: &str, command: &ShellCommand) -> Result<CommandResult, Halt> {
        self.exec(name, command, self.timeout, Mode::Probe).await
    }

    pub async fn run(&mut self, name: &str, command: &ShellCommand) -> Result<CommandResult, Halt> {
        self.exec(name, command, self.timeout, Mode::Run).await
    }

    pub async fn run_for(
        &mut self,
        name: &str,
        command: &ShellCommand,
        timeout: Duration,
    ) -> Result<CommandResult, Halt> {
        self.exec(name, command, timeout, Mode::Run).await
    }

    pub async fn attempt(&mut self, name: &str, command: &ShellCommand) -> Result<CommandResult, Halt> {
        self.exec(name, command, self.timeout, Mode::Attempt).await
    }

    pub async fn attempt_for(
        &mut self,
        name: &str,
        command: &ShellCommand,
        timeout: Duration,
    ) -> Result<CommandResult, Halt> {
        self.exec(name, command, timeout, Mode::Attempt).await
    }

    /// Run a step whose failure is only worth a warning.
    pub async fn tolerate(&mut self, name: &str, command: &ShellCommand) -> Result<(), Halt> {
        let result = self.attempt(name, command).await?;
        if !result.success() {
            self.warn(format!("{name} failed: {}", describe(&result)));
        }
        Ok(())
    }

    pub fn warn<S: Into<String>>(&mut self, warning: S) {
        let warning = warning.into();
        warn!("[{}] {}", self.host, warning);
        self.warnings.push(warning);
    }

    /// Make `result` the output reported for the whole procedure.
    pub fn capture(&mut self, result: &CommandResult) {
        self.captured = Some(result.clone());
    }

    async fn exec(
        &mut self,
        name: &str,
        command: &ShellCommand,
        timeout: Duration,
        mode: Mode,
    ) -> Result<CommandResult, Halt> {
        let shown = command.to_string();
        if self.dry_run && mode != Mode::Probe {
            self.record(StepRecord::planned(name, shown)).await;
            return Ok(CommandResult::new(0, "", ""));
        }

        match self.runner.run(&mut *self.session, command, timeout).await {
            Ok(result) => {
                let halts = mode == Mode::Run && !result.success();
                let mut record = StepRecord::executed(name, shown, *result.exit_code());
                if halts {
                    record = record.with_error(describe(&result));
                }
                self.record(record).await;
                if halts {
                    return Err(Halt::Step {
                        step: name.to_string(),
                        exit_code: *result.exit_code(),
                        detail: describe(&result),
                        stdout: result.stdout().clone(),
                        stderr: result.stderr().clone(),
                    });
                }
                Ok(result)
            }
            Err(CommandError::Timeout { after, .. }) => {
                self.record(
                    StepRecord::sent(name, shown)
                        .with_timeout()
                        .with_error(format!("timed out after {after:?}")),
                )
                .await;
                if mode == Mode::Attempt {
                    return Ok(CommandResult::timeout());
                }
                Err(Halt::Timeout {
                    step: name.to_string(),
                    after,
                })
            }
            Err(CommandError::Transport { source, .. }) => {
                let cause = source.to_string();
                self.record(StepRecord::sent(name, shown).with_error(cause.clone()))
                    .await;
                Err(Halt::Transport {
                    step: name.to_string(),
                    cause,
                })
            }
        }
    }

    async fn record(&mut self, record: StepRecord) {
        if let Err(err) = self
            .sink
            .sink(StepEvent::new(self.host.clone(), record.clone()))
            .await
        {
            warn!("failed recording step {}: {}", record.name(), err);
        }
        self.steps.push(record);
    }

    pub fn finish(self, result: Result<Finish, Halt>) -> ProcedureOutcome {
        let (stdout, stderr, return_code) = match &self.captured {
            Some(c) => (c.stdout().clone(), c.stderr().clone(), *c.exit_code()),
            None => (String::new(), String::new(), 0),
        };
        let parts = match result {
            Ok(finish) => {
                let message = if self.dry_run && !finish.skipped {
                    format!(
                        "dry run, {} command(s) planned: {}",
                        self.steps.iter().filter(|s| !s.executed()).count(),
                        finish.message
                    )
                } else {
                    finish.message
                };
                OutcomeParts {
                    success: true,
                    skipped: finish.skipped,
                    message,
                    is_dry_run: self.dry_run,
                    failure: None,
                    steps: self.steps,
                    warnings: self.warnings,
                    stdout,
                    stderr,
                    return_code,
                }
            }
            Err(halt) => {
                let (stdout, stderr, return_code) = match &halt {
                    Halt::Step {
                        stdout,
                        stderr,
                        exit_code,
                        ..
                    } => (stdout.clone(), stderr.clone(), *exit_code),
                    other => (stdout, other.to_string(), -1),
                };
                OutcomeParts {
                    success: false,
                    skipped: false,
                    message: halt.to_string(),
                    is_dry_run: self.dry_run,
                    failure: Some(halt.kind()),
                    steps: self.steps,
                    warnings: self.warnings,
                    stdout,
                    stderr,
                    return_code,
                }
            }
        };
        ProcedureOutcome::from(parts)
    }
}

fn describe(result: &CommandResult) -> String {
    if *result.timed_out() {
        return "timed out".into();
    }
    match result.diagnostic() {
        "" => format!("exit code {}", result.exit_code()),
        text => text.to_string(),
    }
}

/// `Found` when `dir` exists on the host, `Not Found` otherwise.
pub fn exists(dir: &str) -> ShellCommand {
    ShellCommand::new("test")
        .args(["-d", dir])
        .and(ShellCommand::new("echo").arg("Found"))
        .or(ShellCommand::new("echo").arg("Not Found"))
}

pub fn found(result: &CommandResult) -> bool {
    result.stdout().trim() == "Found"
}
