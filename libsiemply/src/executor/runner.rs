use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Session, TransportError};
use crate::log::*;
use crate::shell::ShellCommand;

/// Outcome of one command. A non-zero exit code is data, not an error.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandResult {
    exit_code: i32,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

impl CommandResult {
    pub fn new<O: Into<String>, E: Into<String>>(exit_code: i32, stdout: O, stderr: E) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    /// Stand-in for a command that never finished.
    pub fn timeout() -> Self {
        Self {
            exit_code: -1,
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// `stderr` if there is any, else `stdout`. What a failure message shows.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command timed out after {after:?}: {command}")]
    Timeout { command: String, after: Duration },
    #[error("transport failed while running `{command}`: {source}")]
    Transport {
        command: String,
        #[source]
        source: TransportError,
    },
}

/// Runs one command over a session with a time bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner;

impl CommandRunner {
    #[tracing::instrument(skip(self, session, command), fields(command = %command))]
    pub async fn run(
        &self,
        session: &mut dyn Session,
        command: &ShellCommand,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        // The masked form is what lands in logs and errors.
        let shown = command.to_string();
        debug!("running: {}", shown);

        match tokio::time::timeout(timeout, session.exec(&command.render())).await {
            Ok(Ok(output)) => {
                let result = CommandResult::new(output.exit_code, output.stdout, output.stderr);
                if result.success() {
                    trace!("command succeeded: {}", shown);
                } else {
                    debug!(
                        "command exited {}: {} ({})",
                        result.exit_code,
                        shown,
                        result.diagnostic()
                    );
                }
                Ok(result)
            }
            Ok(Err(source)) => Err(CommandError::Transport {
                command: shown,
                source,
            }),
            Err(_) => {
                warn!("command timed out after {:?}: {}", timeout, shown);
                Err(CommandError::Timeout {
                    command: shown,
                    after: timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use color_eyre::eyre::Result;

    use super::*;
    use crate::testing::FakeHost;

    #[tokio::test]
    async fn test_non_zero_exit_is_a_result() -> Result<()> {
        let host = FakeHost::new().on("false", 1, "", "nope");
        let mut session = host.session();
        let result = CommandRunner
            .run(&mut session, &ShellCommand::new("false"), Duration::from_secs(5))
            .await?;
        assert_eq!(1, *result.exit_code());
        assert!(!result.success());
        assert_eq!("nope", result.diagnostic());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_command_times_out() {
        let host = FakeHost::new().hang_on("sleep");
        let mut session = host.session();
        let err = CommandRunner
            .run(
                &mut session,
                &ShellCommand::new("sleep").arg("600"),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
        assert!(err.to_string().contains("sleep 600"));
    }

    #[tokio::test]
    async fn test_secrets_reach_the_host_but_not_the_error() {
        let host = FakeHost::new().drop_on("set-password");
        let mut session = host.session();
        let command = ShellCommand::new("set-password").secret("hunter2");
        let err = CommandRunner
            .run(&mut session, &command, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Transport { .. }));
        assert!(!err.to_string().contains("hunter2"));
        assert_eq!(vec!["set-password hunter2"], host.commands());
    }
}
