use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use derive_getters::Getters;
use thiserror::Error;
use tokio::time::Instant;

use super::{simple, ssh, Credentials, ExecutorKind, Session, Transport};
use crate::config::{expand_home, SshConfig};
use crate::inventory::HostTarget;
use crate::log::*;

/// Retries exhausted. Carries the last underlying cause.
#[derive(Getters, Error, Debug, Clone)]
#[error("failed to connect to {host} after {attempts} attempt(s) ({elapsed:.2?}): {cause}")]
pub struct ConnectionError {
    host: String,
    attempts: u32,
    elapsed: Duration,
    cause: String,
    /// The last attempt ran out of time rather than being refused.
    timed_out: bool,
}

#[derive(Getters, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    timeout: Duration,
    backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, timeout: Duration, backoff_base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            timeout,
            backoff_base,
        }
    }

    pub fn from_config(ssh: &SshConfig) -> Self {
        Self::new(ssh.retries, ssh.connect_timeout(), ssh.backoff_base())
    }

    /// Apply a host's own timeout/retry overrides.
    pub fn for_target(self, target: &HostTarget) -> Self {
        Self::new(
            target.retries().unwrap_or(self.attempts),
            target
                .timeout_secs()
                .map(Duration::from_secs)
                .unwrap_or(self.timeout),
            self.backoff_base,
        )
    }

    /// Delay after the `attempt`th failure (1-based): 1x, 2x, 4x, ... the base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Establishes sessions with bounded retry and exponential backoff. Opens a
/// fresh session per call; there is no pooling.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    ssh: SshConfig,
    transports: HashMap<ExecutorKind, Arc<dyn Transport>>,
}

impl ConnectionManager {
    pub fn new(ssh: SshConfig) -> Self {
        let mut transports: HashMap<ExecutorKind, Arc<dyn Transport>> = HashMap::new();
        transports.insert(ExecutorKind::Ssh, Arc::new(ssh::SshTransport::default()));
        transports.insert(ExecutorKind::Local, Arc::new(simple::LocalTransport));
        Self { ssh, transports }
    }

    /// Replace the transport used for hosts of the given kind.
    pub fn with_transport(mut self, kind: ExecutorKind, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(kind, transport);
        self
    }

    /// Key first (the host's own, else the configured default) if the file
    /// exists, then password.
    pub fn credentials_for(&self, target: &HostTarget) -> Vec<Credentials> {
        let mut credentials = vec![];
        let key = target
            .key_path()
            .as_deref()
            .map(expand_home)
            .or_else(|| self.ssh.expanded_key_path());
        match key {
            Some(path) if path.exists() => credentials.push(Credentials::Key(path)),
            Some(path) => debug!("ssh key not found at {}, skipping", path.display()),
            None => {}
        }
        if let Some(password) = target.password() {
            credentials.push(Credentials::Password(password.clone()));
        }
        credentials
    }

    #[tracing::instrument(skip(self, target), fields(host = %target.endpoint()))]
    pub async fn connect(&self, target: &HostTarget) -> Result<Box<dyn Session>, ConnectionError> {
        let resolved = target.clone().with_default_port(self.ssh.default_port);
        let target = &resolved;
        let policy = RetryPolicy::from_config(&self.ssh).for_target(target);
        let username = target
            .username()
            .clone()
            .unwrap_or_else(|| self.ssh.default_user.clone());
        let credentials = self.credentials_for(target);
        let start = Instant::now();

        let transport = match self.transports.get(target.executor()) {
            Some(transport) => transport.clone(),
            None => {
                return Err(ConnectionError {
                    host: target.endpoint(),
                    attempts: 0,
                    elapsed: start.elapsed(),
                    cause: format!("no transport registered for {:?}", target.executor()),
                    timed_out: false,
                })
            }
        };

        info!("connecting to {}@{}", username, target.endpoint());
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (cause, timed_out, retriable) = match tokio::time::timeout(
                *policy.timeout(),
                transport.open(target, &username, &credentials),
            )
            .await
            {
                Ok(Ok(session)) => {
                    info!(
                        "connected to {} on attempt {} ({:.2?})",
                        target.endpoint(),
                        attempt,
                        start.elapsed()
                    );
                    return Ok(session);
                }
                Ok(Err(err)) => {
                    let retriable = err.is_retriable();
                    (err.to_string(), false, retriable)
                }
                Err(_) => (
                    format!("attempt timed out after {:?}", policy.timeout()),
                    true,
                    true,
                ),
            };

            warn!(
                "connection attempt {}/{} to {} failed: {}",
                attempt,
                policy.attempts(),
                target.endpoint(),
                cause
            );
            if attempt >= *policy.attempts() || !retriable {
                let err = ConnectionError {
                    host: target.endpoint(),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                    cause,
                    timed_out,
                };
                error!("{}", err);
                return Err(err);
            }

            let delay = policy.backoff(attempt);
            info!("retrying in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Close a session, logging rather than failing. Safe to call on a
    /// session that is already closed.
    pub async fn disconnect(&self, session: &mut dyn Session) {
        if session.is_closed() {
            return;
        }
        if let Err(err) = session.close().await {
            warn!("error while disconnecting: {}", err);
        }
    }
}
