//! Remote execution: transports open [`Session`]s, the [`ConnectionManager`]
//! retries them, and the [`CommandRunner`] runs one command at a time over a
//! session with a timeout.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inventory::HostTarget;

pub mod connection;
pub mod runner;
pub mod simple;
pub mod ssh;

pub use connection::{ConnectionError, ConnectionManager, RetryPolicy};
pub use runner::{CommandError, CommandResult, CommandRunner};

/// Which transport reaches a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Ssh,
    /// Run on the controller itself through `sh -c`.
    #[serde(alias = "simple")]
    Local,
}

/// What a remote process left behind once it exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One way of proving who we are to a host. Tried in order.
#[derive(Clone)]
pub enum Credentials {
    Key(PathBuf),
    Password(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Key(path) => f.debug_tuple("Key").field(path).finish(),
            Credentials::Password(_) => f.debug_tuple("Password").field(&"<redacted>").finish(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no usable credentials for {0}")]
    NoCredentials(String),
    #[error("failed loading key {path}: {cause}")]
    Key { path: String, cause: String },
    #[error("authentication rejected for user `{0}`")]
    AuthRejected(String),
    #[error("session already closed")]
    Closed,
    #[error("channel closed without an exit status")]
    NoExitStatus,
    #[error("ssh: {0}")]
    Ssh(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether another connection attempt could plausibly succeed. Only
    /// local configuration problems are final; a rejected login is retried.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            TransportError::NoCredentials(_) | TransportError::Key { .. }
        )
    }
}

impl From<thrussh::Error> for TransportError {
    fn from(err: thrussh::Error) -> Self {
        TransportError::Ssh(err.to_string())
    }
}

/// A live, authenticated connection to one host. Owned by exactly one
/// procedure invocation.
#[async_trait]
pub trait Session: Send + fmt::Debug {
    /// Run one command line to completion. A non-zero exit is not an error.
    async fn exec(&mut self, command: &str) -> Result<ExitOutput, TransportError>;

    /// Close the session. Closing an already closed session is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// Opens sessions. Implementations must never hand out a session that is not
/// fully authenticated.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn open(
        &self,
        target: &HostTarget,
        username: &str,
        credentials: &[Credentials],
    ) -> Result<Box<dyn Session>, TransportError>;
}
