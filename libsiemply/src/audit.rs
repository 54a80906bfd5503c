//! Step-level audit trail.
//!
//! Every command a procedure executes or plans is reported to a [`StepSink`]
//! as a [`StepEvent`]. [`TracingSink`] writes them to the log; a
//! [`ChannelSink`]/[`ChannelSource`] pair streams them to another task, which
//! is how the CLI shows progress while jobs run.

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::log::*;

pub type StepTx = mpsc::Sender<StepEvent>;
pub type StepRx = mpsc::Receiver<StepEvent>;

/// One step of one procedure run.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    name: String,
    /// Masked form of the command line.
    command: String,
    /// False when the step was only planned (dry run).
    executed: bool,
    exit_code: Option<i32>,
    timed_out: bool,
    error: Option<String>,
}

impl StepRecord {
    pub fn planned<N: Into<String>, C: Into<String>>(name: N, command: C) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            executed: false,
            exit_code: None,
            timed_out: false,
            error: None,
        }
    }

    pub fn executed<N: Into<String>, C: Into<String>>(name: N, command: C, exit_code: i32) -> Self {
        Self {
            executed: true,
            exit_code: Some(exit_code),
            ..Self::planned(name, command)
        }
    }

    /// Sent to the host, but no exit status came back.
    pub fn sent<N: Into<String>, C: Into<String>>(name: N, command: C) -> Self {
        Self {
            executed: true,
            ..Self::planned(name, command)
        }
    }

    pub fn with_error<S: Into<String>>(mut self, error: S) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_timeout(mut self) -> Self {
        self.timed_out = true;
        self
    }
}

#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    host: String,
    record: StepRecord,
}

impl StepEvent {
    pub fn new<S: Into<String>>(host: S, record: StepRecord) -> Self {
        Self {
            host: host.into(),
            record,
        }
    }
}

#[async_trait]
pub trait StepSink: Send + Sync + std::fmt::Debug {
    async fn sink(&self, event: StepEvent) -> Result<()>;
}

/// Writes every step to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl StepSink for TracingSink {
    async fn sink(&self, event: StepEvent) -> Result<()> {
        let record = &event.record;
        match (record.executed, record.exit_code, &record.error) {
            (false, _, _) => info!("[{}] planned {}: {}", event.host, record.name, record.command),
            (true, _, Some(error)) => {
                warn!("[{}] {} failed: {} ({})", event.host, record.name, error, record.command)
            }
            (true, Some(code), None) if code != 0 => {
                info!("[{}] {} exited {}: {}", event.host, record.name, code, record.command)
            }
            (true, _, None) => info!("[{}] {}: {}", event.host, record.name, record.command),
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: StepTx,
}

impl ChannelSink {
    pub fn new(tx: StepTx) -> Self {
        Self { tx }
    }

    /// A connected sink/source pair.
    pub fn pair(capacity: usize) -> (Self, ChannelSource) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), ChannelSource::new(rx))
    }
}

#[async_trait]
impl StepSink for ChannelSink {
    async fn sink(&self, event: StepEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .wrap_err("Failed sending step event")
    }
}

/// Receiving end of a [`ChannelSink`]. Ends once every sink is dropped.
#[derive(Debug)]
pub struct ChannelSource {
    rx: StepRx,
}

impl ChannelSource {
    pub fn new(rx: StepRx) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<StepEvent> {
        self.rx.recv().await
    }

    /// Everything buffered right now, without waiting.
    pub fn drain(&mut self) -> Vec<StepEvent> {
        let mut out = vec![];
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }
}
