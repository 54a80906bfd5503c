//! Scripted test double host.
//!
//! A [`FakeHost`] records every command line it receives and answers from a
//! list of rules matched by substring, first match wins. Anything unmatched
//! exits 0 with no output, except `test -d <path>` existence checks, which are
//! answered from the host's set of directories.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::executor::{Credentials, ExitOutput, Session, Transport, TransportError};
use crate::inventory::HostTarget;

#[derive(Debug, Clone)]
enum Effect {
    Reply {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Creates(String),
    Hang,
    /// Waits for a permit, then succeeds.
    Gate(Arc<Semaphore>),
    Drop,
    Panic,
}

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    effect: Effect,
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    dirs: HashSet<String>,
    commands: Vec<String>,
    connects: usize,
    endpoints: Vec<String>,
    closes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<State>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn rule(self, needle: &str, effect: Effect) -> Self {
        self.state().rules.push(Rule {
            needle: needle.to_string(),
            effect,
        });
        self
    }

    pub fn on(self, needle: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.rule(
            needle,
            Effect::Reply {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        )
    }

    /// A command containing `needle` succeeds and leaves `dir` behind.
    pub fn creates_on(self, needle: &str, dir: &str) -> Self {
        self.rule(needle, Effect::Creates(dir.to_string()))
    }

    pub fn hang_on(self, needle: &str) -> Self {
        self.rule(needle, Effect::Hang)
    }

    /// A command containing `needle` blocks until `gate` hands out a permit.
    pub fn gate_on(self, needle: &str, gate: Arc<Semaphore>) -> Self {
        self.rule(needle, Effect::Gate(gate))
    }

    pub fn drop_on(self, needle: &str) -> Self {
        self.rule(needle, Effect::Drop)
    }

    pub fn panic_on(self, needle: &str) -> Self {
        self.rule(needle, Effect::Panic)
    }

    /// Start with `dir` already present.
    pub fn with_dir(self, dir: &str) -> Self {
        self.state().dirs.insert(dir.to_string());
        self
    }

    pub fn has_dir(&self, dir: &str) -> bool {
        self.state().dirs.contains(dir)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    /// `address:port` of every target a session was opened for.
    pub fn endpoints(&self) -> Vec<String> {
        self.state().endpoints.clone()
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    pub fn session(&self) -> FakeSession {
        FakeSession {
            host: self.clone(),
            closed: false,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport { host: self.clone() })
    }

    fn answer(&self, command: &str) -> Effect {
        let mut state = self.state();
        state.commands.push(command.to_string());
        if let Some(rule) = state.rules.iter().find(|r| command.contains(&r.needle)) {
            return rule.effect.clone();
        }
        if let Some(dir) = existence_check(command) {
            let found = state.dirs.contains(&dir);
            return Effect::Reply {
                exit_code: 0,
                stdout: if found { "Found\n" } else { "Not Found\n" }.to_string(),
                stderr: String::new(),
            };
        }
        Effect::Reply {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

fn existence_check(command: &str) -> Option<String> {
    let words = shell_words::split(command).ok()?;
    match words.as_slice() {
        [test, flag, path, ..] if test == "test" && flag == "-d" => Some(path.clone()),
        _ => None,
    }
}

#[derive(Debug)]
pub struct FakeSession {
    host: FakeHost,
    closed: bool,
}

#[async_trait]
impl Session for FakeSession {
    async fn exec(&mut self, command: &str) -> Result<ExitOutput, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        // The guard is released inside `answer`, so a panic below leaves the
        // host readable.
        match self.host.answer(command) {
            Effect::Reply {
                exit_code,
                stdout,
                stderr,
            } => Ok(ExitOutput {
                exit_code,
                stdout,
                stderr,
            }),
            Effect::Creates(dir) => {
                self.host.state().dirs.insert(dir);
                Ok(ExitOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
            Effect::Hang => {
                futures::future::pending::<()>().await;
                Err(TransportError::Closed)
            }
            Effect::Gate(gate) => {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                Ok(ExitOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
            Effect::Drop => Err(TransportError::Ssh("connection reset by peer".into())),
            Effect::Panic => panic!("fake host blew up on `{command}`"),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.host.state().closes += 1;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Debug)]
struct FakeTransport {
    host: FakeHost,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        target: &HostTarget,
        _username: &str,
        _credentials: &[Credentials],
    ) -> Result<Box<dyn Session>, TransportError> {
        let mut state = self.host.state();
        state.connects += 1;
        state.endpoints.push(target.endpoint());
        drop(state);
        Ok(Box::new(self.host.session()))
    }
}

/// Refuses every connection and remembers when it was asked.
#[derive(Debug, Default)]
pub struct FailingTransport {
    attempts: Mutex<Vec<Instant>>,
}

impl FailingTransport {
    pub fn attempts_at(&self) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Transport for FailingTransport {
    async fn open(
        &self,
        _target: &HostTarget,
        _username: &str,
        _credentials: &[Credentials],
    ) -> Result<Box<dyn Session>, TransportError> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Instant::now());
        Err(TransportError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        )))
    }
}
