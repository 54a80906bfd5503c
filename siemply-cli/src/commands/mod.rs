use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Result, WrapErr};
use dialoguer::{Input, Password};
use regex::Regex;
use serde_json::{Map, Value};
use siemply::audit::{ChannelSink, ChannelSource, StepEvent};
use siemply::config::EngineConfig;
use siemply::inventory::{HostConfig, PackageCatalog};
use siemply::job::{JobEngine, MemoryJobStore};
use siemply::procedure::{ProcedureLibrary, ProcedureOutcome};
use thiserror::Error;
use tokio::task::JoinHandle;

pub mod host;
pub mod job;
pub mod playbook;

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Prompt interaction failed.")]
    PromptInteractionFailed(
        #[from]
        #[source]
        dialoguer::Error,
    ),
    #[error("Required user input `{0}` is missing.")]
    RequiredUserInputMissing(String),
    #[error("Argument `{0}` failed validation `{1}`")]
    InputValidationFailure(String, String),
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
    #[error("No subcommand provided.")]
    NoSubcommandProvided,
    #[error("No hosts selected. Pass --host or --group.")]
    NoHostsSelected,
    #[error("Unknown host group `{0}`.")]
    UnknownGroup(String),
}

pub struct CliContext<'a> {
    pub matches: &'a ArgMatches,
}

impl<'a> CliContext<'a> {
    pub fn new(matches: &'a ArgMatches) -> Self {
        Self { matches }
    }
}

#[async_trait]
pub trait Command<'a> {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &'a CliContext) -> Result<()>;
}

pub trait Interactive<'a> {
    fn prompt_for_input(&self, message: &'a str) -> Result<String> {
        Input::<String>::new()
            .with_prompt(message)
            .interact()
            .map_err(CommandErrors::PromptInteractionFailed)
            .wrap_err("Prompting user input failed.")
    }

    fn prompt_for_secret(&self, message: &str) -> Result<String> {
        Password::new()
            .with_prompt(message)
            .interact()
            .map_err(CommandErrors::PromptInteractionFailed)
            .wrap_err("Prompting for a secret failed.")
    }

    /// Read argument from the CLI args with a validation function.
    fn read_argument_with_validator<V>(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        validator: &mut V,
    ) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        if let Some(arg) = arg_matches.get_one::<String>(id) {
            validator(arg)?;
            Ok(arg.clone())
        } else {
            Err(CommandErrors::RequiredUserInputMissing(id.into()))?
        }
    }

    /// `key=value` pairs of a repeatable argument. Values `true` and `false`
    /// become booleans; everything else stays a string.
    fn read_key_values(&self, arg_matches: &'a ArgMatches, id: &'a str) -> Result<Map<String, Value>> {
        let pair = Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)=(.*)$")?;
        let mut values = Map::new();
        for raw in arg_matches.get_many::<String>(id).into_iter().flatten() {
            let caps = pair.captures(raw).ok_or_else(|| {
                CommandErrors::InputValidationFailure(id.into(), pair.as_str().into())
            })?;
            let value = match &caps[2] {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                other => Value::String(other.to_string()),
            };
            values.insert(caps[1].to_string(), value);
        }
        Ok(values)
    }
}

/// Everything loaded from the files named on the command line.
pub struct Environment {
    pub config: Arc<EngineConfig>,
    pub hosts: Arc<HostConfig>,
    pub packages: Arc<PackageCatalog>,
}

impl Environment {
    pub async fn load(matches: &ArgMatches) -> Result<Self> {
        let config = match matches.get_one::<String>("config") {
            Some(path) => EngineConfig::load(Path::new(path)).await?,
            None => EngineConfig::default().with_env(),
        };
        let hosts = match matches.get_one::<String>("hosts") {
            Some(path) => HostConfig::load(Path::new(path))
                .await
                .wrap_err_with(|| format!("loading hosts from {path}"))?,
            None => HostConfig::new(),
        };
        let packages = match matches.get_one::<String>("packages") {
            Some(path) => PackageCatalog::load(Path::new(path)).await?,
            None => PackageCatalog::default(),
        };
        Ok(Self {
            config: Arc::new(config),
            hosts: Arc::new(hosts),
            packages: Arc::new(packages),
        })
    }

    pub fn library(&self) -> ProcedureLibrary {
        ProcedureLibrary::new(self.config.clone(), self.packages.clone())
    }

    /// An engine whose step events are printed as they arrive.
    pub fn engine(&self) -> (JobEngine, JoinHandle<()>) {
        let (sink, source) = ChannelSink::pair(1024);
        let library = self.library().with_sink(Arc::new(sink));
        let engine = JobEngine::new(library, self.hosts.clone(), Arc::new(MemoryJobStore::new()));
        (engine, tokio::spawn(print_steps(source)))
    }

    /// Host names picked by `--host` and `--group`, deduplicated, in order.
    pub fn selected_hosts(&self, matches: &ArgMatches) -> Result<Vec<String>> {
        let mut selected: Vec<String> = vec![];
        for host in matches.get_many::<String>("host").into_iter().flatten() {
            if !selected.contains(host) {
                selected.push(host.clone());
            }
        }
        for group in matches.get_many::<String>("group").into_iter().flatten() {
            let members = self.hosts.group_members(group);
            if members.is_empty() {
                return Err(CommandErrors::UnknownGroup(group.clone()).into());
            }
            for host in members {
                if !selected.contains(&host) {
                    selected.push(host);
                }
            }
        }
        if selected.is_empty() {
            return Err(CommandErrors::NoHostsSelected.into());
        }
        Ok(selected)
    }
}

async fn print_steps(mut source: ChannelSource) {
    while let Some(event) = source.next().await {
        print_step(&event);
    }
}

fn print_step(event: &StepEvent) {
    let record = event.record();
    let state = match (*record.executed(), *record.exit_code(), *record.timed_out()) {
        (_, _, true) => "timeout".to_string(),
        (true, Some(code), _) => format!("exit {code}"),
        (true, None, _) => "error".to_string(),
        (false, _, _) => "planned".to_string(),
    };
    println!("* [{}] {} ({}): {}", event.host(), record.name(), state, record.command());
    if let Some(error) = record.error() {
        println!("  ! {}", error);
    }
}

pub fn print_outcome(host: &str, outcome: &ProcedureOutcome) {
    let verdict = match (*outcome.success(), *outcome.skipped()) {
        (true, true) => "skipped",
        (true, false) => "ok",
        (false, _) => "failed",
    };
    println!("*** {}: {} - {}", host, verdict, outcome.message());
    for warning in outcome.warnings() {
        println!("    warning: {}", warning);
    }
    if !outcome.stdout().trim().is_empty() {
        println!("    stdout: {}", outcome.stdout().trim_end());
    }
    if !*outcome.success() && !outcome.stderr().trim().is_empty() {
        println!("    stderr: {}", outcome.stderr().trim_end());
    }
}
