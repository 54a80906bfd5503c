use std::path::Path;

use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Result, WrapErr};
use serde_json::{json, Map, Value};
use siemply::job::{Job, JobEngine, JobRequest, JobStatus};
use siemply::log::*;
use siemply::procedure::ProcedureKind;
use tokio::fs;

use super::{print_outcome, CommandErrors, Environment, Interactive};

pub struct JobCommand;

impl JobCommand {
    async fn read_params(&self, matches: &ArgMatches) -> Result<Map<String, Value>> {
        let mut params = match matches.get_one::<String>("params") {
            Some(path) => {
                let raw = fs::read_to_string(Path::new(path))
                    .await
                    .wrap_err("Failed reading params file")?;
                match serde_yaml::from_str::<Value>(&raw).wrap_err("deserializing params file")? {
                    Value::Object(params) => params,
                    Value::Null => Map::new(),
                    _ => return Err(eyre!("params file {} must hold a mapping", path)),
                }
            }
            None => Map::new(),
        };
        params.extend(self.read_key_values(matches, "param")?);
        Ok(params)
    }

    /// Ask for whatever the kind cannot run without and was not given.
    fn ask_for_missing(&self, kind: ProcedureKind, params: &mut Map<String, Value>) -> Result<()> {
        let (plain, secrets): (Vec<&str>, Vec<&str>) = match kind {
            ProcedureKind::ForwarderInstall | ProcedureKind::EnterpriseInstall => {
                (vec!["version"], vec!["admin_password"])
            }
            ProcedureKind::StreamWorkerInstall => (vec!["version", "leader_host"], vec!["auth_token"]),
            ProcedureKind::StreamLeaderInstall => (vec!["version"], vec![]),
            _ => (vec![], vec![]),
        };
        let missing = |params: &Map<String, Value>, key: &str| {
            params
                .get(key)
                .and_then(Value::as_str)
                .map_or(true, |v| v.trim().is_empty())
        };
        for key in plain {
            if missing(params, key) {
                let value = self.prompt_for_input(key)?;
                params.insert(key.to_string(), Value::String(value));
            }
        }
        for key in secrets {
            if missing(params, key) {
                let value = self.prompt_for_secret(key)?;
                params.insert(key.to_string(), Value::String(value));
            }
        }
        Ok(())
    }

    async fn subcommand_run(&self, matches: &ArgMatches) -> Result<()> {
        let kind = self.read_argument_with_validator(matches, "kind", &mut |kind| {
            kind.parse::<ProcedureKind>()
                .map(|_| ())
                .map_err(|err| CommandErrors::InputValidationFailure("kind".into(), err.to_string()))
        })?;
        let kind: ProcedureKind = kind.parse()?;

        let mut params = self.read_params(matches).await?;
        if matches.get_flag("ask") {
            self.ask_for_missing(kind, &mut params)?;
        }

        let env = Environment::load(matches).await?;
        let hosts = env.selected_hosts(matches)?;
        let dry = matches.get_flag("dry");
        let requests = hosts
            .iter()
            .map(|host| JobRequest::new(host.as_str(), kind, Value::Object(params.clone())).dry_run(dry))
            .collect();
        run_jobs(&env, requests, matches.get_flag("json")).await
    }

    fn subcommand_kinds(&self) -> Result<()> {
        for kind in ProcedureKind::ALL {
            println!("* {}", kind);
        }
        Ok(())
    }
}

/// Submit every request, wait for all of them, and report. Fails if any job
/// did not complete.
pub(super) async fn run_jobs(env: &Environment, requests: Vec<JobRequest>, as_json: bool) -> Result<()> {
    let (engine, printer) = env.engine();
    let mut submitted = vec![];
    for request in requests {
        let job = engine
            .submit(request)
            .await
            .wrap_err("job was rejected")?;
        info!("submitted {} for {}", job.external_id(), job.host());
        submitted.push(*job.id());
    }

    let finished: Vec<Job> = wait_all(&engine, &submitted).await?;
    drop(engine);
    printer.await?;

    if as_json {
        let report: Vec<Value> = finished
            .iter()
            .map(|job| {
                json!({
                    "job": job.external_id(),
                    "host": job.host(),
                    "status": job.status(),
                    "outcome": job.result(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for job in &finished {
            match job.result() {
                Some(outcome) => print_outcome(job.host(), outcome),
                None => println!("*** {}: {}", job.host(), job.status()),
            }
        }
    }

    let failed = finished
        .iter()
        .filter(|job| *job.status() != JobStatus::Completed)
        .count();
    if failed > 0 {
        return Err(eyre!("{} of {} job(s) failed", failed, finished.len()));
    }
    Ok(())
}

async fn wait_all(engine: &JobEngine, ids: &[u64]) -> Result<Vec<Job>> {
    let waits = ids.iter().map(|id| engine.wait(*id));
    futures::future::join_all(waits)
        .await
        .into_iter()
        .map(|job| job.map_err(Into::into))
        .collect()
}

#[async_trait]
impl<'a> super::Command<'a> for JobCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<()> {
        match context.matches.subcommand() {
            Some(("run", matches)) => {
                self.subcommand_run(matches).await?;
            }
            Some(("kinds", _)) => {
                self.subcommand_kinds()?;
            }
            Some((name, _)) => {
                return Err(super::CommandErrors::InvalidSubcommand(name.to_string()).into())
            }
            None => return Err(super::CommandErrors::NoSubcommandProvided.into()),
        }
        Ok(())
    }
}

impl<'a> super::Interactive<'a> for JobCommand {}
