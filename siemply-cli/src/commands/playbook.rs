use std::path::Path;

use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Result, WrapErr};
use serde_json::{json, Value};
use siemply::job::JobRequest;
use siemply::log::*;
use siemply::plan::Playbook;
use siemply::procedure::ProcedureKind;

use super::job::run_jobs;
use super::{Environment, Interactive};

pub struct PlaybookCommand;

impl PlaybookCommand {
    async fn read_playbook(&self, matches: &ArgMatches) -> Result<Playbook> {
        let file = self.read_argument_with_validator(matches, "file", &mut |_| Ok(()))?;
        Playbook::load(Path::new(&file))
            .await
            .wrap_err_with(|| format!("Failed loading playbook {file}"))
    }

    async fn subcommand_validate(&self, matches: &ArgMatches) -> Result<()> {
        let playbook = self.read_playbook(matches).await?;
        let problems = playbook.validate();
        if problems.is_empty() {
            info!("playbook is valid.");
            println!("* playbook `{}` is valid.", playbook.name());
            println!("** {} task(s), {} template(s)", playbook.tasks().len(), playbook.templates().len());
            Ok(())
        } else {
            error!("playbook is invalid.");
            println!("* playbook `{}` is invalid:", playbook.name());
            for problem in &problems {
                println!("** {}", problem);
            }
            Err(eyre!("{} problem(s) found", problems.len()))
        }
    }

    async fn subcommand_plan(&self, matches: &ArgMatches) -> Result<()> {
        let playbook = self.read_playbook(matches).await?;
        let vars = self.read_key_values(matches, "var")?;
        let planned = playbook.plan(&vars)?;
        println!("*** playbook: {} ***\n", playbook.name());
        for task in &planned {
            println!("* {}: {}", task.name(), task.command());
        }
        let skipped = playbook.tasks().len() - planned.len();
        if skipped > 0 {
            println!("\n({} task(s) depend on results only known while running)", skipped);
        }
        Ok(())
    }

    async fn subcommand_apply(&self, matches: &ArgMatches) -> Result<()> {
        let playbook = self.read_playbook(matches).await?;
        let vars = self.read_key_values(matches, "var")?;
        let env = Environment::load(matches).await?;
        let hosts = env.selected_hosts(matches)?;

        let params = json!({
            "playbook": serde_json::to_value(&playbook)?,
            "vars": Value::Object(vars),
        });
        let dry = matches.get_flag("dry");
        println!("*** applying playbook {} to {} host(s) ***", playbook.name(), hosts.len());
        let requests = hosts
            .iter()
            .map(|host| JobRequest::new(host.as_str(), ProcedureKind::Playbook, params.clone()).dry_run(dry))
            .collect();
        run_jobs(&env, requests, matches.get_flag("json")).await
    }
}

#[async_trait]
impl<'a> super::Command<'a> for PlaybookCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<()> {
        match context.matches.subcommand() {
            Some(("validate", matches)) => {
                self.subcommand_validate(matches).await?;
            }
            Some(("plan", matches)) => {
                self.subcommand_plan(matches).await?;
            }
            Some(("apply", matches)) => {
                self.subcommand_apply(matches).await?;
            }
            Some((name, _)) => {
                return Err(super::CommandErrors::InvalidSubcommand(name.to_string()).into())
            }
            None => return Err(super::CommandErrors::NoSubcommandProvided.into()),
        }
        Ok(())
    }
}

impl<'a> super::Interactive<'a> for PlaybookCommand {}
