use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use siemply::inventory::{HostInventory, HostTarget};
use siemply::log::*;
use siemply::procedure::HostFacts;

use super::{CommandErrors, Environment};

pub struct HostCommand;

impl HostCommand {
    async fn subcommand_check(&self, matches: &ArgMatches) -> Result<()> {
        let env = Environment::load(matches).await?;
        let mut groups: Vec<_> = env.hosts.groups().iter().collect();
        groups.sort_by(|a, b| a.0.cmp(b.0));
        println!("* {} host(s), {} group(s)", env.hosts.hosts().len(), groups.len());
        let mut problems = 0;
        for (group_name, group_hosts) in groups {
            println!("*** group: {}", group_name);
            for hostname in group_hosts {
                match env.hosts.resolve(hostname).await {
                    Some(host) => println!(
                        "**** {}: {}@{} ({:?})",
                        hostname,
                        host.username()
                            .clone()
                            .unwrap_or_else(|| env.config.ssh.default_user.clone()),
                        host.clone().with_default_port(env.config.ssh.default_port).endpoint(),
                        host.executor()
                    ),
                    None => {
                        problems += 1;
                        println!("**** {}: not defined under `hosts`", hostname);
                    }
                }
            }
        }
        if problems > 0 {
            return Err(eyre!("{} group member(s) are not defined", problems));
        }
        Ok(())
    }

    async fn targets(&self, env: &Environment, matches: &ArgMatches) -> Result<Vec<(String, HostTarget)>> {
        let mut targets = vec![];
        for name in env.selected_hosts(matches)? {
            let target = env
                .hosts
                .resolve(&name)
                .await
                .ok_or_else(|| eyre!("host `{}` is not in the hosts file", name))?;
            targets.push((name, target));
        }
        Ok(targets)
    }

    async fn subcommand_probe(&self, matches: &ArgMatches) -> Result<()> {
        let env = Environment::load(matches).await?;
        let library = env.library();
        let targets = self.targets(&env, matches).await?;

        let mut probes: FuturesUnordered<_> = targets
            .iter()
            .map(|(name, target)| library.probe(name, target))
            .collect();
        let mut unreachable = 0;
        while let Some(report) = probes.next().await {
            if !*report.reachable() {
                unreachable += 1;
            }
            println!(
                "* {}: {} in {:.2?} ({})",
                report.host(),
                if *report.reachable() { "reachable" } else { "unreachable" },
                report.elapsed(),
                report.message()
            );
        }
        if unreachable > 0 {
            return Err(eyre!("{} host(s) unreachable", unreachable));
        }
        Ok(())
    }

    async fn subcommand_facts(&self, matches: &ArgMatches) -> Result<()> {
        let env = Environment::load(matches).await?;
        let library = env.library();
        let targets = self.targets(&env, matches).await?;

        let mut pending: FuturesUnordered<_> = targets
            .iter()
            .map(|(name, target)| library.facts(name, target))
            .collect();
        let mut all = vec![];
        while let Some(facts) = pending.next().await {
            all.push(facts);
        }
        all.sort_by(|a, b| a.host().cmp(b.host()));
        let unreachable = all.iter().filter(|f| !*f.reachable()).count();

        if matches.get_flag("json") {
            println!("{}", serde_json::to_string_pretty(&all)?);
        } else {
            for facts in &all {
                print_facts(facts);
            }
        }
        if unreachable > 0 {
            return Err(eyre!("{} host(s) unreachable", unreachable));
        }
        Ok(())
    }
}

fn print_facts(facts: &HostFacts) {
    if !*facts.reachable() {
        println!("* {}: unreachable ({})", facts.host(), facts.message());
        return;
    }
    let unknown = || "?".to_string();
    println!("* {}: {}", facts.host(), facts.message());
    let os = facts.os();
    println!(
        "** os: {} (kernel {})",
        os.name().clone().unwrap_or_else(unknown),
        os.kernel().clone().unwrap_or_else(unknown)
    );
    let cpu = facts.cpu();
    println!(
        "** cpu: {} x {}{}",
        cpu.cores().map(|c| c.to_string()).unwrap_or_else(unknown),
        cpu.model().clone().unwrap_or_else(unknown),
        match cpu.load() {
            Some(load) => format!(", load {:.2} {:.2} {:.2}", load.one(), load.five(), load.fifteen()),
            None => String::new(),
        }
    );
    if let Some(memory) = facts.memory() {
        println!(
            "** memory: {} of {} MiB used ({}%)",
            memory.used_bytes() / MIB,
            memory.total_bytes() / MIB,
            memory.usage_percent()
        );
    }
    if let Some(disk) = facts.disk() {
        println!(
            "** disk {} on {}: {} of {} MiB used ({}%)",
            disk.mount_point(),
            disk.filesystem(),
            disk.used_bytes() / MIB,
            disk.total_bytes() / MIB,
            disk.usage_percent()
        );
    }
    if let Some(uptime) = facts.uptime() {
        println!("** up {:.1} day(s)", uptime.as_secs_f64() / 86400.0);
    }
    for error in facts.errors() {
        println!("** not collected: {}", error);
    }
}

const MIB: u64 = 1024 * 1024;

#[async_trait]
impl<'a> super::Command<'a> for HostCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<()> {
        match context.matches.subcommand() {
            Some(("check", matches)) => {
                self.subcommand_check(matches).await?;
            }
            Some(("probe", matches)) => {
                self.subcommand_probe(matches).await?;
            }
            Some(("facts", matches)) => {
                self.subcommand_facts(matches).await?;
            }
            Some((name, _)) => return Err(CommandErrors::InvalidSubcommand(name.to_string()).into()),
            None => return Err(CommandErrors::NoSubcommandProvided.into()),
        }
        Ok(())
    }
}
