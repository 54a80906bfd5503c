#![forbid(unsafe_code)]

use clap::{command, Arg, ArgAction};
use color_eyre::eyre::{eyre, Result};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::util::SubscriberInitExt;

use crate::commands::Command;

mod commands;

use siemply::log::*;

const LOG_ENV: &str = "SIEMPLY_LOG";

fn environment_args() -> [Arg; 3] {
    [
        Arg::new("hosts")
            .help("Path to the hosts file.")
            .long("hosts")
            .default_value("hosts.yaml"),
        Arg::new("packages")
            .help("Path to the package catalog.")
            .long("packages"),
        Arg::new("config")
            .help("Path to the engine config. Defaults plus SIEMPLY_SSH_* otherwise.")
            .short('c')
            .long("config"),
    ]
}

fn target_args() -> [Arg; 2] {
    [
        Arg::new("host")
            .help("Host name from the hosts file. Can be repeated.")
            .long("host")
            .action(ArgAction::Append),
        Arg::new("group")
            .help("Host group from the hosts file. Can be repeated.")
            .short('g')
            .long("group")
            .action(ArgAction::Append),
    ]
}

fn dry_arg() -> Arg {
    Arg::new("dry")
        .help("Don't change anything, just show the commands that would run.")
        .short('d')
        .long("dry")
        .action(ArgAction::SetTrue)
}

fn json_arg() -> Arg {
    Arg::new("json")
        .help("Print results as JSON.")
        .long("json")
        .action(ArgAction::SetTrue)
}

fn var_arg() -> Arg {
    Arg::new("var")
        .help("Playbook variable as key=value. Can be repeated.")
        .short('e')
        .long("var")
        .action(ArgAction::Append)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Command configuration
    let matches = command!()
        .name("siemply")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vvvv.")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Silence all output. Overridden by -v.")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            command!("job")
                .about("Run provisioning procedures against hosts.")
                .subcommand(
                    command!("run")
                        .about("Run one procedure against every selected host.")
                        .arg(
                            Arg::new("kind")
                                .help("Procedure kind, see `siemply job kinds`.")
                                .short('k')
                                .long("kind")
                                .required(true),
                        )
                        .arg(
                            Arg::new("param")
                                .help("Procedure parameter as key=value. Can be repeated.")
                                .short('p')
                                .long("param")
                                .action(ArgAction::Append),
                        )
                        .arg(
                            Arg::new("params")
                                .help("YAML or JSON file with procedure parameters. --param wins.")
                                .long("params"),
                        )
                        .arg(
                            Arg::new("ask")
                                .help("Prompt for missing secrets instead of failing.")
                                .long("ask")
                                .action(ArgAction::SetTrue),
                        )
                        .arg(dry_arg())
                        .arg(json_arg())
                        .args(target_args())
                        .args(environment_args()),
                )
                .subcommand(command!("kinds").about("List procedure kinds.")),
        )
        .subcommand(
            command!("playbook")
                .about("Manage playbooks.")
                .subcommand(
                    command!("validate").about("Validate a playbook.").arg(
                        Arg::new("file")
                            .help("Path to the playbook file.")
                            .short('f')
                            .long("file")
                            .required(true),
                    ),
                )
                .subcommand(
                    command!("plan")
                        .about("Show the commands a playbook renders to, without registered results.")
                        .arg(
                            Arg::new("file")
                                .help("Path to the playbook file.")
                                .short('f')
                                .long("file")
                                .required(true),
                        )
                        .arg(var_arg()),
                )
                .subcommand(
                    command!("apply")
                        .about("Apply a playbook.")
                        .arg(
                            Arg::new("file")
                                .help("Path to the playbook file.")
                                .short('f')
                                .long("file")
                                .required(true),
                        )
                        .arg(var_arg())
                        .arg(dry_arg())
                        .arg(json_arg())
                        .args(target_args())
                        .args(environment_args()),
                ),
        )
        .subcommand(
            command!("host")
                .about("Inspect and reach hosts.")
                .subcommand(
                    command!("check")
                        .about("List the hosts file's groups and hosts.")
                        .args(environment_args()),
                )
                .subcommand(
                    command!("probe")
                        .about("Connect to hosts and run `echo`.")
                        .args(target_args())
                        .args(environment_args()),
                )
                .subcommand(
                    command!("facts")
                        .about("Read OS, CPU, memory, disk and uptime facts from hosts.")
                        .arg(json_arg())
                        .args(target_args())
                        .args(environment_args()),
                ),
        )
        .subcommand_required(true)
        .get_matches();

    // Set up logging
    let logging_config = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .compact();

    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose") as usize;
    let level = if quiet && verbose == 0 {
        LevelFilter::ERROR
    } else if verbose > 0 {
        match verbose {
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    } else {
        LevelFilter::ERROR
    };
    let filter = match std::env::var(LOG_ENV) {
        Ok(_) => EnvFilter::try_from_env(LOG_ENV)?,
        Err(_) => EnvFilter::default().add_directive(level.into()),
    };

    let subscriber = logging_config.with_env_filter(filter).finish();
    subscriber.init();
    install_color_eyre()?;

    // Run the commands
    if let Some((subcommand, matches)) = matches.subcommand() {
        let ctx = commands::CliContext::new(matches);
        debug!(
            "matched subcommand {} with matches: {:?}",
            &subcommand,
            &matches.ids().map(|id| id.as_str()).collect::<Vec<_>>()
        );
        match subcommand {
            "job" => commands::job::JobCommand::new().run(&ctx).await?,
            "playbook" => commands::playbook::PlaybookCommand::new().run(&ctx).await?,
            "host" => commands::host::HostCommand::new().run(&ctx).await?,
            _ => return Err(eyre!("Unrecognized subcommand: {}", subcommand)),
        }
    }
    Ok(())
}
