use std::time::Duration;

use super::params::{join, CommandSpec, ScriptSpec};
use super::step::{Finish, Halt, StepContext};
use crate::config::EngineConfig;
use crate::shell::ShellCommand;

fn ensure_user(user: &str) -> ShellCommand {
    ShellCommand::new("id")
        .args(["-u", user])
        .quiet()
        .or(ShellCommand::new("useradd").args(["-m", user]))
}

fn timeout_for(secs: Option<u64>, config: &EngineConfig) -> Duration {
    secs.map(Duration::from_secs)
        .unwrap_or_else(|| config.timeouts.command())
}

pub(crate) async fn command(
    ctx: &mut StepContext<'_>,
    spec: &CommandSpec,
    config: &EngineConfig,
) -> Result<Finish, Halt> {
    let mut command = ShellCommand::shell(spec.command.as_str());
    if let Some(user) = &spec.run_as {
        ctx.run("prepare-user", &ensure_user(user)).await?;
        command = command.as_user(user);
    }
    let result = ctx
        .run_for("command", &command, timeout_for(spec.timeout_secs, config))
        .await?;
    ctx.capture(&result);
    Ok(Finish::done("command completed"))
}

/// Materialize the script under a random name, run it, and remove it. Removal
/// is attempted whenever writing was.
pub(crate) async fn script(
    ctx: &mut StepContext<'_>,
    spec: &ScriptSpec,
    config: &EngineConfig,
) -> Result<Finish, Halt> {
    let path = join(
        &config.install.script_dir,
        &format!("siemply_script_{:016x}.sh", rand::random::<u64>()),
    );

    if let Some(user) = &spec.run_as {
        ctx.run("prepare-user", &ensure_user(user)).await?;
    }

    let mut write = ShellCommand::write_file(path.as_str(), spec.script.as_str())
        .and(ShellCommand::new("chmod").args(["+x", &path]));
    let mut execute = ShellCommand::new(path.as_str());
    if let Some(user) = &spec.run_as {
        write = write.and(ShellCommand::new("chown").args([&format!("{user}:{user}"), &path]));
        execute = execute.as_user(user);
    }

    let ran = match ctx.run("write-script", &write).await {
        Ok(_) => {
            ctx.run_for("execute", &execute, timeout_for(spec.timeout_secs, config))
                .await
        }
        Err(halt) => Err(halt),
    };

    let removed = ctx
        .attempt("cleanup", &ShellCommand::new("rm").args(["-f", &path]))
        .await;
    if let Ok(result) = &removed {
        if !result.success() {
            ctx.warn(format!("could not remove {path}"));
        }
    }

    let result = ran?;
    ctx.capture(&result);
    Ok(Finish::done("script completed"))
}
