use super::install::ensure_account;
use super::params::{join, RepairSpec};
use super::products;
use super::step::{exists, found, Finish, Halt, StepContext, EXISTENCE_CHECK};
use crate::config::EngineConfig;
use crate::shell::ShellCommand;

fn chmod_all(home: &str, kind: &str, mode: &str) -> ShellCommand {
    ShellCommand::new("find")
        .args([home, "-type", kind, "-exec", "chmod", mode, "{}", "+"])
}

/// Reset ownership and modes of an installed product and restart it.
///
/// Mode and lock-file steps are tolerated: each failure becomes a warning and
/// the outcome message counts them. Restarting is the only step after the
/// account and ownership reset that can fail the repair.
pub(crate) async fn repair(
    ctx: &mut StepContext<'_>,
    spec: &RepairSpec,
    config: &EngineConfig,
) -> Result<Finish, Halt> {
    let home = join(&spec.install_dir, spec.target.dir_name());
    let owner = format!("{}:{}", spec.user, spec.group);

    let check = ctx.probe(EXISTENCE_CHECK, &exists(&home)).await?;
    if !found(&check) {
        let message = format!("nothing installed at {home}");
        if !ctx.is_dry_run() {
            return Err(Halt::failed(EXISTENCE_CHECK, message));
        }
        ctx.warn(message);
    }

    ctx.tolerate(
        "stop-service",
        &products::stop_service(spec.target, &home, &spec.user, config),
    )
    .await?;
    ctx.run("prepare-user", &ensure_account(&spec.user, &spec.group))
        .await?;
    ctx.run("chown", &ShellCommand::new("chown").args(["-R", &owner, &home]))
        .await?;

    ctx.tolerate("directory-modes", &chmod_all(&home, "d", "755"))
        .await?;
    ctx.tolerate("file-modes", &chmod_all(&home, "f", "644"))
        .await?;
    ctx.tolerate("binary-modes", &chmod_all(&join(&home, "bin"), "f", "755"))
        .await?;
    let auth = spec.target.auth_dir(&home);
    ctx.tolerate(
        "auth-dir-mode",
        &ShellCommand::new("test")
            .args(["!", "-d", &auth])
            .or(ShellCommand::new("chmod").args(["700", &auth])),
    )
    .await?;
    ctx.tolerate(
        "stale-locks",
        &ShellCommand::new("find").args([
            home.as_str(),
            "-type",
            "f",
            "(",
            "-name",
            "*.pid",
            "-o",
            "-name",
            "*.lock",
            ")",
            "-delete",
        ]),
    )
    .await?;

    let restarted = ctx
        .run_for(
            "restart",
            &products::restart_service(spec.target, &home, &spec.user, config),
            config.timeouts.start(),
        )
        .await?;
    ctx.capture(&restarted);

    let warnings = ctx.warnings().len();
    if warnings == 0 {
        Ok(Finish::done(format!("permissions repaired on {home}")))
    } else {
        Ok(Finish::done(format!(
            "permissions repaired on {home}, completed with {warnings} warning(s)"
        )))
    }
}
