//! The install shape shared by every product: pre-check, account, acquire,
//! verify, extract, configure, start, persist, check, clean up.

use super::acquire;
use super::params::{join, InstallSpec};
use super::products;
use super::step::{exists, found, Finish, Halt, StepContext, EXISTENCE_CHECK};
use crate::config::EngineConfig;
use crate::inventory::PackageInventory;
use crate::log::*;
use crate::shell::ShellCommand;

pub(crate) struct InstallEnv<'a> {
    pub config: &'a EngineConfig,
    pub packages: &'a dyn PackageInventory,
    pub architecture: String,
}

/// Create `group` and `user` unless they already exist.
pub(crate) fn ensure_account(user: &str, group: &str) -> ShellCommand {
    ShellCommand::new("getent")
        .args(["group", group])
        .quiet()
        .or(ShellCommand::new("groupadd").arg(group))
        .and(
            ShellCommand::new("id")
                .args(["-u", user])
                .quiet()
                .or(ShellCommand::new("useradd").args(["-m", "-g", group, user])),
        )
}

pub(crate) async fn install(
    ctx: &mut StepContext<'_>,
    env: &InstallEnv<'_>,
    spec: &InstallSpec,
) -> Result<Finish, Halt> {
    let home = spec.home();
    let label = spec.product.label();

    let check = ctx.probe(EXISTENCE_CHECK, &exists(&home)).await?;
    if found(&check) {
        info!("{} already present at {}, skipping", label, home);
        ctx.capture(&check);
        return Ok(Finish::skipped(format!("{label} already installed at {home}")));
    }

    ctx.run("prepare-user", &ensure_account(&spec.user, &spec.group))
        .await?;

    let installed = stage(ctx, env, spec).await;

    let cleanup = ShellCommand::new("rm").args(["-rf", &env.config.install.temp_dir]);
    match ctx.attempt("cleanup", &cleanup).await {
        Ok(result) if !result.success() => {
            ctx.warn(format!("could not remove {}", env.config.install.temp_dir))
        }
        Ok(_) => {}
        Err(halt) => warn!("cleanup skipped: {}", halt),
    }

    installed
}

/// Everything between account creation and cleanup.
async fn stage(
    ctx: &mut StepContext<'_>,
    env: &InstallEnv<'_>,
    spec: &InstallSpec,
) -> Result<Finish, Halt> {
    let config = env.config;
    let home = spec.home();
    let owner = format!("{}:{}", spec.user, spec.group);
    let archive = join(&config.install.temp_dir, &acquire::archive_name(spec));

    let urls = acquire::candidate_urls(env.packages, spec, &env.architecture).await;
    if urls.is_empty() {
        let message = format!(
            "no download URL for {} {} ({}) in the package inventory",
            spec.product.package(),
            spec.version,
            env.architecture
        );
        if !ctx.is_dry_run() {
            return Err(Halt::failed("download", message));
        }
        ctx.warn(format!("{message}; the real run will fail"));
    } else {
        acquire::download(
            ctx,
            &urls,
            &config.install.temp_dir,
            &archive,
            config.timeouts.download(),
        )
        .await?;
    }
    let checksum = acquire::expected_checksum(env.packages, spec, &env.architecture).await;
    acquire::verify_archive(
        ctx,
        &archive,
        config.install.min_archive_bytes,
        checksum.as_deref(),
        config.timeouts.extract(),
    )
    .await?;

    let extract = ShellCommand::new("mkdir")
        .args(["-p", &spec.install_dir])
        .and(ShellCommand::new("tar").args(["-xzf", &archive, "-C", &spec.install_dir]));
    ctx.run_for("extract", &extract, config.timeouts.extract())
        .await?;
    ctx.run("chown", &ShellCommand::new("chown").args(["-R", &owner, &home]))
        .await?;

    for step in products::configure(spec, config) {
        if step.tolerated {
            ctx.tolerate(step.name, &step.command).await?;
        } else {
            ctx.run(step.name, &step.command).await?;
        }
    }

    let started = ctx
        .attempt_for("start", &products::start(spec, config), config.timeouts.start())
        .await?;
    if !started.success() {
        ctx.warn(format!(
            "starting as {} failed, starting as root and repairing ownership",
            spec.user
        ));
        ctx.run_for("start-as-root", &products::start_as_root(spec), config.timeouts.start())
            .await?;
        ctx.run(
            "permission-fix",
            &ShellCommand::new("chown").args(["-R", &owner, &home]),
        )
        .await?;
    }

    ctx.tolerate("enable-boot-start", &products::enable(spec, config))
        .await?;

    let status = ctx
        .attempt("verify", &products::verify(spec, config))
        .await?;
    ctx.capture(&status);
    let installed = format!("{} {} installed at {}", spec.product.label(), spec.version, home);
    if status.success() {
        Ok(Finish::done(installed))
    } else {
        ctx.warn(format!(
            "status check failed: {}",
            match status.diagnostic() {
                "" => format!("exit code {}", status.exit_code()),
                text => text.to_string(),
            }
        ));
        Ok(Finish::done(format!("{installed}, completed with verification warning")))
    }
}
