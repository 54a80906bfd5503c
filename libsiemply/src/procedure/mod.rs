//! Provisioning procedures.
//!
//! A procedure is a fixed sequence of shell commands run over one session
//! against one host. Every procedure:
//!
//! - validates its parameters before a connection is opened
//! - checks whether its work is already done and skips if so
//! - can run as a dry run, which executes read-only probes and records
//!   everything else without sending it
//! - closes its session on every exit path
//!
//! Nothing a procedure does escapes as an error; failures end up in the
//! returned [`ProcedureOutcome`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use crate::audit::{StepSink, TracingSink};
use crate::config::EngineConfig;
use crate::executor::{CommandRunner, ConnectionManager};
use crate::inventory::{HostTarget, PackageInventory};
use crate::log::*;
use crate::shell::ShellCommand;

mod acquire;
mod custom;
pub mod facts;
mod install;
pub mod outcome;
pub mod params;
mod playbook;
mod products;
mod repair;
pub mod step;

pub use facts::HostFacts;
pub use outcome::{FailureKind, HostStatus, ProcedureOutcome};
pub use params::{dry_run_flag, Prepared, Secret, ValidationError};
pub use step::{Finish, Halt, StepContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcedureKind {
    ForwarderInstall,
    EnterpriseInstall,
    StreamWorkerInstall,
    StreamLeaderInstall,
    PermissionRepair,
    CustomCommand,
    CustomScript,
    Playbook,
}

impl ProcedureKind {
    pub const ALL: [ProcedureKind; 8] = [
        ProcedureKind::ForwarderInstall,
        ProcedureKind::EnterpriseInstall,
        ProcedureKind::StreamWorkerInstall,
        ProcedureKind::StreamLeaderInstall,
        ProcedureKind::PermissionRepair,
        ProcedureKind::CustomCommand,
        ProcedureKind::CustomScript,
        ProcedureKind::Playbook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureKind::ForwarderInstall => "forwarder-install",
            ProcedureKind::EnterpriseInstall => "enterprise-install",
            ProcedureKind::StreamWorkerInstall => "stream-worker-install",
            ProcedureKind::StreamLeaderInstall => "stream-leader-install",
            ProcedureKind::PermissionRepair => "permission-repair",
            ProcedureKind::CustomCommand => "custom-command",
            ProcedureKind::CustomScript => "custom-script",
            ProcedureKind::Playbook => "playbook",
        }
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown procedure kind `{0}`")]
pub struct UnknownKind(String);

impl FromStr for ProcedureKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcedureKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Result of a connection probe.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    host: String,
    reachable: bool,
    elapsed: Duration,
    message: String,
}

/// Runs procedures against hosts. Cheap to clone and share between jobs.
#[derive(Debug, Clone)]
pub struct ProcedureLibrary {
    config: Arc<EngineConfig>,
    connections: ConnectionManager,
    packages: Arc<dyn PackageInventory>,
    sink: Arc<dyn StepSink>,
}

impl ProcedureLibrary {
    pub fn new(config: Arc<EngineConfig>, packages: Arc<dyn PackageInventory>) -> Self {
        Self {
            connections: ConnectionManager::new(config.ssh.clone()),
            config,
            packages,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_connections(mut self, connections: ConnectionManager) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn StepSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check parameters without touching any host.
    pub fn validate(&self, kind: ProcedureKind, params: &Value) -> Result<Prepared, ValidationError> {
        params::prepare(kind, params, &self.config)
    }

    /// Run one procedure against one host. `host` is the name used in step
    /// events and log lines.
    #[tracing::instrument(skip(self, target, params), fields(kind = %kind))]
    pub async fn run(
        &self,
        kind: ProcedureKind,
        host: &str,
        target: &HostTarget,
        params: &Value,
        is_dry_run: bool,
    ) -> ProcedureOutcome {
        let dry_run = is_dry_run || dry_run_flag(params);
        let prepared = match self.validate(kind, params) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("{} on {}: {}", kind, host, err);
                return ProcedureOutcome::invalid(&err, dry_run);
            }
        };

        let mut session = match self.connections.connect(target).await {
            Ok(session) => session,
            Err(err) => return ProcedureOutcome::offline(&err, dry_run),
        };

        let config = self.config.as_ref();
        let architecture = match &prepared {
            Prepared::Install(spec) => spec
                .architecture
                .clone()
                .or_else(|| target.architecture().clone())
                .unwrap_or_else(|| config.install.default_architecture.clone()),
            _ => config.install.default_architecture.clone(),
        };

        let outcome = {
            let mut ctx = StepContext::new(
                session.as_mut(),
                self.sink.as_ref(),
                host,
                dry_run,
                config.timeouts.command(),
            );
            let result = match &prepared {
                Prepared::Install(spec) => {
                    let env = install::InstallEnv {
                        config,
                        packages: self.packages.as_ref(),
                        architecture,
                    };
                    install::install(&mut ctx, &env, spec).await
                }
                Prepared::Repair(spec) => repair::repair(&mut ctx, spec, config).await,
                Prepared::Command(spec) => custom::command(&mut ctx, spec, config).await,
                Prepared::Script(spec) => custom::script(&mut ctx, spec, config).await,
                Prepared::Playbook(spec) => playbook::playbook(&mut ctx, spec, config).await,
            };
            ctx.finish(result)
        };

        self.connections.disconnect(session.as_mut()).await;
        if *outcome.success() {
            info!("{} on {}: {}", kind, host, outcome.message());
        } else {
            error!("{} on {}: {}", kind, host, outcome.message());
        }
        outcome
    }

    /// Connect, run `echo`, and report how long it took.
    #[tracing::instrument(skip(self, target))]
    pub async fn probe(&self, host: &str, target: &HostTarget) -> ProbeReport {
        let start = Instant::now();
        let mut session = match self.connections.connect(target).await {
            Ok(session) => session,
            Err(err) => {
                return ProbeReport {
                    host: host.to_string(),
                    reachable: false,
                    elapsed: start.elapsed(),
                    message: err.to_string(),
                }
            }
        };

        let echo = ShellCommand::new("echo").arg("siemply-probe");
        let result = CommandRunner
            .run(session.as_mut(), &echo, self.config.timeouts.command())
            .await;
        self.connections.disconnect(session.as_mut()).await;

        let (reachable, message) = match result {
            Ok(result) if result.success() => (true, "connection ok".to_string()),
            Ok(result) => (false, format!("echo failed: {}", result.diagnostic())),
            Err(err) => (false, err.to_string()),
        };
        ProbeReport {
            host: host.to_string(),
            reachable,
            elapsed: start.elapsed(),
            message,
        }
    }

    /// Read OS, CPU, memory, disk and uptime facts. Changes nothing on the
    /// host; facts that cannot be read are listed in [`HostFacts::errors`].
    #[tracing::instrument(skip(self, target))]
    pub async fn facts(&self, host: &str, target: &HostTarget) -> HostFacts {
        let mut session = match self.connections.connect(target).await {
            Ok(session) => session,
            Err(err) => return HostFacts::unreachable(host, err.to_string()),
        };
        let facts = facts::gather(host, session.as_mut(), self.config.timeouts.command()).await;
        self.connections.disconnect(session.as_mut()).await;
        facts
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use color_eyre::eyre::Result;
    use serde_json::json;

    use super::*;
    use crate::audit::ChannelSink;
    use crate::executor::ExecutorKind;
    use crate::inventory::packages::Package;
    use crate::inventory::{PackageCatalog, PackageType};
    use crate::testing::{FailingTransport, FakeHost};

    fn library(host: &FakeHost) -> ProcedureLibrary {
        let catalog = PackageCatalog::new(vec![
            Package::new(PackageType::SplunkUf, "9.4.3")
                .with_download("x86_64", "https://dl.example/splunkforwarder-9.4.3-Linux-x86_64.tgz"),
            Package::new(PackageType::SplunkEnterprise, "9.4.3")
                .with_download("x86_64", "https://dl.example/splunk-9.4.3-Linux-x86_64.tgz"),
            Package::new(PackageType::CriblStreamWorker, "4.5.0")
                .with_download("x86_64", "https://dl.example/cribl-4.5.0-linux-x64.tgz"),
            Package::new(PackageType::CriblStreamLeader, "4.5.0")
                .with_download("x86_64", "https://dl.example/cribl-4.5.0-linux-x64.tgz"),
        ]);
        let config = Arc::new(EngineConfig::default());
        ProcedureLibrary::new(config.clone(), Arc::new(catalog)).with_connections(
            ConnectionManager::new(config.ssh.clone()).with_transport(ExecutorKind::Ssh, host.transport()),
        )
    }

    fn target() -> HostTarget {
        HostTarget::new("10.0.0.5").with_password("pw")
    }

    fn forwarder() -> Value {
        json!({"version": "9.4.3", "admin_password": "changeme"})
    }

    fn step_names(outcome: &ProcedureOutcome) -> Vec<String> {
        outcome.steps().iter().map(|s| s.name().clone()).collect()
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ProcedureKind::ALL {
            assert_eq!(Ok(kind), kind.to_string().parse());
        }
        assert!("splunk-install".parse::<ProcedureKind>().is_err());
    }

    #[tokio::test]
    async fn test_forwarder_install_on_fresh_host() -> Result<()> {
        let host = FakeHost::new().creates_on("tar -xzf", "/opt/splunkforwarder");
        let outcome = library(&host)
            .run(ProcedureKind::ForwarderInstall, "web01", &target(), &forwarder(), false)
            .await;

        assert!(*outcome.success(), "{}", outcome.message());
        assert!(!*outcome.skipped());
        assert_eq!(
            vec![
                "existence-check",
                "prepare-user",
                "download",
                "integrity-check",
                "extract",
                "chown",
                "seed-config",
                "start",
                "enable-boot-start",
                "verify",
                "cleanup",
            ],
            step_names(&outcome)
        );
        assert_eq!(11, host.commands().len());
        assert!(outcome.commands().iter().all(|c| !c.contains("changeme")));
        assert!(host.commands()[6].contains("changeme"));
        assert_eq!(1, host.closes());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_status_check_is_a_warning() -> Result<()> {
        let host = FakeHost::new()
            .creates_on("tar -xzf", "/opt/splunkforwarder")
            .on("bin/splunk status", 1, "", "splunkd is not running");
        let outcome = library(&host)
            .run(ProcedureKind::ForwarderInstall, "web01", &target(), &forwarder(), false)
            .await;

        assert!(*outcome.success(), "{}", outcome.message());
        assert_eq!(
            vec!["status check failed: splunkd is not running"],
            outcome.warnings().to_vec()
        );
        assert!(outcome.message().ends_with("completed with verification warning"));
        assert_eq!(1, *outcome.return_code());
        assert_eq!(Some(&"cleanup".to_string()), step_names(&outcome).last());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_start_falls_back_to_root() -> Result<()> {
        let host = FakeHost::new()
            .creates_on("tar -xzf", "/opt/splunkforwarder")
            .on("-c '/opt/splunkforwarder/bin/splunk start", 1, "", "permission denied");
        let outcome = library(&host)
            .run(ProcedureKind::ForwarderInstall, "web01", &target(), &forwarder(), false)
            .await;

        assert!(*outcome.success(), "{}", outcome.message());
        assert_eq!(
            vec![
                "existence-check",
                "prepare-user",
                "download",
                "integrity-check",
                "extract",
                "chown",
                "seed-config",
                "start",
                "start-as-root",
                "permission-fix",
                "enable-boot-start",
                "verify",
                "cleanup",
            ],
            step_names(&outcome)
        );
        let sent = host.commands();
        assert!(sent[8].starts_with("/opt/splunkforwarder/bin/splunk start"));
        assert_eq!("chown -R splunk:splunk /opt/splunkforwarder", sent[9]);
        assert!(outcome.warnings()[0].starts_with("starting as splunk failed"));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_root_start_fails_the_install() -> Result<()> {
        let host = FakeHost::new()
            .creates_on("tar -xzf", "/opt/splunkforwarder")
            .on("bin/splunk start", 1, "", "splunkd failed to bind 8089");
        let outcome = library(&host)
            .run(ProcedureKind::ForwarderInstall, "web01", &target(), &forwarder(), false)
            .await;

        assert!(!*outcome.success());
        assert_eq!(Some(FailureKind::Step), *outcome.failure());
        assert_eq!("splunkd failed to bind 8089", outcome.stderr());
        assert!(step_names(&outcome).contains(&"start-as-root".to_string()));
        assert!(!step_names(&outcome).contains(&"permission-fix".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_enterprise_install_with_custom_web_port() -> Result<()> {
        let host = FakeHost::new().creates_on("tar -xzf", "/opt/splunk");
        let params = json!({"version": "9.4.3", "admin_password": "s3cret", "web_port": 8080});
        let outcome = library(&host)
            .run(ProcedureKind::EnterpriseInstall, "idx01", &target(), &params, false)
            .await;

        assert!(*outcome.success(), "{}", outcome.message());
        assert_eq!(
            vec![
                "existence-check",
                "prepare-user",
                "download",
                "integrity-check",
                "extract",
                "chown",
                "seed-config",
                "web-port",
                "start",
                "enable-boot-start",
                "verify",
                "cleanup",
            ],
            step_names(&outcome)
        );
        let sent = host.commands();
        assert!(sent[2].contains("https://dl.example/splunk-9.4.3-Linux-x86_64.tgz"));
        assert!(sent[7].contains("/opt/splunk/etc/system/local/web.conf"));
        assert!(sent[7].contains("httpport = 8080"));
        assert!(outcome.commands().iter().all(|c| !c.contains("s3cret")));
        assert!(outcome.message().contains("installed at /opt/splunk"));
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_worker_install_joins_its_leader() -> Result<()> {
        let host = FakeHost::new().creates_on("tar -xzf", "/opt/cribl");
        let params = json!({"version": "4.5.0", "leader_host": "leader.local", "auth_token": "tok3n"});
        let outcome = library(&host)
            .run(ProcedureKind::StreamWorkerInstall, "edge01", &target(), &params, false)
            .await;

        assert!(*outcome.success(), "{}", outcome.message());
        assert_eq!(
            vec![
                "existence-check",
                "prepare-user",
                "download",
                "integrity-check",
                "extract",
                "chown",
                "worker-mode",
                "systemd-unit",
                "start",
                "enable-boot-start",
                "verify",
                "cleanup",
            ],
            step_names(&outcome)
        );
        let sent = host.commands();
        assert!(sent[6].contains("mode-worker -H") && sent[6].contains("tok3n"));
        assert!(sent[7].contains("/etc/systemd/system/cribl.service"));
        assert_eq!("systemctl start cribl", sent[8]);
        assert_eq!("systemctl is-active cribl", sent[10]);
        assert!(outcome.commands().iter().all(|c| !c.contains("tok3n")));
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_leader_tolerates_existing_admin() -> Result<()> {
        let host = FakeHost::new()
            .creates_on("tar -xzf", "/opt/cribl")
            .on("users create", 1, "", "user admin already exists");
        let params = json!({"version": "4.5.0", "admin_password": "pw", "api_port": 9100});
        let outcome = library(&host)
            .run(ProcedureKind::StreamLeaderInstall, "leader01", &target(), &params, false)
            .await;

        assert!(*outcome.success(), "{}", outcome.message());
        assert_eq!(
            vec![
                "existence-check",
                "prepare-user",
                "download",
                "integrity-check",
                "extract",
                "chown",
                "leader-mode",
                "admin-user",
                "api-port",
                "systemd-unit",
                "start",
                "enable-boot-start",
                "verify",
                "cleanup",
            ],
            step_names(&outcome)
        );
        assert_eq!(1, outcome.warnings().len());
        assert!(outcome.warnings()[0].contains("already exists"));
        assert!(host.commands()[8].contains("port: 9100"));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_install_is_skipped() -> Result<()> {
        let host = FakeHost::new().creates_on("tar -xzf", "/opt/splunkforwarder");
        let library = library(&host);
        library
            .run(ProcedureKind::ForwarderInstall, "web01", &target(), &forwarder(), false)
            .await;
        let sent = host.commands().len();

        let again = library
            .run(ProcedureKind::ForwarderInstall, "web01", &target(), &forwarder(), false)
            .await;
        assert!(*again.success());
        assert!(*again.skipped());
        assert_eq!(vec!["existence-check"], step_names(&again));
        assert_eq!(sent + 1, host.commands().len());
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_sends_only_the_probe() -> Result<()> {
        let host = FakeHost::new();
        let (sink, mut source) = ChannelSink::pair(64);
        let library = library(&host).with_sink(Arc::new(sink));
        let params = json!({"version": "9.4.3", "admin_password": "changeme", "is_dry_run": true});
        let outcome = library
            .run(ProcedureKind::ForwarderInstall, "web01", &target(), &params, false)
            .await;

        assert!(*outcome.success());
        assert!(*outcome.is_dry_run());
        assert!(outcome.commands().len() > 1);
        assert_eq!(1, host.commands().len());
        assert!(!host.has_dir("/opt/splunkforwarder"));
        assert_eq!(outcome.steps().len(), source.drain().len());
        Ok(())
    }

    #[tokio::test]
    async fn test_validation_happens_before_connecting() -> Result<()> {
        let host = FakeHost::new();
        let outcome = library(&host)
            .run(
                ProcedureKind::ForwarderInstall,
                "web01",
                &target(),
                &json!({"version": "9.4.3", "admin_password": ""}),
                false,
            )
            .await;
        assert!(!*outcome.success());
        assert_eq!(Some(FailureKind::Validation), *outcome.failure());
        assert_eq!(HostStatus::Unknown, *outcome.host_status());
        assert_eq!(0, host.connects());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_step_keeps_stderr_and_cleans_up() -> Result<()> {
        let host = FakeHost::new().on("tar -xzf", 2, "", "tar: invalid magic");
        let outcome = library(&host)
            .run(ProcedureKind::ForwarderInstall, "web01", &target(), &forwarder(), false)
            .await;
        assert!(!*outcome.success());
        assert_eq!(Some(FailureKind::Step), *outcome.failure());
        assert_eq!("tar: invalid magic", outcome.stderr());
        assert_eq!(Some(&"cleanup".to_string()), step_names(&outcome).last());
        assert_eq!(1, host.closes());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_release_fails_without_downloading() -> Result<()> {
        let host = FakeHost::new();
        let params = json!({"version": "8.0.0", "admin_password": "changeme"});
        let outcome = library(&host)
            .run(ProcedureKind::ForwarderInstall, "web01", &target(), &params, false)
            .await;
        assert!(!*outcome.success());
        assert!(outcome.message().contains("no download URL"));
        assert!(host.commands().iter().all(|c| !c.contains("curl")));
        Ok(())
    }

    #[tokio::test]
    async fn test_custom_command_runs_as_user() -> Result<()> {
        let host = FakeHost::new().on("uptime", 0, " 10:00 up 3 days\n", "");
        let outcome = library(&host)
            .run(
                ProcedureKind::CustomCommand,
                "web01",
                &target(),
                &json!({"command": "uptime", "run_as": "splunk"}),
                false,
            )
            .await;
        assert!(*outcome.success());
        assert_eq!(" 10:00 up 3 days\n", outcome.stdout());
        let sent = host.commands();
        assert!(sent[1].starts_with("su - splunk -c "));
        Ok(())
    }

    #[tokio::test]
    async fn test_script_is_removed_even_when_it_fails() -> Result<()> {
        let host = FakeHost::new().on("siemply_script_", 1, "", "boom");
        // Writing the script fails; removal is still attempted.
        let outcome = library(&host)
            .run(
                ProcedureKind::CustomScript,
                "web01",
                &target(),
                &json!({"script": "#!/bin/sh\nexit 1\n"}),
                false,
            )
            .await;
        assert!(!*outcome.success());
        let sent = host.commands();
        assert!(sent.last().is_some_and(|c| c.starts_with("rm -f /tmp/siemply_script_")));
        Ok(())
    }

    #[tokio::test]
    async fn test_playbook_registers_and_skips() -> Result<()> {
        let host = FakeHost::new().on("systemctl is-active", 3, "inactive\n", "");
        let params = json!({
            "playbook": {
                "name": "restart if down",
                "tasks": [
                    {"name": "status", "command": "systemctl is-active {{ unit }} || true", "register": "status"},
                    {"name": "start", "command": "systemctl start {{ unit }}", "when": "status.stdout == inactive"},
                    {"name": "never", "command": "reboot", "when": "status.stdout == active"}
                ]
            },
            "vars": {"unit": "cribl"}
        });
        let outcome = library(&host)
            .run(ProcedureKind::Playbook, "web01", &target(), &params, false)
            .await;
        // The fake answers the whole line, so `|| true` does not help.
        assert!(!*outcome.success());
        assert_eq!(vec!["status"], step_names(&outcome));

        let host = FakeHost::new().on("systemctl is-active", 0, "inactive\n", "");
        let outcome = library(&host)
            .run(ProcedureKind::Playbook, "web01", &target(), &params, false)
            .await;
        assert!(*outcome.success(), "{}", outcome.message());
        assert_eq!(vec!["status", "start"], step_names(&outcome));
        assert_eq!("playbook `restart if down`: 2 task(s) run, 1 skipped", outcome.message());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_is_offline() -> Result<()> {
        let config = Arc::new(EngineConfig::default());
        let library = ProcedureLibrary::new(config.clone(), Arc::new(PackageCatalog::default()))
            .with_connections(
                ConnectionManager::new(config.ssh.clone())
                    .with_transport(ExecutorKind::Ssh, Arc::new(FailingTransport::default())),
            );
        let outcome = library
            .run(ProcedureKind::CustomCommand, "web01", &target(), &json!({"command": "true"}), false)
            .await;
        assert!(!*outcome.success());
        assert_eq!(HostStatus::Offline, *outcome.host_status());
        assert_eq!(Some(FailureKind::Offline), *outcome.failure());

        let report = library.probe("web01", &target()).await;
        assert!(!*report.reachable());
        Ok(())
    }

    #[tokio::test]
    async fn test_probe_reports_reachable_host() -> Result<()> {
        let host = FakeHost::new();
        let report = library(&host).probe("web01", &target()).await;
        assert!(*report.reachable());
        assert_eq!(vec!["echo siemply-probe"], host.commands());
        assert_eq!(1, host.closes());
        Ok(())
    }

    #[tokio::test]
    async fn test_facts_are_read_over_one_session() -> Result<()> {
        let host = FakeHost::new()
            .on("uname -r", 0, "6.1.0-18-amd64\n", "")
            .on("nproc", 0, "2\n", "");
        let facts = library(&host).facts("web01", &target()).await;

        assert!(*facts.reachable());
        assert_eq!("web01", facts.host());
        assert_eq!(Some("6.1.0-18-amd64"), facts.os().kernel().as_deref());
        assert_eq!(Some(2), *facts.cpu().cores());
        assert_eq!(1, host.connects());
        assert_eq!(1, host.closes());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_facts_of_unreachable_host() -> Result<()> {
        let config = Arc::new(EngineConfig::default());
        let library = ProcedureLibrary::new(config.clone(), Arc::new(PackageCatalog::default()))
            .with_connections(
                ConnectionManager::new(config.ssh.clone())
                    .with_transport(ExecutorKind::Ssh, Arc::new(FailingTransport::default())),
            );
        let facts = library.facts("web01", &target()).await;
        assert!(!*facts.reachable());
        assert!(facts.errors().is_empty());
        assert!(facts.memory().is_none());
        Ok(())
    }
}
