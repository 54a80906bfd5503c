//! What differs between products: directories, configuration files, and how
//! each one is started, persisted and checked.

use super::params::{join, InstallSpec, Product, RepairTarget};
use crate::config::EngineConfig;
use crate::inventory::PackageType;
use crate::shell::ShellCommand;

/// One product-specific step. `tolerated` steps only warn on failure.
pub(crate) struct ProductStep {
    pub name: &'static str,
    pub command: ShellCommand,
    pub tolerated: bool,
}

impl ProductStep {
    fn required(name: &'static str, command: ShellCommand) -> Self {
        Self {
            name,
            command,
            tolerated: false,
        }
    }

    fn tolerated(name: &'static str, command: ShellCommand) -> Self {
        Self {
            name,
            command,
            tolerated: true,
        }
    }
}

impl Product {
    pub fn label(&self) -> &'static str {
        match self {
            Product::Forwarder { .. } => "Splunk Universal Forwarder",
            Product::Enterprise { .. } => "Splunk Enterprise",
            Product::StreamWorker { .. } => "Cribl Stream worker",
            Product::StreamLeader { .. } => "Cribl Stream leader",
        }
    }

    pub fn dir_name(&self) -> &'static str {
        self.repair_target().dir_name()
    }

    pub fn package(&self) -> PackageType {
        match self {
            Product::Forwarder { .. } => PackageType::SplunkUf,
            Product::Enterprise { .. } => PackageType::SplunkEnterprise,
            Product::StreamWorker { .. } => PackageType::CriblStreamWorker,
            Product::StreamLeader { .. } => PackageType::CriblStreamLeader,
        }
    }

    pub fn repair_target(&self) -> RepairTarget {
        match self {
            Product::Forwarder { .. } => RepairTarget::Forwarder,
            Product::Enterprise { .. } => RepairTarget::Enterprise,
            Product::StreamWorker { .. } | Product::StreamLeader { .. } => RepairTarget::Stream,
        }
    }
}

impl RepairTarget {
    pub fn dir_name(&self) -> &'static str {
        match self {
            RepairTarget::Forwarder => "splunkforwarder",
            RepairTarget::Enterprise => "splunk",
            RepairTarget::Stream => "cribl",
        }
    }

    /// Directory holding credentials, kept at mode 700.
    pub fn auth_dir(&self, home: &str) -> String {
        match self {
            RepairTarget::Forwarder | RepairTarget::Enterprise => join(home, "etc/auth"),
            RepairTarget::Stream => join(home, "local/cribl/auth"),
        }
    }

    pub fn is_splunk(&self) -> bool {
        !matches!(self, RepairTarget::Stream)
    }
}

fn splunk(home: &str) -> ShellCommand {
    ShellCommand::new(join(home, "bin/splunk"))
}

fn cribl(home: &str) -> ShellCommand {
    ShellCommand::new(join(home, "bin/cribl"))
}

fn systemctl(action: &str, service: &str) -> ShellCommand {
    ShellCommand::new("systemctl").args([action, service])
}

fn chown(owner: &str, path: &str) -> ShellCommand {
    ShellCommand::new("chown").args([owner, path])
}

/// Write a config file owned by the product user.
fn owned_file(path: String, content: String, owner: &str) -> ShellCommand {
    ShellCommand::write_file(path.clone(), content).and(chown(owner, &path))
}

const SPLUNK_ACCEPT: [&str; 3] = ["--accept-license", "--answer-yes", "--no-prompt"];

/// Configuration written between extraction and the first start.
pub(crate) fn configure(spec: &InstallSpec, config: &EngineConfig) -> Vec<ProductStep> {
    let home = spec.home();
    let owner = format!("{}:{}", spec.user, spec.group);
    let local = join(&home, "etc/system/local");
    let mut steps = vec![];

    match &spec.product {
        Product::Forwarder {
            admin_password,
            deployment_server,
        } => {
            steps.push(seed(&local, &config.forwarder.admin_username, admin_password.expose(), &owner));
            if let Some(server) = deployment_server {
                steps.push(ProductStep::required(
                    "deployment-client",
                    owned_file(
                        join(&local, "deploymentclient.conf"),
                        format!(
                            "[deployment-client]\n\n[target-broker:deploymentServer]\ntargetUri = {server}"
                        ),
                        &owner,
                    ),
                ));
            }
        }
        Product::Enterprise {
            admin_password,
            web_port,
        } => {
            steps.push(seed(
                &local,
                &config.enterprise.splunk.admin_username,
                admin_password.expose(),
                &owner,
            ));
            if *web_port != config.enterprise.web_port {
                steps.push(ProductStep::required(
                    "web-port",
                    owned_file(
                        join(&local, "web.conf"),
                        format!("[settings]\nhttpport = {web_port}"),
                        &owner,
                    ),
                ));
            }
        }
        Product::StreamWorker {
            leader_host,
            leader_port,
            auth_token,
        } => {
            steps.push(ProductStep::required(
                "worker-mode",
                cribl(&home)
                    .args(["mode-worker", "-H", &format!("{leader_host}:{leader_port}"), "-u"])
                    .secret(auth_token.expose())
                    .as_user(&spec.user),
            ));
            steps.push(unit(spec, config, "Cribl Stream Worker"));
        }
        Product::StreamLeader {
            admin_password,
            api_port,
        } => {
            steps.push(ProductStep::required(
                "leader-mode",
                cribl(&home).arg("mode-master").as_user(&spec.user),
            ));
            if let Some(password) = admin_password {
                steps.push(ProductStep::tolerated(
                    "admin-user",
                    cribl(&home)
                        .args(["users", "create", "-u", &config.stream.admin_username, "-p"])
                        .secret(password.expose())
                        .args(["-r", "admin"])
                        .as_user(&spec.user),
                ));
            }
            if *api_port != config.stream.api_port {
                let system = join(&home, "local/_system");
                steps.push(ProductStep::required(
                    "api-port",
                    ShellCommand::new("mkdir").args(["-p", &system]).and(owned_file(
                        join(&system, "instance.yml"),
                        format!("api:\n  host: 0.0.0.0\n  port: {api_port}"),
                        &owner,
                    )),
                ));
            }
            steps.push(unit(spec, config, "Cribl Stream Leader"));
        }
    }
    steps
}

fn seed(local: &str, admin: &str, password: &str, owner: &str) -> ProductStep {
    let path = join(local, "user-seed.conf");
    ProductStep::required(
        "seed-config",
        ShellCommand::write_secret_file(
            path.clone(),
            format!("[user_info]\nUSERNAME = {admin}\nPASSWORD = {password}"),
        )
        .and(ShellCommand::new("chmod").args(["600", &path]))
        .and(chown(owner, &path)),
    )
}

fn unit(spec: &InstallSpec, config: &EngineConfig, description: &str) -> ProductStep {
    let cribl = join(&spec.home(), "bin/cribl");
    let content = format!(
        "[Unit]\nDescription={description}\nAfter=network.target\n\n\
         [Service]\nType=forking\nUser={user}\nGroup={group}\n\
         ExecStart={cribl} start\nExecStop={cribl} stop\nRestart=on-failure\nRestartSec=5\n\n\
         [Install]\nWantedBy=multi-user.target",
        user = spec.user,
        group = spec.group,
    );
    ProductStep::required(
        "systemd-unit",
        ShellCommand::write_file(
            format!("/etc/systemd/system/{}.service", config.stream.service_name),
            content,
        )
        .and(ShellCommand::new("systemctl").arg("daemon-reload")),
    )
}

/// Start under the product's own user.
pub(crate) fn start(spec: &InstallSpec, config: &EngineConfig) -> ShellCommand {
    if spec.product.repair_target().is_splunk() {
        splunk(&spec.home())
            .arg("start")
            .args(SPLUNK_ACCEPT)
            .as_user(&spec.user)
    } else {
        systemctl("start", &config.stream.service_name)
    }
}

/// Start as root, used when the unprivileged start fails.
pub(crate) fn start_as_root(spec: &InstallSpec) -> ShellCommand {
    if spec.product.repair_target().is_splunk() {
        splunk(&spec.home()).arg("start").args(SPLUNK_ACCEPT)
    } else {
        cribl(&spec.home()).arg("start")
    }
}

/// Persist across reboots.
pub(crate) fn enable(spec: &InstallSpec, config: &EngineConfig) -> ShellCommand {
    if spec.product.repair_target().is_splunk() {
        splunk(&spec.home())
            .args(["enable", "boot-start", "-user", &spec.user])
            .args(SPLUNK_ACCEPT)
    } else {
        systemctl("enable", &config.stream.service_name)
    }
}

pub(crate) fn verify(spec: &InstallSpec, config: &EngineConfig) -> ShellCommand {
    if spec.product.repair_target().is_splunk() {
        splunk(&spec.home()).arg("status")
    } else {
        systemctl("is-active", &config.stream.service_name)
    }
}

pub(crate) fn stop_service(target: RepairTarget, home: &str, user: &str, config: &EngineConfig) -> ShellCommand {
    if target.is_splunk() {
        splunk(home).arg("stop").as_user(user)
    } else {
        systemctl("stop", &config.stream.service_name).or(cribl(home).arg("stop"))
    }
}

pub(crate) fn restart_service(target: RepairTarget, home: &str, user: &str, config: &EngineConfig) -> ShellCommand {
    if target.is_splunk() {
        splunk(home).arg("start").args(SPLUNK_ACCEPT).as_user(user)
    } else {
        systemctl("start", &config.stream.service_name)
    }
}
