//! Parameter parsing and validation.
//!
//! Parameters arrive as a JSON object. Each procedure kind turns them into a
//! typed spec here, before any connection is opened, filling gaps from the
//! [`EngineConfig`].

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use super::ProcedureKind;
use crate::config::EngineConfig;
use crate::plan::Playbook;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("parameters must be a JSON object")]
    NotAnObject,
    #[error("missing required parameter `{0}`")]
    Missing(String),
    #[error("parameter `{name}` {reason}")]
    Invalid { name: String, reason: String },
}

impl ValidationError {
    fn invalid<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        ValidationError::Invalid {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// A value that must never show up in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Product {
    Forwarder {
        admin_password: Secret,
        deployment_server: Option<String>,
    },
    Enterprise {
        admin_password: Secret,
        web_port: u16,
    },
    StreamWorker {
        leader_host: String,
        leader_port: u16,
        auth_token: Secret,
    },
    StreamLeader {
        admin_password: Option<Secret>,
        api_port: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSpec {
    pub product: Product,
    pub version: String,
    pub install_dir: String,
    pub user: String,
    pub group: String,
    pub architecture: Option<String>,
    pub download_url: Option<String>,
}

impl InstallSpec {
    /// Where the product lives once extracted.
    pub fn home(&self) -> String {
        join(&self.install_dir, self.product.dir_name())
    }
}

/// Which installed product a permission repair targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTarget {
    Forwarder,
    Enterprise,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairSpec {
    pub target: RepairTarget,
    pub install_dir: String,
    pub user: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub run_as: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSpec {
    pub script: String,
    pub run_as: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PlaybookSpec {
    pub playbook: Playbook,
    pub vars: Map<String, Value>,
}

/// Validated, typed parameters for one procedure kind.
#[derive(Debug, Clone)]
pub enum Prepared {
    Install(InstallSpec),
    Repair(RepairSpec),
    Command(CommandSpec),
    Script(ScriptSpec),
    Playbook(PlaybookSpec),
}

/// `is_dry_run` as carried in the parameters. Anything unreadable is false;
/// [`prepare`] reports it properly.
pub fn dry_run_flag(params: &Value) -> bool {
    params
        .get("is_dry_run")
        .map(|v| matches!(v, Value::Bool(true)) || v.as_str() == Some("true"))
        .unwrap_or(false)
}

pub fn prepare(
    kind: ProcedureKind,
    params: &Value,
    config: &EngineConfig,
) -> Result<Prepared, ValidationError> {
    let p = Params::new(params)?;
    p.flag("is_dry_run")?;

    let prepared = match kind {
        ProcedureKind::ForwarderInstall => {
            let product = Product::Forwarder {
                admin_password: p.secret("admin_password")?,
                deployment_server: p.endpoint("deployment_server")?,
            };
            Prepared::Install(p.install(product, &config.forwarder.user, &config.forwarder.group, config)?)
        }
        ProcedureKind::EnterpriseInstall => {
            let product = Product::Enterprise {
                admin_password: p.secret("admin_password")?,
                web_port: p.port("web_port")?.unwrap_or(config.enterprise.web_port),
            };
            let splunk = &config.enterprise.splunk;
            Prepared::Install(p.install(product, &splunk.user, &splunk.group, config)?)
        }
        ProcedureKind::StreamWorkerInstall => {
            let leader_host = p.required("leader_host")?;
            check_host("leader_host", &leader_host)?;
            let product = Product::StreamWorker {
                leader_host,
                leader_port: p.port("leader_port")?.unwrap_or(config.stream.leader_port),
                auth_token: p.secret("auth_token")?,
            };
            Prepared::Install(p.install(product, &config.stream.user, &config.stream.group, config)?)
        }
        ProcedureKind::StreamLeaderInstall => {
            let product = Product::StreamLeader {
                admin_password: p.optional("admin_password")?.map(Secret::new),
                api_port: p.port("api_port")?.unwrap_or(config.stream.api_port),
            };
            Prepared::Install(p.install(product, &config.stream.user, &config.stream.group, config)?)
        }
        ProcedureKind::PermissionRepair => {
            let product = p.required("product")?;
            let (target, user, group) = match product.as_str() {
                "forwarder" => (RepairTarget::Forwarder, &config.forwarder.user, &config.forwarder.group),
                "enterprise" => (
                    RepairTarget::Enterprise,
                    &config.enterprise.splunk.user,
                    &config.enterprise.splunk.group,
                ),
                "stream" => (RepairTarget::Stream, &config.stream.user, &config.stream.group),
                other => {
                    return Err(ValidationError::invalid(
                        "product",
                        format!("must be one of forwarder, enterprise, stream (got `{other}`)"),
                    ))
                }
            };
            Prepared::Repair(RepairSpec {
                target,
                install_dir: p.directory("install_dir", &config.install.base_dir)?,
                user: p.account("user", user)?,
                group: p.account("group", group)?,
            })
        }
        ProcedureKind::CustomCommand => Prepared::Command(CommandSpec {
            command: p.required("command")?,
            run_as: p.run_as()?,
            timeout_secs: p.seconds("timeout")?,
        }),
        ProcedureKind::CustomScript => Prepared::Script(ScriptSpec {
            // Older callers send the script body as `command`.
            script: match p.optional("script")? {
                Some(script) => script,
                None => p
                    .optional("command")?
                    .ok_or_else(|| ValidationError::Missing("script".into()))?,
            },
            run_as: p.run_as()?,
            timeout_secs: p.seconds("timeout")?,
        }),
        ProcedureKind::Playbook => {
            let raw = p
                .get("playbook")
                .ok_or_else(|| ValidationError::Missing("playbook".into()))?;
            let playbook: Playbook = serde_json::from_value(raw.clone())
                .map_err(|err| ValidationError::invalid("playbook", err.to_string()))?;
            let problems = playbook.validate();
            if let Some(first) = problems.first() {
                return Err(ValidationError::invalid("playbook", first.clone()));
            }
            let vars = match p.get("vars") {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(vars)) => vars.clone(),
                Some(_) => return Err(ValidationError::invalid("vars", "must be an object")),
            };
            Prepared::Playbook(PlaybookSpec { playbook, vars })
        }
    };
    Ok(prepared)
}

struct Params<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Params<'a> {
    fn new(value: &'a Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Ok(Self { map: Some(map) }),
            Value::Null => Ok(Self { map: None }),
            _ => Err(ValidationError::NotAnObject),
        }
    }

    fn get(&self, name: &str) -> Option<&'a Value> {
        self.map.and_then(|m| m.get(name))
    }

    /// Strings and numbers are accepted; blank strings count as absent.
    fn optional(&self, name: &str) -> Result<Option<String>, ValidationError> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(ValidationError::invalid(name, "must be a string")),
        }
    }

    fn required(&self, name: &str) -> Result<String, ValidationError> {
        self.optional(name)?
            .ok_or_else(|| ValidationError::Missing(name.to_string()))
    }

    fn secret(&self, name: &str) -> Result<Secret, ValidationError> {
        self.required(name).map(Secret::new)
    }

    fn flag(&self, name: &str) -> Result<bool, ValidationError> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s == "true" => Ok(true),
            Some(Value::String(s)) if s == "false" => Ok(false),
            Some(_) => Err(ValidationError::invalid(name, "must be a boolean")),
        }
    }

    fn number(&self, name: &str) -> Result<Option<u64>, ValidationError> {
        match self.optional(name)? {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ValidationError::invalid(name, "must be a non-negative integer")),
        }
    }

    fn port(&self, name: &str) -> Result<Option<u16>, ValidationError> {
        match self.number(name)? {
            None => Ok(None),
            Some(port) if (1..=u16::MAX as u64).contains(&port) => Ok(Some(port as u16)),
            Some(_) => Err(ValidationError::invalid(name, "must be a port between 1 and 65535")),
        }
    }

    fn seconds(&self, name: &str) -> Result<Option<u64>, ValidationError> {
        match self.number(name)? {
            Some(0) => Err(ValidationError::invalid(name, "must be at least 1 second")),
            other => Ok(other),
        }
    }

    fn directory(&self, name: &str, default: &str) -> Result<String, ValidationError> {
        let dir = self.optional(name)?.unwrap_or_else(|| default.to_string());
        if !dir.starts_with('/') {
            return Err(ValidationError::invalid(name, "must be an absolute path"));
        }
        let dir = dir.trim_end_matches('/');
        Ok(if dir.is_empty() { "/".into() } else { dir.to_string() })
    }

    fn account(&self, name: &str, default: &str) -> Result<String, ValidationError> {
        let account = self.optional(name)?.unwrap_or_else(|| default.to_string());
        check_account(name, &account)?;
        Ok(account)
    }

    /// `run_as`, or its older spelling `run_user`. Naming two different
    /// users is an error rather than a guess.
    fn run_as(&self) -> Result<Option<String>, ValidationError> {
        let user = match (self.optional("run_as")?, self.optional("run_user")?) {
            (Some(a), Some(b)) if a != b => {
                return Err(ValidationError::invalid(
                    "run_user",
                    format!("conflicts with run_as `{a}`"),
                ))
            }
            (Some(user), _) | (None, Some(user)) => Some(user),
            (None, None) => None,
        };
        match user {
            Some(user) if user == "root" => Ok(None),
            Some(user) => {
                check_account("run_as", &user)?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// `host` or `host:port`.
    fn endpoint(&self, name: &str) -> Result<Option<String>, ValidationError> {
        let Some(endpoint) = self.optional(name)? else {
            return Ok(None);
        };
        let host = match endpoint.rsplit_once(':') {
            Some((host, port)) => {
                port.parse::<u16>()
                    .map_err(|_| ValidationError::invalid(name, "has an invalid port"))?;
                host
            }
            None => endpoint.as_str(),
        };
        check_host(name, host)?;
        Ok(Some(endpoint))
    }

    fn install(
        &self,
        product: Product,
        default_user: &str,
        default_group: &str,
        config: &EngineConfig,
    ) -> Result<InstallSpec, ValidationError> {
        let version = self.required("version")?;
        if !version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(ValidationError::invalid("version", "contains unexpected characters"));
        }
        let download_url = self.optional("download_url")?;
        if let Some(url) = &download_url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ValidationError::invalid("download_url", "must be an http(s) URL"));
            }
        }
        Ok(InstallSpec {
            product,
            version,
            install_dir: self.directory("install_dir", &config.install.base_dir)?,
            user: self.account("user", default_user)?,
            group: self.account("group", default_group)?,
            architecture: self.optional("architecture")?,
            download_url,
        })
    }
}

fn check_account(name: &str, account: &str) -> Result<(), ValidationError> {
    let mut chars = account.chars();
    let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    if valid_head
        && account.len() <= 32
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
    {
        Ok(())
    } else {
        Err(ValidationError::invalid(name, "is not a valid account name"))
    }
}

fn check_host(name: &str, host: &str) -> Result<(), ValidationError> {
    if !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        Ok(())
    } else {
        Err(ValidationError::invalid(name, "is not a valid host name"))
    }
}

pub(crate) fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_forwarder_defaults_come_from_config() {
        let mut config = EngineConfig::default();
        config.forwarder.user = "uf".into();
        let prepared = prepare(
            ProcedureKind::ForwarderInstall,
            &json!({"version": "9.4.3", "admin_password": "x"}),
            &config,
        )
        .unwrap();
        let Prepared::Install(spec) = prepared else {
            panic!("expected an install spec");
        };
        assert_eq!("/opt/splunkforwarder", spec.home());
        assert_eq!("uf", spec.user);
        assert_eq!("splunk", spec.group);
        assert!(format!("{spec:?}").contains("<redacted>"));
    }

    #[test]
    fn test_blank_password_is_missing() {
        let err = prepare(
            ProcedureKind::ForwarderInstall,
            &json!({"version": "9.4.3", "admin_password": "  "}),
            &EngineConfig::default(),
        )
        .unwrap_err();
        assert_eq!(ValidationError::Missing("admin_password".into()), err);
    }

    #[test]
    fn test_hostile_values_are_rejected() {
        let config = EngineConfig::default();
        let cases = [
            json!({"version": "9.4.3", "admin_password": "x", "user": "splunk; rm -rf /"}),
            json!({"version": "9.4.3", "admin_password": "x", "install_dir": "opt"}),
            json!({"version": "$(reboot)", "admin_password": "x"}),
            json!({"version": "9.4.3", "admin_password": "x", "deployment_server": "ds:99999"}),
        ];
        for params in cases {
            assert!(prepare(ProcedureKind::ForwarderInstall, &params, &config).is_err());
        }
    }

    #[test]
    fn test_ports_accept_strings_and_numbers() {
        let config = EngineConfig::default();
        for port in [json!(4300), json!("4300")] {
            let prepared = prepare(
                ProcedureKind::StreamWorkerInstall,
                &json!({"version": "4.5.0", "leader_host": "leader.local", "auth_token": "t", "leader_port": port}),
                &config,
            )
            .unwrap();
            let Prepared::Install(InstallSpec {
                product: Product::StreamWorker { leader_port, .. },
                ..
            }) = prepared
            else {
                panic!("expected a worker install");
            };
            assert_eq!(4300, leader_port);
        }
    }

    #[test]
    fn test_repair_requires_known_product() {
        let config = EngineConfig::default();
        assert!(matches!(
            prepare(ProcedureKind::PermissionRepair, &json!({"product": "nginx"}), &config),
            Err(ValidationError::Invalid { .. })
        ));
        assert!(matches!(
            prepare(ProcedureKind::PermissionRepair, &json!({}), &config),
            Err(ValidationError::Missing(_))
        ));
    }

    #[test]
    fn test_run_as_root_means_no_switch() {
        let prepared = prepare(
            ProcedureKind::CustomCommand,
            &json!({"command": "uptime", "run_as": "root"}),
            &EngineConfig::default(),
        )
        .unwrap();
        let Prepared::Command(spec) = prepared else {
            panic!("expected a command spec");
        };
        assert_eq!(None, spec.run_as);
        assert!(dry_run_flag(&json!({"is_dry_run": true})));
        assert!(!dry_run_flag(&json!({})));
    }

    #[test]
    fn test_run_user_is_honoured_as_run_as() {
        let config = EngineConfig::default();
        let prepared = prepare(
            ProcedureKind::CustomCommand,
            &json!({"command": "whoami", "run_user": "splunk"}),
            &config,
        )
        .unwrap();
        let Prepared::Command(spec) = prepared else {
            panic!("expected a command spec");
        };
        assert_eq!(Some("splunk".to_string()), spec.run_as);

        assert!(matches!(
            prepare(
                ProcedureKind::CustomCommand,
                &json!({"command": "whoami", "run_as": "splunk", "run_user": "cribl"}),
                &config,
            ),
            Err(ValidationError::Invalid { name, .. }) if name == "run_user"
        ));
        assert!(prepare(
            ProcedureKind::CustomCommand,
            &json!({"command": "whoami", "run_user": "bad user"}),
            &config,
        )
        .is_err());
    }

    #[test]
    fn test_script_body_may_arrive_as_command() {
        let config = EngineConfig::default();
        let prepared = prepare(
            ProcedureKind::CustomScript,
            &json!({"command": "echo hi", "run_user": "splunk"}),
            &config,
        )
        .unwrap();
        let Prepared::Script(spec) = prepared else {
            panic!("expected a script spec");
        };
        assert_eq!("echo hi", spec.script);
        assert_eq!(Some("splunk".to_string()), spec.run_as);
        assert_eq!(
            ValidationError::Missing("script".into()),
            prepare(ProcedureKind::CustomScript, &json!({}), &config).unwrap_err()
        );
    }
}
