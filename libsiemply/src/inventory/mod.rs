//! Host and package inventories.
//!
//! The engine only ever reads from these. [`HostConfig`] and
//! [`packages::PackageCatalog`] are YAML-backed reference implementations;
//! anything that can answer the lookups can stand in for them.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::executor::ExecutorKind;

pub mod packages;

pub use packages::{DownloadEntry, PackageCatalog, PackageInventory, PackageType};

pub type Port = u16;

/// Used only when a target reaches a transport without a resolved port.
pub const SSH_PORT: Port = 22;

/// Resolves a host reference to its connection descriptor.
#[async_trait]
pub trait HostInventory: Send + Sync + fmt::Debug {
    async fn resolve(&self, host: &str) -> Option<HostTarget>;
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    hosts: HashMap<String, HostTarget>,
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument]
    pub async fn load(path: &Path) -> Result<Self> {
        let hosts = fs::read_to_string(path)
            .await
            .wrap_err("Failed reading hosts file")?;
        serde_yaml::from_str(hosts.as_str()).wrap_err("deserializing hosts config")
    }

    pub fn with_host<S: Into<String>>(mut self, name: S, target: HostTarget) -> Self {
        self.hosts.insert(name.into(), target);
        self
    }

    pub fn with_group<S: Into<String>>(mut self, name: S, members: Vec<String>) -> Self {
        self.groups.insert(name.into(), members);
        self
    }

    /// Host names of a group, in declaration order. Unknown groups are empty.
    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups.get(group).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl HostInventory for HostConfig {
    async fn resolve(&self, host: &str) -> Option<HostTarget> {
        self.hosts.get(host).cloned()
    }
}

/// How to reach one host. Immutable for the duration of a job.
#[derive(Getters, Clone, Serialize, Deserialize)]
pub struct HostTarget {
    address: String,
    /// Unset means the configured `ssh.default_port`.
    #[serde(default)]
    port: Option<Port>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    key_path: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    executor: ExecutorKind,
}

impl HostTarget {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            port: None,
            username: None,
            password: None,
            key_path: None,
            timeout_secs: None,
            retries: None,
            architecture: None,
            executor: ExecutorKind::default(),
        }
    }

    pub fn with_port(mut self, port: Port) -> Self {
        self.port = Some(port);
        self
    }

    /// Fill in `port` unless the host names its own.
    pub fn with_default_port(mut self, port: Port) -> Self {
        self.port.get_or_insert(port);
        self
    }

    pub fn with_username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_key_path<S: Into<String>>(mut self, key_path: S) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_architecture<S: Into<String>>(mut self, architecture: S) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.executor = executor;
        self
    }

    /// `address:port`, used for connecting and in log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port.unwrap_or(SSH_PORT))
    }
}

impl fmt::Debug for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTarget")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("timeout_secs", &self.timeout_secs)
            .field("retries", &self.retries)
            .field("architecture", &self.architecture)
            .field("executor", &self.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;

    use super::*;

    #[tokio::test]
    async fn test_hosts_file_parses_with_defaults() -> Result<()> {
        let hosts: HostConfig = serde_yaml::from_str(
            r#"
hosts:
  web01:
    address: 10.0.0.5
    username: root
    key_path: ~/.ssh/id_ed25519
  edge01:
    address: 10.0.0.9
    port: 2222
    password: hunter2
    architecture: aarch64
    executor: local
groups:
  forwarders: [web01, edge01]
"#,
        )?;
        let web = hosts.resolve("web01").await.expect("web01");
        assert_eq!(None, *web.port());
        assert_eq!("10.0.0.5:2200", web.clone().with_default_port(2200).endpoint());
        assert_eq!(ExecutorKind::Ssh, *web.executor());
        let edge = hosts.resolve("edge01").await.expect("edge01");
        assert_eq!("10.0.0.9:2222", edge.endpoint());
        assert_eq!("10.0.0.9:2222", edge.clone().with_default_port(2200).endpoint());
        assert_eq!(ExecutorKind::Local, *edge.executor());
        assert!(hosts.resolve("db01").await.is_none());
        assert_eq!(vec!["web01", "edge01"], hosts.group_members("forwarders"));
        assert!(hosts.group_members("nope").is_empty());
        Ok(())
    }

    #[test]
    fn test_debug_output_hides_password() {
        let target = HostTarget::new("10.0.0.5").with_password("hunter2");
        let printed = format!("{target:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_hosts_built_in_code_resolve_like_parsed_ones() -> Result<()> {
        let hosts = HostConfig::new()
            .with_host(
                "edge01",
                HostTarget::new("10.0.0.9")
                    .with_port(2222)
                    .with_username("deploy")
                    .with_key_path("/keys/edge")
                    .with_architecture("aarch64")
                    .with_executor(ExecutorKind::Local),
            )
            .with_group("edge", vec!["edge01".into()]);
        let edge = hosts.resolve("edge01").await.expect("edge01");
        assert_eq!("10.0.0.9:2222", edge.endpoint());
        assert_eq!(Some("deploy"), edge.username().as_deref());
        assert_eq!(Some("/keys/edge"), edge.key_path().as_deref());
        assert_eq!(Some("aarch64"), edge.architecture().as_deref());
        assert_eq!(vec!["edge01"], hosts.group_members("edge"));
        Ok(())
    }
}
