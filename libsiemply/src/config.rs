//! Engine configuration.
//!
//! Every default that a procedure relies on (ports, users, directories,
//! timeouts, retry budgets) lives here and is injected into the engine, so
//! procedure bodies never carry literals of their own. All sections are
//! optional in the YAML form; missing keys fall back to [`Default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::log::*;

pub const ENV_SSH_USER: &str = "SIEMPLY_SSH_USER";
pub const ENV_SSH_KEY_PATH: &str = "SIEMPLY_SSH_KEY_PATH";
pub const ENV_SSH_TIMEOUT: &str = "SIEMPLY_SSH_TIMEOUT";
pub const ENV_SSH_RETRIES: &str = "SIEMPLY_SSH_RETRIES";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ssh: SshConfig,
    pub timeouts: TimeoutConfig,
    pub install: InstallConfig,
    pub forwarder: SplunkConfig,
    pub enterprise: EnterpriseConfig,
    pub stream: StreamConfig,
    pub engine: DispatchConfig,
}

impl EngineConfig {
    /// Read a YAML config file. The environment is applied on top.
    #[tracing::instrument]
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("failed reading config file {}", path.display()))?;
        let config: EngineConfig =
            serde_yaml::from_str(&raw).wrap_err("deserializing engine config")?;
        debug!("loaded engine config from {}", path.display());
        Ok(config.with_env())
    }

    /// Apply `SIEMPLY_SSH_*` overrides. Unparseable numbers are ignored with a
    /// warning rather than failing startup.
    pub fn with_env(self) -> Self {
        self.with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars<F: Fn(&str) -> Option<String>>(mut self, var: F) -> Self {
        if let Some(user) = var(ENV_SSH_USER) {
            self.ssh.default_user = user;
        }
        if let Some(path) = var(ENV_SSH_KEY_PATH) {
            self.ssh.key_path = Some(path);
        }
        if let Some(raw) = var(ENV_SSH_TIMEOUT) {
            match raw.parse() {
                Ok(secs) => self.ssh.connect_timeout_secs = secs,
                Err(_) => warn!("ignoring invalid {ENV_SSH_TIMEOUT}: {raw}"),
            }
        }
        if let Some(raw) = var(ENV_SSH_RETRIES) {
            match raw.parse() {
                Ok(retries) => self.ssh.retries = retries,
                Err(_) => warn!("ignoring invalid {ENV_SSH_RETRIES}: {raw}"),
            }
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub default_user: String,
    pub default_port: u16,
    /// Fallback private key used when a host has none of its own. `~` is
    /// expanded against the current user's home directory.
    pub key_path: Option<String>,
    pub connect_timeout_secs: u64,
    pub retries: u32,
    pub backoff_base_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            default_user: "admin".into(),
            default_port: 22,
            key_path: Some("~/.ssh/id_rsa".into()),
            connect_timeout_secs: 60,
            retries: 3,
            backoff_base_secs: 1,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn expanded_key_path(&self) -> Option<PathBuf> {
        self.key_path.as_deref().map(expand_home)
    }
}

/// Expand a leading `~/` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = directories::UserDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub command_secs: u64,
    pub download_secs: u64,
    pub extract_secs: u64,
    pub start_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: 60,
            download_secs: 300,
            extract_secs: 180,
            start_secs: 180,
        }
    }
}

impl TimeoutConfig {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    pub fn extract(&self) -> Duration {
        Duration::from_secs(self.extract_secs)
    }

    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub base_dir: String,
    /// Scratch directory for downloaded archives. Removed after every install.
    pub temp_dir: String,
    /// Directory for materialized custom scripts.
    pub script_dir: String,
    /// Anything smaller than this is not a real release archive.
    pub min_archive_bytes: u64,
    /// Architecture assumed for hosts that do not declare one.
    pub default_architecture: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            base_dir: "/opt".into(),
            temp_dir: "/tmp/siemply_install".into(),
            script_dir: "/tmp".into(),
            min_archive_bytes: 1024 * 1024,
            default_architecture: "x86_64".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplunkConfig {
    pub user: String,
    pub group: String,
    pub admin_username: String,
}

impl Default for SplunkConfig {
    fn default() -> Self {
        Self {
            user: "splunk".into(),
            group: "splunk".into(),
            admin_username: "admin".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnterpriseConfig {
    #[serde(flatten)]
    pub splunk: SplunkConfig,
    pub web_port: u16,
}

impl Default for EnterpriseConfig {
    fn default() -> Self {
        Self {
            splunk: SplunkConfig::default(),
            web_port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub user: String,
    pub group: String,
    pub admin_username: String,
    pub api_port: u16,
    pub leader_port: u16,
    pub service_name: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            user: "cribl".into(),
            group: "cribl".into(),
            admin_username: "admin".into(),
            api_port: 9000,
            leader_port: 4200,
            service_name: "cribl".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Hold a per-host lock for the duration of each job so two jobs never
    /// race on the same host's users, directories and services.
    pub serialize_per_host: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            serialize_per_host: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use color_eyre::eyre::Result;

    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() -> Result<()> {
        let config: EngineConfig = serde_yaml::from_str(
            "ssh:\n  retries: 5\nstream:\n  api_port: 9100\nenterprise:\n  user: indexer\n",
        )?;
        assert_eq!(5, config.ssh.retries);
        assert_eq!(60, config.ssh.connect_timeout_secs);
        assert_eq!(9100, config.stream.api_port);
        assert_eq!("cribl", config.stream.user);
        assert_eq!("indexer", config.enterprise.splunk.user);
        assert_eq!(8000, config.enterprise.web_port);
        assert_eq!("/opt", config.install.base_dir);
        assert!(config.engine.serialize_per_host);
        Ok(())
    }

    #[test]
    fn test_env_overrides_apply_and_bad_numbers_are_ignored() {
        let vars: HashMap<&str, &str> = [
            (ENV_SSH_USER, "ops"),
            (ENV_SSH_TIMEOUT, "not-a-number"),
            (ENV_SSH_RETRIES, "7"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::default().with_vars(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!("ops", config.ssh.default_user);
        assert_eq!(60, config.ssh.connect_timeout_secs);
        assert_eq!(7, config.ssh.retries);
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths_alone() {
        assert_eq!(PathBuf::from("/etc/key"), expand_home("/etc/key"));
    }
}
