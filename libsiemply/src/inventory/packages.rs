//! Package inventory: where to download a given product release from.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::log::*;

const GENERIC_ARCHITECTURES: &[&str] = &["any", "noarch", "generic"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    SplunkUf,
    SplunkEnterprise,
    CriblStreamLeader,
    CriblStreamWorker,
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageType::SplunkUf => "splunk_uf",
            PackageType::SplunkEnterprise => "splunk_enterprise",
            PackageType::CriblStreamLeader => "cribl_stream_leader",
            PackageType::CriblStreamWorker => "cribl_stream_worker",
        };
        f.write_str(name)
    }
}

/// Resolves a product release to candidate download URLs, best first.
#[async_trait]
pub trait PackageInventory: Send + Sync + fmt::Debug {
    async fn download_urls(
        &self,
        package: PackageType,
        version: &str,
        architecture: &str,
    ) -> Vec<String>;

    /// Expected SHA-256 of the release archive, lowercase hex, when known.
    async fn checksum(
        &self,
        _package: PackageType,
        _version: &str,
        _architecture: &str,
    ) -> Option<String> {
        None
    }
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct DownloadEntry {
    #[serde(default = "default_architecture")]
    architecture: String,
    url: String,
    /// SHA-256 of the archive behind `url`.
    #[serde(default)]
    checksum: Option<String>,
}

impl DownloadEntry {
    fn matches(&self, wanted: &str) -> bool {
        normalize_architecture(&self.architecture) == wanted
    }

    fn is_generic(&self) -> bool {
        GENERIC_ARCHITECTURES.contains(&self.architecture.to_ascii_lowercase().as_str())
    }
}

fn default_architecture() -> String {
    "x86_64".into()
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    package_type: PackageType,
    version: String,
    #[serde(default)]
    downloads: Vec<DownloadEntry>,
    /// Single architecture-independent URL, kept for catalogs that predate
    /// per-architecture entries.
    #[serde(default)]
    download_url: Option<String>,
}

impl Package {
    pub fn new<S: Into<String>>(package_type: PackageType, version: S) -> Self {
        Self {
            package_type,
            version: version.into(),
            downloads: vec![],
            download_url: None,
        }
    }

    pub fn with_download<A: Into<String>, U: Into<String>>(mut self, architecture: A, url: U) -> Self {
        self.downloads.push(DownloadEntry {
            architecture: architecture.into(),
            url: url.into(),
            checksum: None,
        });
        self
    }

    pub fn with_checked_download<A, U, C>(mut self, architecture: A, url: U, checksum: C) -> Self
    where
        A: Into<String>,
        U: Into<String>,
        C: Into<String>,
    {
        self.downloads.push(DownloadEntry {
            architecture: architecture.into(),
            url: url.into(),
            checksum: Some(checksum.into()),
        });
        self
    }
}

#[derive(Getters, Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageCatalog {
    #[serde(default)]
    packages: Vec<Package>,
}

impl PackageCatalog {
    pub fn new(packages: Vec<Package>) -> Self {
        Self { packages }
    }

    fn releases(&self, package: PackageType, version: &str) -> Vec<&Package> {
        self.packages
            .iter()
            .filter(|p| p.package_type == package && p.version == version)
            .collect()
    }

    #[tracing::instrument]
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .wrap_err("Failed reading package catalog")?;
        serde_yaml::from_str(&raw).wrap_err("deserializing package catalog")
    }
}

/// Canonical spelling of an architecture name as reported by `uname -m` or
/// by vendors' download pages.
pub fn normalize_architecture(architecture: &str) -> String {
    match architecture.trim().to_ascii_lowercase().as_str() {
        "amd64" | "x64" | "x86-64" => "x86_64".into(),
        "arm64" | "armv8" => "aarch64".into(),
        other => other.into(),
    }
}

#[async_trait]
impl PackageInventory for PackageCatalog {
    async fn download_urls(
        &self,
        package: PackageType,
        version: &str,
        architecture: &str,
    ) -> Vec<String> {
        let wanted = normalize_architecture(architecture);
        let releases = self.releases(package, version);

        let mut urls: Vec<String> = vec![];
        let mut push = |url: &str| {
            if !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        };
        for release in &releases {
            for entry in &release.downloads {
                if entry.matches(&wanted) {
                    push(&entry.url);
                }
            }
        }
        for release in &releases {
            for entry in &release.downloads {
                if entry.is_generic() {
                    push(&entry.url);
                }
            }
            if let Some(url) = &release.download_url {
                push(url);
            }
        }
        if urls.is_empty() {
            debug!("no {package} {version} download for {wanted}");
        }
        urls
    }

    async fn checksum(
        &self,
        package: PackageType,
        version: &str,
        architecture: &str,
    ) -> Option<String> {
        let wanted = normalize_architecture(architecture);
        let releases = self.releases(package, version);
        let entries = || releases.iter().flat_map(|release| release.downloads.iter());
        let checksum = entries()
            .filter(|entry| entry.matches(&wanted))
            .chain(entries().filter(|entry| entry.is_generic()))
            .find_map(|entry| entry.checksum.as_deref())?
            .trim()
            .to_ascii_lowercase();
        if checksum.len() == 64 && checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(checksum)
        } else {
            warn!("ignoring malformed checksum for {package} {version}: {checksum}");
            None
        }
    }
}
