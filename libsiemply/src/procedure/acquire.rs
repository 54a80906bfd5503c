//! Getting a release archive onto the host and making sure it is one.

use std::time::Duration;

use super::params::InstallSpec;
use super::step::{Halt, StepContext};
use crate::inventory::PackageInventory;
use crate::log::*;
use crate::shell::ShellCommand;

/// Tries every URL with every method it knows, in order. `$1` is the output
/// path, the remaining arguments are URLs.
const FALLBACK_DOWNLOAD: &str = r#"out="$1"; shift
for url in "$@"; do
  if command -v curl >/dev/null 2>&1 && curl -fsSL -o "$out" "$url"; then exit 0; fi
  if command -v wget >/dev/null 2>&1 && wget -q -O "$out" "$url"; then exit 0; fi
  if command -v python3 >/dev/null 2>&1 && python3 -c 'import sys, urllib.request; urllib.request.urlretrieve(sys.argv[1], sys.argv[2])' "$url" "$out"; then exit 0; fi
done
echo "every download method failed" >&2
exit 1"#;

/// `$1` is the archive, `$2` the minimum size in bytes, `$3` the expected
/// SHA-256 or empty. Exit codes 3, 4 and 6 mean an HTML page, a truncated
/// file and a checksum mismatch respectively.
const VERIFY_ARCHIVE: &str = r#"f="$1"; min="$2"; sum="$3"
[ -f "$f" ] || { echo "archive $f is missing" >&2; exit 2; }
if head -c 512 "$f" | grep -qiE '<html|<!doctype'; then echo "downloaded file is an HTML page" >&2; exit 3; fi
size=$(wc -c < "$f")
[ "$size" -ge "$min" ] || { echo "archive is only $size bytes" >&2; exit 4; }
if [ -n "$sum" ]; then
  echo "$sum  $f" | sha256sum -c - >/dev/null 2>&1 || { echo "sha256 mismatch" >&2; exit 6; }
fi
tar -tzf "$f" >/dev/null || { echo "archive listing failed" >&2; exit 5; }"#;

/// Candidate URLs, best first. An explicit `download_url` replaces the
/// inventory lookup entirely.
pub(crate) async fn candidate_urls(
    packages: &dyn PackageInventory,
    spec: &InstallSpec,
    architecture: &str,
) -> Vec<String> {
    if let Some(url) = &spec.download_url {
        return vec![url.clone()];
    }
    packages
        .download_urls(spec.product.package(), &spec.version, architecture)
        .await
}

/// Checksum to hold the archive to. None for an explicit `download_url`,
/// which the catalog knows nothing about.
pub(crate) async fn expected_checksum(
    packages: &dyn PackageInventory,
    spec: &InstallSpec,
    architecture: &str,
) -> Option<String> {
    if spec.download_url.is_some() {
        return None;
    }
    packages
        .checksum(spec.product.package(), &spec.version, architecture)
        .await
}

pub(crate) fn archive_name(spec: &InstallSpec) -> String {
    format!("{}-{}.tgz", spec.product.package(), spec.version)
}

pub(crate) async fn download(
    ctx: &mut StepContext<'_>,
    urls: &[String],
    temp_dir: &str,
    archive: &str,
    timeout: Duration,
) -> Result<(), Halt> {
    let mkdir = || ShellCommand::new("mkdir").args(["-p", temp_dir]);

    for url in urls {
        let curl = mkdir().and(
            ShellCommand::new("curl")
                .args(["-fsSL", "--retry", "2", "-o", archive])
                .arg(url.as_str()),
        );
        if ctx.attempt_for("download", &curl, timeout).await?.success() {
            return Ok(());
        }
        let wget = mkdir().and(ShellCommand::new("wget").args(["-q", "-O", archive, url.as_str()]));
        if ctx.attempt_for("download", &wget, timeout).await?.success() {
            return Ok(());
        }
        debug!("curl and wget both failed for {}", url);
    }

    let mut args = vec![archive.to_string()];
    args.extend(urls.iter().cloned());
    let fallback = mkdir().and(ShellCommand::script(FALLBACK_DOWNLOAD, "siemply-download", args));
    let result = ctx.attempt_for("download", &fallback, timeout).await?;
    if result.success() {
        return Ok(());
    }
    if *result.timed_out() {
        return Err(Halt::Timeout {
            step: "download".into(),
            after: timeout,
        });
    }
    Err(Halt::failed(
        "download",
        format!(
            "could not download the release from {} URL(s) with curl, wget or the fallback script",
            urls.len()
        ),
    ))
}

pub(crate) async fn verify_archive(
    ctx: &mut StepContext<'_>,
    archive: &str,
    min_bytes: u64,
    checksum: Option<&str>,
    timeout: Duration,
) -> Result<(), Halt> {
    let check = ShellCommand::script(
        VERIFY_ARCHIVE,
        "siemply-verify",
        vec![
            archive.to_string(),
            min_bytes.to_string(),
            checksum.unwrap_or_default().to_string(),
        ],
    );
    let result = ctx.attempt_for("integrity-check", &check, timeout).await?;
    if result.success() {
        return Ok(());
    }
    if *result.timed_out() {
        return Err(Halt::Timeout {
            step: "integrity-check".into(),
            after: timeout,
        });
    }
    let message = match *result.exit_code() {
        3 => "downloaded file is an HTML page (most likely an error page), not a release archive"
            .to_string(),
        4 => format!("downloaded archive is smaller than {min_bytes} bytes and cannot be a release"),
        6 => "downloaded archive does not match the catalog's SHA-256 checksum".to_string(),
        _ => format!("downloaded file is not a valid archive: {}", result.diagnostic()),
    };
    Err(Halt::failed("integrity-check", message))
}
