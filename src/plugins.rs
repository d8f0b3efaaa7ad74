//! Downloads custom Terraform plugin binaries before a run.
//!
//! Plugins land in `~/.terraform.d/plugins`. A platform-specific URL
//! (`{url}/{os}/{arch}`) is tried first, falling back to the bare URL.
//! An etag sidecar file avoids re-downloading unchanged binaries.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::ui;

enum Fetch {
    Downloaded(Vec<u8>, Option<String>),
    NotModified,
    Unavailable,
}

/// Download every configured plugin. Fatal on failure: a run with a
/// missing plugin would only fail later, inside every node's `init`.
pub fn download_plugins(plugins: &BTreeMap<String, String>) -> Result<()> {
    if plugins.is_empty() {
        return Ok(());
    }
    let dir = plugin_dir()?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create plugin directory {}", dir.display()))?;
    for (name, url) in plugins {
        download_plugin(&dir, name, url)?;
    }
    Ok(())
}

fn plugin_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("failed to determine home directory")?;
    Ok(home.join(".terraform.d/plugins"))
}

fn candidate_urls(url: &str) -> [String; 2] {
    [
        format!("{url}/{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        url.to_string(),
    ]
}

fn download_plugin(dir: &Path, name: &str, url: &str) -> Result<()> {
    let dest = dir.join(name);
    let etag_path = dir.join(format!("{name}.etag"));
    // Only send the cached etag when the binary itself is still present.
    let etag = if dest.is_file() {
        fs::read_to_string(&etag_path).ok()
    } else {
        None
    };

    for candidate in candidate_urls(url) {
        match fetch(&candidate, etag.as_deref())? {
            Fetch::NotModified => {
                log::info!("plugin {name} is up to date");
                return Ok(());
            }
            Fetch::Downloaded(content, new_etag) => {
                fs::write(&dest, content)
                    .with_context(|| format!("failed to write plugin {}", dest.display()))?;
                make_executable(&dest)?;
                if let Some(new_etag) = new_etag {
                    fs::write(&etag_path, new_etag.trim_matches('"'))
                        .with_context(|| format!("failed to write {}", etag_path.display()))?;
                }
                ui::success(&format!("downloaded plugin {name}"));
                return Ok(());
            }
            Fetch::Unavailable => {
                log::info!("plugin {name} not available at {candidate}, trying fallback");
            }
        }
    }
    bail!("unable to download plugin {name} from {url}");
}

fn fetch(url: &str, etag: Option<&str>) -> Result<Fetch> {
    let mut request = ureq::get(url);
    if let Some(etag) = etag {
        request = request.header("if-none-match", etag);
    }
    match request.call() {
        Ok(mut response) => {
            let etag = response
                .headers()
                .get("etag")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let content = response
                .body_mut()
                .read_to_vec()
                .with_context(|| format!("failed to read response body from {url}"))?;
            Ok(Fetch::Downloaded(content, etag))
        }
        Err(ureq::Error::StatusCode(304)) => Ok(Fetch::NotModified),
        Err(ureq::Error::StatusCode(_)) => Ok(Fetch::Unavailable),
        Err(err) => Err(err).with_context(|| format!("failed to fetch {url}")),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_urls_prefer_platform_specific() {
        let candidates = candidate_urls("https://example.com/provider");
        assert!(candidates[0].starts_with("https://example.com/provider/"));
        assert!(candidates[0].contains(std::env::consts::OS));
        assert!(candidates[0].ends_with(std::env::consts::ARCH));
        assert_eq!(candidates[1], "https://example.com/provider");
    }

    #[test]
    fn test_empty_plugin_map_is_a_noop() {
        assert!(download_plugins(&BTreeMap::new()).is_ok());
    }
}
