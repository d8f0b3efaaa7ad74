//! Path normalization, repository-relative paths, and symlink discovery.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use walkdir::WalkDir;

/// Matches the repository name in `git remote show origin -n` output.
static GIT_REPO_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"URL.*/([\w-]*)(?:\.git)?").expect("valid regex"));

/// Directories never descended into during tree walks.
const IGNORED_DIRS: [&str; 2] = [".terraform", ".git"];

pub fn is_ignored_dir(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

/// Resolve `path` against the current working directory and normalize it.
pub fn get_absolute_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("failed to determine working directory")?
            .join(path)
    };
    Ok(normalize(&absolute))
}

/// Lexically remove `.` and `..` components without touching the
/// filesystem. Symlinks are deliberately not resolved, since link paths
/// are meaningful to the dependency graph.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component.as_os_str());
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Repository-relative state path for `dir`, like `my-repo/config/aws/app`.
///
/// The repository name comes from the `origin` remote and the relative
/// part starts at the repository's `config` directory, inclusive. Keeping
/// the `config` segment is load-bearing: the result names existing remote
/// state keys, so changing the shape would orphan state.
pub fn calc_repo_path(dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .arg("remote")
        .arg("show")
        .arg("origin")
        .arg("-n")
        .current_dir(dir)
        .output()
        .context("failed to invoke git")?;
    if !output.status.success() {
        bail!(
            "failed to inspect git remote in {}: {}",
            dir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let repo_name = parse_repo_name(&stdout)
        .with_context(|| format!("no origin remote URL found in {}", dir.display()))?;
    repo_path_from(&repo_name, dir)
}

/// Extract the repository name from `git remote show` output.
fn parse_repo_name(remote_output: &str) -> Option<String> {
    remote_output.lines().find_map(|line| {
        GIT_REPO_PATTERN
            .captures(line)
            .and_then(|captures| captures.get(1))
            .map(|name| name.as_str().to_string())
            .filter(|name| !name.is_empty())
    })
}

fn repo_path_from(repo_name: &str, dir: &Path) -> Result<String> {
    let dir_str = dir.to_string_lossy();
    let Some(at) = dir_str.find("/config/") else {
        bail!("{} is not under a config directory", dir.display());
    };
    // Skip only the leading slash so the `config` segment itself stays in
    // the key.
    let relative = &dir_str[at + 1..];
    Ok(format!("{repo_name}/{relative}"))
}

/// Map every symlinked directory under `root` to the set of links that
/// point at it. Keys are normalized link targets; values are the link
/// paths themselves.
pub fn get_symlinks(root: &Path) -> Result<BTreeMap<PathBuf, BTreeSet<PathBuf>>> {
    let mut symlinks: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|entry| {
        entry
            .file_name()
            .to_str()
            .is_none_or(|name| !is_ignored_dir(name))
    }) {
        let entry = entry.context("failed to walk directory tree")?;
        if !entry.path_is_symlink() {
            continue;
        }
        let link = entry.path();
        let target = std::fs::read_link(link)
            .with_context(|| format!("failed to read symlink {}", link.display()))?;
        let resolved = if target.is_absolute() {
            normalize(&target)
        } else {
            let base = link.parent().unwrap_or(root);
            normalize(&base.join(target))
        };
        symlinks
            .entry(resolved)
            .or_default()
            .insert(link.to_path_buf());
    }
    Ok(symlinks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_removes_dot_components() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("/a/b/")), PathBuf::from("/a/b"));
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[test]
    fn test_parse_repo_name_from_remote_output() {
        let output = "\
* remote origin
  Fetch URL: git@github.com:example/infra-live.git
  Push  URL: git@github.com:example/infra-live.git
";
        assert_eq!(parse_repo_name(output).as_deref(), Some("infra-live"));
    }

    #[test]
    fn test_parse_repo_name_https_without_suffix() {
        let output = "  Fetch URL: https://github.com/example/deploys\n";
        assert_eq!(parse_repo_name(output).as_deref(), Some("deploys"));
    }

    #[test]
    fn test_parse_repo_name_missing() {
        assert!(parse_repo_name("no remotes configured").is_none());
    }

    #[test]
    fn test_repo_path_from() {
        let path = Path::new("/home/user/infra/config/aws/app");
        assert_eq!(
            repo_path_from("infra", path).unwrap(),
            "infra/config/aws/app"
        );
    }

    #[test]
    fn test_repo_path_keeps_config_segment() {
        // The key addresses remote state, so the `config` segment must
        // survive the derivation for checkouts at any depth.
        for (dir, expected) in [
            ("/home/user/infra/config/aws/app", "infra/config/aws/app"),
            ("/srv/builds/x/infra/config/team/db", "infra/config/team/db"),
        ] {
            assert_eq!(repo_path_from("infra", Path::new(dir)).unwrap(), expected);
        }
    }

    #[test]
    fn test_repo_path_requires_config_segment() {
        assert!(repo_path_from("infra", Path::new("/home/user/infra/aws")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_get_symlinks_resolves_relative_targets() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("shared/network")).unwrap();
        std::fs::create_dir_all(root.join("env")).unwrap();
        std::os::unix::fs::symlink("../shared/network", root.join("env/network")).unwrap();

        let symlinks = get_symlinks(root).unwrap();
        let links = symlinks.get(&root.join("shared/network")).unwrap();
        assert!(links.contains(&root.join("env/network")));
    }
}
