//! Locating and merging wrapper config, variable, and backend files.
//!
//! Config files layer from the filesystem root down to the target
//! directory, so a team can set defaults near the repository root and
//! override them per environment or per stack.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hcl::Expression;
use rayon::prelude::*;
use serde_yaml::Value;
use thiserror::Error;

use crate::config::WrapperConfig;
use crate::config::merge::deep_merge;
use crate::paths;

/// File names (exact or suffix) recognized as wrapper config files.
pub const WRAPPER_CONFIG_SUFFIXES: [&str; 2] = [".tf_wrapper", ".tf_wrapper.yml"];

/// Suffix of Terraform variable files picked up automatically.
pub const AUTO_VARS_SUFFIX: &str = ".auto.tfvars";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid wrapper config merged from {files:?}")]
    Parse {
        files: Vec<PathBuf>,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid HCL in {path}")]
    Hcl {
        path: PathBuf,
        #[source]
        source: hcl::Error,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// File discovery
// ─────────────────────────────────────────────────────────────────────────────

/// Every wrapper config file that applies to `dir`, ordered from the
/// filesystem root down to `dir` itself. Files within one level sort by
/// name so merge order is stable.
pub fn find_wrapper_config_files(dir: &Path) -> Vec<PathBuf> {
    walk_down(dir, |name| {
        WRAPPER_CONFIG_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix))
    })
}

/// Every `*.auto.tfvars` file that applies to `dir`, root first.
pub fn find_variable_files(dir: &Path) -> Vec<PathBuf> {
    walk_down(dir, |name| name.ends_with(AUTO_VARS_SUFFIX))
}

fn walk_down(dir: &Path, matches: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut levels: Vec<&Path> = dir.ancestors().collect();
    levels.reverse();

    let mut found = Vec::new();
    for level in levels {
        let Ok(entries) = std::fs::read_dir(level) else {
            continue;
        };
        let mut here: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(&matches)
            })
            .collect();
        here.sort();
        found.extend(here);
    }
    found
}

// ─────────────────────────────────────────────────────────────────────────────
// Wrapper config parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Load and merge every wrapper config file applying to `dir`.
///
/// A directory with no config files gets the defaults. `depends_on`
/// entries are resolved relative to the file that declared them, so the
/// merged config only ever contains absolute paths.
pub fn parse_wrapper_configs(dir: &Path) -> Result<WrapperConfig, ConfigError> {
    let files = find_wrapper_config_files(dir);
    let mut merged = Value::Null;
    for file in &files {
        merged = deep_merge(merged, load_wrapper_value(file)?);
    }
    if merged.is_null() {
        return Ok(WrapperConfig::default());
    }
    serde_yaml::from_value(merged).map_err(|source| ConfigError::Parse { files, source })
}

/// Parse a single wrapper config file, without layering.
pub fn parse_wrapper_config_file(file: &Path) -> Result<WrapperConfig, ConfigError> {
    let value = load_wrapper_value(file)?;
    if value.is_null() {
        return Ok(WrapperConfig::default());
    }
    serde_yaml::from_value(value).map_err(|source| ConfigError::Parse {
        files: vec![file.to_path_buf()],
        source,
    })
}

fn load_wrapper_value(file: &Path) -> Result<Value, ConfigError> {
    let raw = std::fs::read_to_string(file).map_err(|source| ConfigError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    let mut value: Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: file.to_path_buf(),
        source,
    })?;
    if let Some(base) = file.parent() {
        normalize_depends_on(&mut value, base);
    }
    Ok(value)
}

/// Rewrite `depends_on` entries to absolute normalized paths, anchored at
/// the directory of the file that declared them.
fn normalize_depends_on(value: &mut Value, base: &Path) {
    let Some(depends_on) = value.get_mut("depends_on") else {
        return;
    };
    let Value::Sequence(entries) = depends_on else {
        return;
    };
    for entry in entries {
        if let Value::String(raw) = entry {
            let expanded = shellexpand::tilde(raw.as_str()).into_owned();
            let path = PathBuf::from(expanded);
            let absolute = if path.is_absolute() {
                path
            } else {
                base.join(path)
            };
            *raw = paths::normalize(&absolute).to_string_lossy().into_owned();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Variable files
// ─────────────────────────────────────────────────────────────────────────────

/// Merge every applicable `*.auto.tfvars` file into a flat string map.
/// Later (closer) files override earlier ones; non-scalar values are
/// skipped since the wrapper only interpolates scalars.
pub fn parse_variable_files(dir: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut variables = BTreeMap::new();
    for file in find_variable_files(dir) {
        let raw = std::fs::read_to_string(&file).map_err(|source| ConfigError::Io {
            path: file.clone(),
            source,
        })?;
        let body = hcl::parse(&raw).map_err(|source| ConfigError::Hcl {
            path: file.clone(),
            source,
        })?;
        for attr in body.attributes() {
            if let Some(value) = expression_to_string(attr.expr()) {
                variables.insert(attr.key().to_string(), value);
            }
        }
    }
    Ok(variables)
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend configuration
// ─────────────────────────────────────────────────────────────────────────────

/// A `backend` block found inside a `terraform` block of a `*.tf` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendBlock {
    S3(BTreeMap<String, String>),
    Gcs(BTreeMap<String, String>),
}

/// Scan the `*.tf` files directly in `dir` for a backend declaration.
/// Files are parsed in parallel; the first match in name order wins.
pub fn parse_backend_config_for_dir(dir: &Path) -> Result<Option<BackendBlock>, ConfigError> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(None);
    };
    let mut tf_files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "tf"))
        .collect();
    tf_files.sort();

    let parsed: Vec<Option<BackendBlock>> = tf_files
        .par_iter()
        .map(|file| backend_block_in_file(file))
        .collect::<Result<_, _>>()?;
    Ok(parsed.into_iter().flatten().next())
}

fn backend_block_in_file(file: &Path) -> Result<Option<BackendBlock>, ConfigError> {
    let raw = std::fs::read_to_string(file).map_err(|source| ConfigError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    let body = hcl::parse(&raw).map_err(|source| ConfigError::Hcl {
        path: file.to_path_buf(),
        source,
    })?;

    for terraform in body.blocks().filter(|b| b.identifier() == "terraform") {
        for backend in terraform
            .body()
            .blocks()
            .filter(|b| b.identifier() == "backend")
        {
            let Some(label) = backend.labels().first() else {
                continue;
            };
            let mut params = BTreeMap::new();
            for attr in backend.body().attributes() {
                if let Some(value) = expression_to_string(attr.expr()) {
                    params.insert(attr.key().to_string(), value);
                }
            }
            match label.as_str() {
                "s3" => return Ok(Some(BackendBlock::S3(params))),
                "gcs" => return Ok(Some(BackendBlock::Gcs(params))),
                _ => {}
            }
        }
    }
    Ok(None)
}

fn expression_to_string(expr: &Expression) -> Option<String> {
    match expr {
        Expression::String(s) => Some(s.clone()),
        Expression::Bool(b) => Some(b.to_string()),
        Expression::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Compute the `-backend-config` flags for `terraform init`.
///
/// Defaults derive from the repository-relative path and the merged
/// variable files; wrapper config overrides layer on top. Flags come out
/// sorted by key so repeated runs produce identical command lines.
pub fn calc_backend_config(
    repo_path: &str,
    variables: &BTreeMap<String, String>,
    wrapper_config: &WrapperConfig,
    existing: Option<&BackendBlock>,
) -> Vec<String> {
    let mut options = vec![String::from("-reconfigure")];
    let mut params: BTreeMap<String, String> = BTreeMap::new();

    match existing {
        Some(BackendBlock::S3(_)) => {
            params.insert("encrypt".into(), "true".into());
            params.insert("key".into(), format!("{repo_path}.tfstate"));
            params.insert("skip_region_validation".into(), "true".into());
            params.insert("skip_credentials_validation".into(), "true".into());
            params.insert(
                "dynamodb_table".into(),
                variables
                    .get("terraform_lock_table")
                    .cloned()
                    .unwrap_or_else(|| "terraform-locking".into()),
            );
            // Without a `region` variable there is no default bucket name
            // either, so neither flag is emitted and `terraform init` falls
            // back to whatever the backend block in the .tf files declares.
            if let Some(region) = variables.get("region") {
                params.insert("region".into(), region.clone());
                let bucket = variables.get("terraform_state_bucket").cloned().or_else(|| {
                    variables
                        .get("account_short_name")
                        .map(|account| format!("{region}--terraform--{account}"))
                });
                if let Some(bucket) = bucket {
                    params.insert("bucket".into(), bucket);
                }
            }
            if let Some(s3) = wrapper_config.backends.as_ref().and_then(|b| b.s3.as_ref()) {
                let overrides = [
                    ("bucket", s3.bucket.clone()),
                    ("region", s3.region.clone()),
                    ("dynamodb_table", s3.dynamodb_table.clone()),
                    ("role_arn", s3.role_arn.clone()),
                    ("use_lockfile", s3.use_lockfile.map(|v| v.to_string())),
                ];
                for (key, value) in overrides {
                    if let Some(value) = value {
                        params.insert(key.into(), value);
                    }
                }
            }
        }
        Some(BackendBlock::Gcs(declared)) => {
            params.insert("prefix".into(), repo_path.to_string());
            let bucket = wrapper_config
                .backends
                .as_ref()
                .and_then(|b| b.gcs.as_ref())
                .and_then(|gcs| gcs.bucket.clone())
                .or_else(|| declared.get("bucket").cloned());
            if let Some(bucket) = bucket {
                params.insert("bucket".into(), bucket);
            }
        }
        None => {}
    }

    options.extend(
        params
            .into_iter()
            .map(|(key, value)| format!("-backend-config={key}={value}")),
    );
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_find_wrapper_config_files_root_first() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let leaf = root.join("env/app");
        fs::create_dir_all(&leaf).unwrap();
        write(root, ".tf_wrapper", "config: false");
        write(&root.join("env"), "team.tf_wrapper.yml", "plan_check: false");
        write(&leaf, ".tf_wrapper", "config: true");

        let files = find_wrapper_config_files(&leaf);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0], root.join(".tf_wrapper"));
        assert_eq!(files[1], root.join("env/team.tf_wrapper.yml"));
        assert_eq!(files[2], leaf.join(".tf_wrapper"));
    }

    #[test]
    fn test_parse_wrapper_configs_layers_and_appends() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let leaf = root.join("env/app");
        fs::create_dir_all(&leaf).unwrap();
        fs::create_dir_all(root.join("shared")).unwrap();
        write(root, ".tf_wrapper", "configure_backend: false\ndepends_on:\n  - shared");
        write(&leaf, ".tf_wrapper", "configure_backend: true\ndepends_on:\n  - ../db");

        let config = parse_wrapper_configs(&leaf).unwrap();
        assert!(config.configure_backend);
        assert_eq!(
            config.depends_on,
            Some(vec![root.join("shared"), root.join("env/db")])
        );
    }

    #[test]
    fn test_parse_wrapper_configs_defaults_when_no_files() {
        let tmp = TempDir::new().unwrap();
        let config = parse_wrapper_configs(tmp.path()).unwrap();
        assert_eq!(config, WrapperConfig::default());
    }

    #[test]
    fn test_parse_wrapper_configs_bad_key_names_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), ".tf_wrapper", "bogus_key: 1");
        let err = parse_wrapper_configs(tmp.path()).unwrap_err();
        match err {
            ConfigError::Parse { files, .. } => {
                assert_eq!(files, vec![tmp.path().join(".tf_wrapper")]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_variable_files_closer_wins() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let leaf = root.join("app");
        fs::create_dir_all(&leaf).unwrap();
        write(root, "global.auto.tfvars", "region = \"us-east-1\"\naccount_short_name = \"core\"");
        write(&leaf, "app.auto.tfvars", "region = \"us-west-2\"");

        let variables = parse_variable_files(&leaf).unwrap();
        assert_eq!(variables["region"], "us-west-2");
        assert_eq!(variables["account_short_name"], "core");
    }

    #[test]
    fn test_parse_backend_config_s3() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "main.tf",
            "terraform {\n  backend \"s3\" {\n    encrypt = true\n  }\n}\n",
        );
        let backend = parse_backend_config_for_dir(tmp.path()).unwrap().unwrap();
        match backend {
            BackendBlock::S3(params) => assert_eq!(params["encrypt"], "true"),
            BackendBlock::Gcs(_) => panic!("expected s3"),
        }
    }

    #[test]
    fn test_parse_backend_config_none_without_backend_block() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "main.tf", "resource \"null_resource\" \"x\" {}\n");
        assert!(parse_backend_config_for_dir(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn test_calc_backend_config_s3_defaults() {
        let mut variables = BTreeMap::new();
        variables.insert("region".to_string(), "us-west-2".to_string());
        variables.insert("account_short_name".to_string(), "core".to_string());
        let existing = BackendBlock::S3(BTreeMap::new());

        let flags = calc_backend_config(
            "infra/config/app",
            &variables,
            &WrapperConfig::default(),
            Some(&existing),
        );
        assert_eq!(flags[0], "-reconfigure");
        assert!(flags.contains(&"-backend-config=bucket=us-west-2--terraform--core".to_string()));
        assert!(flags.contains(&"-backend-config=key=infra/config/app.tfstate".to_string()));
        assert!(flags.contains(&"-backend-config=dynamodb_table=terraform-locking".to_string()));
        assert!(flags.contains(&"-backend-config=encrypt=true".to_string()));
    }

    #[test]
    fn test_calc_backend_config_s3_without_region_omits_bucket_and_region() {
        let existing = BackendBlock::S3(BTreeMap::new());

        let flags = calc_backend_config(
            "infra/config/app",
            &BTreeMap::new(),
            &WrapperConfig::default(),
            Some(&existing),
        );
        assert!(!flags.iter().any(|f| f.starts_with("-backend-config=region=")));
        assert!(!flags.iter().any(|f| f.starts_with("-backend-config=bucket=")));
        // The remaining defaults still come through.
        assert!(flags.contains(&"-backend-config=key=infra/config/app.tfstate".to_string()));
        assert!(flags.contains(&"-backend-config=encrypt=true".to_string()));
    }

    #[test]
    fn test_calc_backend_config_wrapper_overrides_win() {
        let mut variables = BTreeMap::new();
        variables.insert("region".to_string(), "us-west-2".to_string());
        variables.insert(
            "terraform_state_bucket".to_string(),
            "default-bucket".to_string(),
        );
        let config: WrapperConfig = serde_yaml::from_str(
            "backends:\n  s3:\n    bucket: override-bucket\n    role_arn: arn:aws:iam::1:role/tf",
        )
        .unwrap();
        let existing = BackendBlock::S3(BTreeMap::new());

        let flags = calc_backend_config("repo/config/app", &variables, &config, Some(&existing));
        assert!(flags.contains(&"-backend-config=bucket=override-bucket".to_string()));
        assert!(flags.contains(&"-backend-config=role_arn=arn:aws:iam::1:role/tf".to_string()));
        assert!(!flags.iter().any(|f| f.contains("default-bucket")));
    }

    #[test]
    fn test_calc_backend_config_is_deterministic_and_sorted() {
        let mut variables = BTreeMap::new();
        variables.insert("region".to_string(), "us-west-2".to_string());
        variables.insert("account_short_name".to_string(), "core".to_string());
        let existing = BackendBlock::S3(BTreeMap::new());

        let first = calc_backend_config("r/config/a", &variables, &WrapperConfig::default(), Some(&existing));
        let second = calc_backend_config("r/config/a", &variables, &WrapperConfig::default(), Some(&existing));
        assert_eq!(first, second);
        let mut sorted = first[1..].to_vec();
        sorted.sort();
        assert_eq!(first[1..], sorted[..]);
    }

    #[test]
    fn test_calc_backend_config_gcs() {
        let mut declared = BTreeMap::new();
        declared.insert("bucket".to_string(), "gcs-state".to_string());
        let existing = BackendBlock::Gcs(declared);

        let flags = calc_backend_config(
            "repo/config/app",
            &BTreeMap::new(),
            &WrapperConfig::default(),
            Some(&existing),
        );
        assert!(flags.contains(&"-backend-config=bucket=gcs-state".to_string()));
        assert!(flags.contains(&"-backend-config=prefix=repo/config/app".to_string()));
    }
}
