//! Per-directory wrapper configuration
//!
//! Each Terraform directory can carry `.tf_wrapper` / `*.tf_wrapper.yml`
//! sidecar files at any level above it. Files closer to the directory
//! override files closer to the filesystem root (scalars replace, mappings
//! merge, sequences append), and the merged mapping deserializes into
//! [`WrapperConfig`].

pub mod envvars;
pub mod merge;
pub mod resolver;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Merged per-directory configuration from layered wrapper config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WrapperConfig {
    /// Whether backend flags should be computed and passed to `init`.
    #[serde(default = "default_true")]
    pub configure_backend: bool,

    // Gating flags consumed by external validators, carried through as-is.
    #[serde(default = "default_true")]
    pub pipeline_check: bool,
    #[serde(default = "default_true")]
    pub backend_check: bool,
    #[serde(default = "default_true")]
    pub plan_check: bool,

    /// Environment variables to resolve before running any command.
    #[serde(default)]
    pub envvars: BTreeMap<String, EnvVarSource>,

    /// Backend parameter overrides layered over the computed defaults.
    #[serde(default)]
    pub backends: Option<BackendsConfig>,

    /// Declared dependencies, as directory paths.
    ///
    /// `None` means "no dependency metadata known", which routes the
    /// directory into the flat post-graph batch; `Some(vec![])` means
    /// "known to have zero dependencies" and keeps it in the graph.
    #[serde(default)]
    pub depends_on: Option<Vec<PathBuf>>,

    /// Whether this directory is itself an applicable Terraform
    /// configuration (vs. a metadata-only level).
    #[serde(default = "default_true")]
    pub config: bool,

    /// Whether an orchestrated run should include this directory at all.
    #[serde(default = "default_true")]
    pub apply_automatically: bool,

    /// Plugin binaries to download before running, name to URL.
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            configure_backend: true,
            pipeline_check: true,
            backend_check: true,
            plan_check: true,
            envvars: BTreeMap::new(),
            backends: None,
            depends_on: None,
            config: true,
            apply_automatically: true,
            plugins: BTreeMap::new(),
        }
    }
}

/// Where an environment variable's value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum EnvVarSource {
    /// Fetched from the SSM parameter store, optionally from a specific
    /// region.
    Ssm {
        path: String,
        #[serde(default)]
        region: Option<String>,
    },
    /// Literal value. Scalars are coerced to strings.
    Text { value: serde_yaml::Value },
    /// Explicitly absent: the variable is removed from the child
    /// environment rather than treated as missing.
    Unset,
}

/// Backend parameters from the wrapper config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub s3: Option<S3BackendConfig>,
    #[serde(default)]
    pub gcs: Option<GcsBackendConfig>,
}

/// S3 backend overrides. Unset fields are dropped from the flag list so
/// Terraform's native defaults are not clobbered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct S3BackendConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub dynamodb_table: Option<String>,
    #[serde(default)]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub use_lockfile: Option<bool>,
}

/// GCS backend overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcsBackendConfig {
    #[serde(default)]
    pub bucket: Option<String>,
}
