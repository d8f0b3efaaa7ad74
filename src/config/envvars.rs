//! Environment variable resolution for wrapped commands.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use crate::config::EnvVarSource;

/// Parameter cache lifetime. Matches the typical duration of one run so
/// repeated lookups of a shared secret hit the subprocess only once.
pub const PARAMETER_CACHE_TTL: Duration = Duration::from_secs(600);

/// Source of SSM parameter values.
pub trait ParameterStore: Send + Sync {
    fn get_parameter(&self, path: &str, region: Option<&str>) -> Result<String>;
}

/// Fetches parameters by shelling out to the AWS CLI.
#[derive(Debug, Default)]
pub struct AwsCliParameterStore;

impl ParameterStore for AwsCliParameterStore {
    fn get_parameter(&self, path: &str, region: Option<&str>) -> Result<String> {
        let mut command = Command::new("aws");
        command
            .arg("ssm")
            .arg("get-parameter")
            .arg("--name")
            .arg(path)
            .arg("--with-decryption")
            .arg("--query")
            .arg("Parameter.Value")
            .arg("--output")
            .arg("text");
        if let Some(region) = region {
            command.arg("--region").arg(region);
        }

        let output = command
            .output()
            .with_context(|| format!("failed to invoke aws cli for parameter {path}"))?;
        if !output.status.success() {
            bail!(
                "failed to fetch ssm parameter {path}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

/// TTL cache in front of another [`ParameterStore`].
pub struct CachedParameterStore {
    inner: Box<dyn ParameterStore>,
    ttl: Duration,
    cache: Mutex<HashMap<(String, Option<String>), (Instant, String)>>,
}

impl CachedParameterStore {
    pub fn new(inner: Box<dyn ParameterStore>) -> Self {
        Self::with_ttl(inner, PARAMETER_CACHE_TTL)
    }

    pub fn with_ttl(inner: Box<dyn ParameterStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl ParameterStore for CachedParameterStore {
    fn get_parameter(&self, path: &str, region: Option<&str>) -> Result<String> {
        let key = (path.to_string(), region.map(str::to_string));
        if let Ok(cache) = self.cache.lock()
            && let Some((fetched_at, value)) = cache.get(&key)
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(value.clone());
        }

        let value = self.inner.get_parameter(path, region)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, (Instant::now(), value.clone()));
        }
        Ok(value)
    }
}

/// Resolve every declared environment variable to its final value.
///
/// `None` values mean the variable must be removed from the child
/// environment rather than left inherited.
pub fn resolve_envvars(
    declared: &BTreeMap<String, EnvVarSource>,
    store: &dyn ParameterStore,
) -> Result<BTreeMap<String, Option<String>>> {
    let mut resolved = BTreeMap::new();
    for (name, source) in declared {
        let value = match source {
            EnvVarSource::Ssm { path, region } => Some(
                store
                    .get_parameter(path, region.as_deref())
                    .with_context(|| format!("failed to resolve envvar {name}"))?,
            ),
            EnvVarSource::Text { value } => Some(
                scalar_to_string(value)
                    .with_context(|| format!("envvar {name} has a non-scalar value"))?,
            ),
            EnvVarSource::Unset => None,
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

fn scalar_to_string(value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        _ => bail!("expected a scalar, got {value:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        calls: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ParameterStore for CountingStore {
        fn get_parameter(&self, path: &str, region: Option<&str>) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{path}@{}#{call}", region.unwrap_or("default")))
        }
    }

    #[test]
    fn test_cache_hits_within_ttl() {
        let store = CachedParameterStore::new(Box::new(CountingStore::new()));
        let first = store.get_parameter("/a", None).unwrap();
        let second = store.get_parameter("/a", None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cache_keys_include_region() {
        let store = CachedParameterStore::new(Box::new(CountingStore::new()));
        let default = store.get_parameter("/a", None).unwrap();
        let west = store.get_parameter("/a", Some("us-west-2")).unwrap();
        assert_ne!(default, west);
    }

    #[test]
    fn test_cache_expires() {
        let store = CachedParameterStore::with_ttl(
            Box::new(CountingStore::new()),
            Duration::from_secs(0),
        );
        let first = store.get_parameter("/a", None).unwrap();
        let second = store.get_parameter("/a", None).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_resolve_envvars() {
        let yaml = "
DB_PASSWORD:
  source: ssm
  path: /prod/db
PORT:
  source: text
  value: 5432
LEGACY:
  source: unset
";
        let declared: BTreeMap<String, EnvVarSource> = serde_yaml::from_str(yaml).unwrap();
        let resolved = resolve_envvars(&declared, &CountingStore::new()).unwrap();
        assert!(
            resolved["DB_PASSWORD"]
                .as_deref()
                .unwrap()
                .starts_with("/prod/db@default")
        );
        assert_eq!(resolved["PORT"].as_deref(), Some("5432"));
        assert_eq!(resolved["LEGACY"], None);
    }

    #[test]
    fn test_non_scalar_text_value_is_rejected() {
        let yaml = "
BAD:
  source: text
  value: [1, 2]
";
        let declared: BTreeMap<String, EnvVarSource> = serde_yaml::from_str(yaml).unwrap();
        assert!(resolve_envvars(&declared, &CountingStore::new()).is_err());
    }
}
