//! Configuration for the controller.
//!
//! Settings come from an explicit TOML file when one is given. Otherwise
//! they are bootstrapped from the hosting environment: the scheduler's
//! service-discovery variables, the Kubernetes service variables, and the
//! mounted service-account files. Resolution is a pure function of an
//! [`EnvSnapshot`], which is captured once at startup.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use podpool_id::{InstanceId, PoolName};
use podpool_reconcile::{
    DEFAULT_ADMISSION_INTERVAL, DEFAULT_AUTO_REGISTER_TIMEOUT, DEFAULT_MAX_PENDING_INSTANCES,
    DEFAULT_RECONCILE_INTERVAL,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Directory holding the mounted service-account credentials.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const SERVICE_ACCOUNT_FILES: [&str; 3] = ["namespace", "token", "ca.crt"];

/// Environment variable carrying the scheduler server's address.
pub const SERVER_ADDR_VAR: &str = "GOCD_PORT_8154_TCP_ADDR";

/// Controller settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Scheduler base URL (example: https://gocd:8154/go).
    pub server_url: String,

    /// Bearer token for the scheduler API.
    #[serde(default)]
    pub server_token: Option<String>,

    /// Only agents created by this elastic plugin id are managed.
    #[serde(default = "default_agent_plugin_id")]
    pub agent_plugin_id: String,

    /// Kubernetes API URL. Must be https.
    pub cluster_url: String,

    /// PEM encoded CA certificate for the cluster.
    #[serde(default)]
    pub cluster_ca_cert: Option<String>,

    /// Service-account bearer token for the cluster.
    pub security_token: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Minutes a pod may live without registering as an agent.
    #[serde(default = "default_auto_register_timeout_minutes")]
    pub auto_register_timeout_minutes: u64,

    /// Global ceiling on simultaneously pending pods per pool.
    #[serde(default = "default_max_pending_instances")]
    pub max_pending_instances: u32,

    /// Use per-pool ceilings from `pools` instead of the global one.
    #[serde(default)]
    pub use_profile_pending_count: bool,

    #[serde(default)]
    pub pools: BTreeMap<PoolName, PoolSettings>,

    #[serde(default = "default_admission_interval_secs")]
    pub admission_interval_secs: u64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Prefix for generated pod names.
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,
}

/// Per-pool overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    pub max_pending_instances: Option<u32>,
}

fn default_agent_plugin_id() -> String {
    "podpool".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_auto_register_timeout_minutes() -> u64 {
    DEFAULT_AUTO_REGISTER_TIMEOUT.as_secs() / 60
}

fn default_max_pending_instances() -> u32 {
    DEFAULT_MAX_PENDING_INSTANCES
}

fn default_admission_interval_secs() -> u64 {
    DEFAULT_ADMISSION_INTERVAL.as_secs()
}

fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL.as_secs()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_instance_prefix() -> String {
    "podpool".to_string()
}

impl Settings {
    /// Load settings from `path` if given, otherwise bootstrap from `env`.
    pub fn load(path: Option<&Path>, env: &EnvSnapshot) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_environment(env)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// Derive settings from the hosting environment.
    ///
    /// Every required value must be present and non-blank; there are no
    /// silent defaults for addresses or credentials.
    pub fn from_environment(env: &EnvSnapshot) -> Result<Self, ConfigError> {
        info!("No settings file given, bootstrapping from pod environment");

        let server_addr = env
            .var(SERVER_ADDR_VAR)
            .ok_or_else(|| ConfigError::Missing(format!("environment variable {SERVER_ADDR_VAR}")))?;
        let server_url = format!("https://{server_addr}:8154/go");
        debug!(server_url = %server_url, "Found scheduler URL");

        let (Some(host), Some(port)) = (
            env.var("KUBERNETES_SERVICE_HOST"),
            env.var("KUBERNETES_SERVICE_PORT"),
        ) else {
            return Err(ConfigError::Missing(
                "environment variables KUBERNETES_SERVICE_HOST and KUBERNETES_SERVICE_PORT"
                    .to_string(),
            ));
        };
        let cluster_url = format!("https://{host}:{port}");
        debug!(cluster_url = %cluster_url, "Found cluster URL");

        let namespace = env.service_account_file("namespace")?.to_string();
        let security_token = env.service_account_file("token")?.to_string();
        let cluster_ca_cert = env.service_account_file("ca.crt")?.to_string();
        debug!(namespace = %namespace, "Found service account");

        let max_pending_instances = env
            .parsed_var("PODPOOL_MAX_PENDING_INSTANCES", "max_pending_instances")?
            .unwrap_or_else(default_max_pending_instances);
        let auto_register_timeout_minutes = env
            .parsed_var(
                "PODPOOL_AUTO_REGISTER_TIMEOUT_MINUTES",
                "auto_register_timeout_minutes",
            )?
            .unwrap_or_else(default_auto_register_timeout_minutes);

        Ok(Self {
            server_url,
            server_token: env.var("PODPOOL_SERVER_TOKEN").map(str::to_string),
            agent_plugin_id: env
                .var("PODPOOL_AGENT_PLUGIN_ID")
                .map_or_else(default_agent_plugin_id, str::to_string),
            cluster_url,
            cluster_ca_cert: Some(cluster_ca_cert),
            security_token,
            namespace,
            auto_register_timeout_minutes,
            max_pending_instances,
            use_profile_pending_count: false,
            pools: BTreeMap::new(),
            admission_interval_secs: default_admission_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            instance_prefix: default_instance_prefix(),
        })
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cluster_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                field: "cluster_url",
                message: format!("{} is not an https URL", self.cluster_url),
            });
        }
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Missing("server_url".to_string()));
        }
        if self.security_token.trim().is_empty() {
            return Err(ConfigError::Missing("security_token".to_string()));
        }
        for (field, value) in [
            ("auto_register_timeout_minutes", self.auto_register_timeout_minutes),
            ("admission_interval_secs", self.admission_interval_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be positive".to_string(),
                });
            }
        }
        // Sweeps compare pod ages as chrono durations.
        let timeout_fits = self
            .auto_register_timeout_minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .is_some_and(|timeout| chrono::Duration::from_std(timeout).is_ok());
        if !timeout_fits {
            return Err(ConfigError::Invalid {
                field: "auto_register_timeout_minutes",
                message: format!("{} minutes is out of range", self.auto_register_timeout_minutes),
            });
        }
        InstanceId::generate(&self.instance_prefix).map_err(|e| ConfigError::Invalid {
            field: "instance_prefix",
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Pending-instance ceilings derived from these settings.
    pub fn ceilings(&self) -> PoolCeilings {
        let overrides = if self.use_profile_pending_count {
            self.pools
                .iter()
                .filter_map(|(pool, s)| s.max_pending_instances.map(|n| (pool.clone(), n)))
                .collect()
        } else {
            HashMap::new()
        };
        PoolCeilings::new(self.max_pending_instances, overrides)
    }

    pub fn auto_register_timeout(&self) -> Duration {
        Duration::from_secs(self.auto_register_timeout_minutes.saturating_mul(60))
    }

    pub fn admission_interval(&self) -> Duration {
        Duration::from_secs(self.admission_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Ceiling lookup used by the admission semaphore.
#[derive(Debug, Clone)]
pub struct PoolCeilings {
    default: u32,
    overrides: HashMap<PoolName, u32>,
}

impl PoolCeilings {
    pub fn new(default: u32, overrides: HashMap<PoolName, u32>) -> Self {
        Self { default, overrides }
    }

    /// Same ceiling for every pool.
    pub fn uniform(ceiling: u32) -> Self {
        Self::new(ceiling, HashMap::new())
    }

    pub fn ceiling_for(&self, pool: &PoolName) -> u32 {
        self.overrides.get(pool).copied().unwrap_or(self.default)
    }

    /// Pools with an explicit ceiling.
    pub fn configured_pools(&self) -> impl Iterator<Item = &PoolName> {
        self.overrides.keys()
    }
}

/// A point-in-time copy of everything bootstrap reads from the host.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
    service_account: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the process environment and the service-account files.
    pub fn capture() -> Self {
        let mut snapshot = Self {
            vars: std::env::vars().collect(),
            service_account: HashMap::new(),
        };
        for name in SERVICE_ACCOUNT_FILES {
            let path = Path::new(SERVICE_ACCOUNT_DIR).join(name);
            match std::fs::read_to_string(&path) {
                Ok(contents) => {
                    snapshot.service_account.insert(name.to_string(), contents);
                }
                Err(e) => debug!(path = %path.display(), error = %e, "Service account file unreadable"),
            }
        }
        snapshot
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_service_account_file(
        mut self,
        name: impl Into<String>,
        contents: impl Into<String>,
    ) -> Self {
        self.service_account.insert(name.into(), contents.into());
        self
    }

    /// A non-blank variable, trimmed.
    pub fn var(&self, name: &str) -> Option<&str> {
        non_blank(self.vars.get(name))
    }

    fn parsed_var<T: std::str::FromStr>(
        &self,
        name: &str,
        field: &'static str,
    ) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        self.var(name)
            .map(|v| {
                v.parse::<T>().map_err(|e| ConfigError::Invalid {
                    field,
                    message: format!("{name}={v}: {e}"),
                })
            })
            .transpose()
    }

    fn service_account_file(&self, name: &str) -> Result<&str, ConfigError> {
        non_blank(self.service_account.get(name)).ok_or_else(|| {
            ConfigError::Missing(format!(
                "{SERVICE_ACCOUNT_DIR}/{name} (is a service account mounted?)"
            ))
        })
    }
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_env() -> EnvSnapshot {
        EnvSnapshot::new()
            .with_var(SERVER_ADDR_VAR, "10.0.0.5")
            .with_var("KUBERNETES_SERVICE_HOST", "10.96.0.1")
            .with_var("KUBERNETES_SERVICE_PORT", "443")
            .with_service_account_file("namespace", "ci\n")
            .with_service_account_file("token", "tok")
            .with_service_account_file("ca.crt", "-----BEGIN CERTIFICATE-----")
    }

    #[test]
    fn test_bootstrap_from_environment() {
        let settings = Settings::load(None, &pod_env()).unwrap();
        assert_eq!(settings.server_url, "https://10.0.0.5:8154/go");
        assert_eq!(settings.cluster_url, "https://10.96.0.1:443");
        assert_eq!(settings.namespace, "ci");
        assert_eq!(settings.max_pending_instances, 10);
        assert_eq!(settings.auto_register_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_bootstrap_env_overrides() {
        let env = pod_env().with_var("PODPOOL_MAX_PENDING_INSTANCES", "3");
        let settings = Settings::from_environment(&env).unwrap();
        assert_eq!(settings.max_pending_instances, 3);

        let env = pod_env().with_var("PODPOOL_MAX_PENDING_INSTANCES", "lots");
        assert!(matches!(
            Settings::from_environment(&env),
            Err(ConfigError::Invalid { field: "max_pending_instances", .. })
        ));
    }

    #[test]
    fn test_ceilings_ignore_pools_unless_enabled() {
        let mut settings = Settings::from_environment(&pod_env()).unwrap();
        let pool: PoolName = "large".parse().unwrap();
        settings.pools.insert(
            pool.clone(),
            PoolSettings {
                max_pending_instances: Some(2),
            },
        );

        assert_eq!(settings.ceilings().ceiling_for(&pool), 10);

        settings.use_profile_pending_count = true;
        assert_eq!(settings.ceilings().ceiling_for(&pool), 2);
        let other: PoolName = "small".parse().unwrap();
        assert_eq!(settings.ceilings().ceiling_for(&other), 10);
    }

    #[test]
    fn test_validate_rejects_http_cluster() {
        let mut settings = Settings::from_environment(&pod_env()).unwrap();
        settings.cluster_url = "http://10.96.0.1".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { field: "cluster_url", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut settings = Settings::from_environment(&pod_env()).unwrap();
        settings.reconcile_interval_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_oversized_register_timeout() {
        let mut settings = Settings::from_environment(&pod_env()).unwrap();
        settings.auto_register_timeout_minutes = u64::MAX;

        assert_eq!(settings.auto_register_timeout(), Duration::from_secs(u64::MAX));
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { field: "auto_register_timeout_minutes", .. })
        ));
    }
}
