//! Daemon configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::render::RenderSettings;
use crate::tree::join_path;

/// Configuration for the patroni-lb daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbConfig {
    /// Coordination-store host.
    pub zookeeper_host: String,

    /// Coordination-store port.
    pub zookeeper_port: u16,

    /// Root under which Patroni keeps its scopes.
    pub namespace: String,

    /// Patroni scope (cluster name) to front.
    pub scope: String,

    /// Where the rendered HAProxy configuration is written.
    pub config_path: PathBuf,

    /// HAProxy executable.
    pub haproxy_bin: String,

    /// Optional `-p` pid file handed to HAProxy.
    pub pid_file: Option<PathBuf>,

    /// Run `haproxy -c` on a new configuration before reloading.
    pub check_config: bool,

    #[serde(with = "duration_secs")]
    pub leader_recheck_interval: Duration,

    #[serde(with = "duration_secs")]
    pub retry_backoff: Duration,

    #[serde(with = "duration_secs")]
    pub max_retry_backoff: Duration,

    /// Consecutive failed cycles tolerated before the daemon exits.
    pub max_consecutive_errors: u32,

    /// How often an idle loop checks that HAProxy is still alive. Zero disables.
    #[serde(with = "duration_secs")]
    pub liveness_interval: Duration,

    /// Attempts to reach the coordination store at startup.
    pub connect_attempts: u32,

    pub render: RenderSettings,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            zookeeper_host: String::new(),
            zookeeper_port: 2181,
            namespace: "/service".to_string(),
            scope: String::new(),
            config_path: PathBuf::from("haproxy.cfg"),
            haproxy_bin: "haproxy".to_string(),
            pid_file: None,
            check_config: true,
            leader_recheck_interval: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(30),
            max_consecutive_errors: 10,
            liveness_interval: Duration::from_secs(5),
            connect_attempts: 5,
            render: RenderSettings::default(),
        }
    }
}

impl LbConfig {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        toml::from_str(&content).map_err(|e| Error::toml_parse_failed(path, e.to_string()))
    }

    /// Check that the settings the daemon cannot run without are present.
    pub fn validate(&self) -> Result<()> {
        if self.zookeeper_host.trim().is_empty() {
            return Err(Error::invalid_config(
                "ZOOKEEPER_HOST environment variable is not specified",
            ));
        }
        if self.scope.trim().is_empty() {
            return Err(Error::invalid_config(
                "PATRONI_SCOPE environment variable is not specified",
            ));
        }
        if self.scope.contains('/') {
            return Err(Error::invalid_config(format!(
                "scope '{}' must not contain '/'",
                self.scope
            )));
        }
        if !self.namespace.starts_with('/') {
            return Err(Error::invalid_config(format!(
                "namespace '{}' must be an absolute path",
                self.namespace
            )));
        }
        if self.max_consecutive_errors == 0 {
            return Err(Error::invalid_config(
                "max_consecutive_errors must be at least 1",
            ));
        }
        Ok(())
    }

    /// `host:port` of the coordination store.
    pub fn zookeeper_endpoint(&self) -> String {
        format!("{}:{}", self.zookeeper_host, self.zookeeper_port)
    }

    /// Root of the observed subtree, e.g. `/service/demo`.
    pub fn scope_path(&self) -> String {
        join_path(&self.namespace, &self.scope)
    }

    /// Node whose existence gates serving, e.g. `/service/demo/leader`.
    pub fn leader_path(&self) -> String {
        join_path(&self.scope_path(), "leader")
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
