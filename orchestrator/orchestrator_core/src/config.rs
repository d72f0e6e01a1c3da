//! Orchestrator configuration.
//!
//! Read from TOML. Every field has a default, so an empty file (or no file
//! at all) yields a working in-memory setup. A handful of environment
//! variables override the file:
//!
//! | Variable | Field |
//! |---|---|
//! | `DBCLUSTER_CONFIG` | path of the TOML file |
//! | `LOG_LEVEL` | `logging.level` |
//! | `LOG_JSON` | `logging.json` |
//! | `API_PORT` | `server.port` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use container_runtime_interface::ReadinessPolicy;
use orchestrator_shared_types::{NodeResources, OrchestrationError};
use query_router_interface::{HostgroupIds, RouterWeights};
use state_store_interface::StateStoreConfig;

pub const CONFIG_PATH_ENV: &str = "DBCLUSTER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "dbcluster.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for OrchestrationError {
    fn from(err: ConfigError) -> Self {
        OrchestrationError::ConfigError(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub naming: NamingConfig,
    pub images: ImageConfig,
    pub runtime: RuntimeConfig,
    pub readiness: ReadinessConfig,
    pub router: RouterConfig,
    pub workflows: WorkflowConfig,
    pub store: StoreConfig,
    pub secrets: SecretsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Prefix of every container, network and hostname the engine creates.
    pub container_prefix: String,
    /// Prefix of the alias the topology monitor knows a cluster by
    /// (`<alias_prefix>-<cluster id>`).
    pub alias_prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            container_prefix: "dbc".to_string(),
            alias_prefix: "dbcluster".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Database image repository; the cluster's engine version is the tag.
    pub mysql_repository: String,
    pub router_image: String,
    pub default_engine_version: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            mysql_repository: "mysql".to_string(),
            router_image: "proxysql/proxysql:2.6.3".to_string(),
            default_engine_version: "8.0.36".to_string(),
        }
    }
}

impl ImageConfig {
    pub fn mysql_image(&self, engine_version: &str) -> String {
        format!("{}:{}", self.mysql_repository, engine_version)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Docker,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub docker_binary: String,
    pub command_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Docker,
            docker_binary: "docker".to_string(),
            command_timeout_secs: 60,
            stop_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// How long a new replica may take to report running replication threads.
    pub replication_timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_ms: 2000,
            replication_timeout_secs: 30,
        }
    }
}

impl ReadinessConfig {
    pub fn container_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn replication_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            timeout: Duration::from_secs(self.replication_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouterKind {
    Proxysql,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub kind: RouterKind,
    pub admin_port: u16,
    pub traffic_port: u16,
    /// Credential the router image ships with; rotated on first boot.
    pub default_admin_user: String,
    pub default_admin_password: String,
    pub writer_hostgroup: u32,
    pub reader_hostgroup: u32,
    pub writer_weight: u32,
    pub reader_weight: u32,
    pub connect_timeout_secs: u64,
    pub statement_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let hostgroups = HostgroupIds::default();
        let weights = RouterWeights::default();
        Self {
            kind: RouterKind::Proxysql,
            admin_port: 6032,
            traffic_port: 6033,
            default_admin_user: "radmin".to_string(),
            default_admin_password: "radmin".to_string(),
            writer_hostgroup: hostgroups.writer,
            reader_hostgroup: hostgroups.reader,
            writer_weight: weights.writer,
            reader_weight: weights.reader,
            connect_timeout_secs: 5,
            statement_timeout_secs: 5,
        }
    }
}

impl RouterConfig {
    pub fn hostgroups(&self) -> HostgroupIds {
        HostgroupIds {
            writer: self.writer_hostgroup,
            reader: self.reader_hostgroup,
        }
    }

    pub fn weights(&self) -> RouterWeights {
        RouterWeights {
            writer: self.writer_weight,
            reader: self.reader_weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Replicas started concurrently during provisioning and scale-up.
    pub replica_parallelism: usize,
    pub cas_max_attempts: u32,
    pub cas_initial_backoff_ms: u64,
    /// Seconds between health refresh passes; 0 disables the loop.
    pub health_interval_secs: u64,
    pub mysql_port: u16,
    pub default_cpu_cores: f32,
    pub default_memory_mb: u64,
    pub router_cpu_cores: f32,
    pub router_memory_mb: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            replica_parallelism: 2,
            cas_max_attempts: 5,
            cas_initial_backoff_ms: 50,
            health_interval_secs: 30,
            mysql_port: 3306,
            default_cpu_cores: 1.0,
            default_memory_mb: 1024,
            router_cpu_cores: 0.5,
            router_memory_mb: 256,
        }
    }
}

impl WorkflowConfig {
    pub fn default_resources(&self) -> NodeResources {
        NodeResources {
            cpu_cores: self.default_cpu_cores,
            memory_mb: self.default_memory_mb,
        }
    }

    pub fn router_resources(&self) -> NodeResources {
        NodeResources {
            cpu_cores: self.router_cpu_cores,
            memory_mb: self.router_memory_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    InMemory,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub etcd_endpoints: Vec<String>,
    pub etcd_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::InMemory,
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            etcd_prefix: "/dbcluster".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn to_state_store_config(&self) -> Result<StateStoreConfig, ConfigError> {
        match self.backend {
            StoreBackend::InMemory => Ok(StateStoreConfig::InMemory),
            #[cfg(feature = "etcd")]
            StoreBackend::Etcd => Ok(StateStoreConfig::Etcd {
                endpoints: self.etcd_endpoints.clone(),
                prefix: self.etcd_prefix.clone(),
            }),
            #[cfg(not(feature = "etcd"))]
            StoreBackend::Etcd => Err(ConfigError::invalid(
                "store.backend",
                "etcd support was not compiled in (enable the `etcd` feature)",
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// age identity used to seal cluster credentials; created if missing.
    pub key_file: PathBuf,
    pub password_length: usize,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key_file: PathBuf::from("dbcluster-vault.key"),
            password_length: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&content)
    }

    /// Loads the file named by `DBCLUSTER_CONFIG`, else `dbcluster.toml` when
    /// present, else defaults; then applies environment overrides and validates.
    pub async fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from(path).await?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load_from(DEFAULT_CONFIG_FILE).await?
            }
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("LOG_JSON") {
            self.logging.json = matches!(json.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(port) = lookup("API_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::invalid("API_PORT", format!("not a port: {:?}", port)))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.readiness.timeout_secs == 0 {
            return Err(ConfigError::invalid("readiness.timeout_secs", "must be positive"));
        }
        if self.readiness.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("readiness.poll_interval_ms", "must be positive"));
        }
        if self.readiness.replication_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "readiness.replication_timeout_secs",
                "must be positive",
            ));
        }
        if self.router.connect_timeout_secs == 0 || self.router.statement_timeout_secs == 0 {
            return Err(ConfigError::invalid("router", "timeouts must be positive"));
        }
        if self.router.writer_hostgroup == self.router.reader_hostgroup {
            return Err(ConfigError::invalid(
                "router.reader_hostgroup",
                "writer and reader hostgroups must differ",
            ));
        }
        if self.workflows.replica_parallelism == 0 {
            return Err(ConfigError::invalid("workflows.replica_parallelism", "must be at least 1"));
        }
        if self.workflows.cas_max_attempts == 0 {
            return Err(ConfigError::invalid("workflows.cas_max_attempts", "must be at least 1"));
        }
        if self.naming.alias_prefix.is_empty() {
            return Err(ConfigError::invalid("naming.alias_prefix", "must not be empty"));
        }
        if self.naming.container_prefix.is_empty() {
            return Err(ConfigError::invalid("naming.container_prefix", "must not be empty"));
        }
        if self.secrets.password_length < 12 {
            return Err(ConfigError::invalid("secrets.password_length", "must be at least 12"));
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level {:?}", self.logging.level),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_is_valid() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.router.hostgroups(), HostgroupIds::default());
        assert_eq!(config.naming.alias_prefix, "dbcluster");
    }

    #[test]
    fn test_partial_sections() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [router]
            kind = "mock"
            writer_hostgroup = 1
            reader_hostgroup = 2

            [workflows]
            replica_parallelism = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.router.kind, RouterKind::Mock);
        assert_eq!(config.router.hostgroups().writer, 1);
        assert_eq!(config.router.admin_port, 6032);
        assert_eq!(config.workflows.replica_parallelism, 4);
        assert_eq!(config.workflows.mysql_port, 3306);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> =
            [("LOG_LEVEL", "debug"), ("LOG_JSON", "true"), ("API_PORT", "9100")].into();
        let mut config = OrchestratorConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = OrchestratorConfig::default();
        let err = config
            .apply_env(|key| (key == "API_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "API_PORT", .. }));
    }

    #[test]
    fn test_validate_rejects_shared_hostgroup() {
        let mut config = OrchestratorConfig::default();
        config.router.reader_hostgroup = config.router.writer_hostgroup;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = OrchestratorConfig::default();
        config.readiness.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.workflows.replica_parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mysql_image_uses_engine_version() {
        let images = ImageConfig::default();
        assert_eq!(images.mysql_image("8.0.36"), "mysql:8.0.36");
    }

    #[tokio::test]
    async fn test_load_from_missing_file() {
        let err = OrchestratorConfig::load_from("/nonexistent/dbcluster.toml")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
