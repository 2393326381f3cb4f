//! Configuration schema and loader for the catalogue coordinator.

use catalogue_common::HealthState;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Public API listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// How long shutdown waits for in-flight pushes.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub ring: RingConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub distribution: DistributionConfig,

    #[serde(default)]
    pub federation: FederationConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub node_api: NodeApiConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            metrics_port: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            ring: RingConfig::default(),
            health: HealthConfig::default(),
            distribution: DistributionConfig::default(),
            federation: FederationConfig::default(),
            registry: RegistryConfig::default(),
            discovery: DiscoveryConfig::default(),
            node_api: NodeApiConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Distinct nodes each offering is placed on.
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Virtual points per physical node.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Continuous failure time before SUSPECT becomes DOWN.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    /// State given to newly registered nodes: `suspect` or `healthy`.
    #[serde(default = "default_initial_state")]
    pub initial_state: HealthState,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            grace_period_secs: default_grace_period_secs(),
            max_concurrent_probes: default_max_concurrent_probes(),
            initial_state: default_initial_state(),
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Total push attempts per node, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    /// Per-attempt push timeout.
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,

    /// Rebalance stale assignments when a node becomes healthy.
    #[serde(default)]
    pub eager_rebalance: bool,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            push_timeout_ms: default_push_timeout_ms(),
            eager_rebalance: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    /// Overall deadline for one federated query.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: default_node_timeout_ms(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

/// Upstream registry feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_base_url")]
    pub base_url: String,

    #[serde(default = "default_offerings_path")]
    pub offerings_path: String,

    #[serde(default = "default_nodes_path")]
    pub nodes_path: String,

    #[serde(default = "default_fetch_interval_secs")]
    pub fetch_interval_secs: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_base_url(),
            offerings_path: default_offerings_path(),
            nodes_path: default_nodes_path(),
            fetch_interval_secs: default_fetch_interval_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Use the configured node list only.
    Static,
    /// Pull the node list from the registry feed; the static list is the
    /// fallback when the feed yields nothing.
    Decentralized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_mode")]
    pub mode: DiscoveryMode,

    #[serde(default)]
    pub nodes: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: default_discovery_mode(),
            nodes: Vec::new(),
        }
    }
}

/// Paths and headers of the catalogue node HTTP contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeApiConfig {
    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_push_path")]
    pub push_path: String,

    #[serde(default = "default_query_path")]
    pub query_path: String,

    #[serde(default = "default_push_content_type")]
    pub push_content_type: String,
}

impl Default for NodeApiConfig {
    fn default() -> Self {
        Self {
            health_path: default_health_path(),
            push_path: default_push_path(),
            query_path: default_query_path(),
            push_content_type: default_push_content_type(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    Wal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_backend")]
    pub backend: PersistenceBackend,

    /// Directory for the WAL backend.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

// --- Defaults ---

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_replicas() -> usize {
    2
}
fn default_virtual_nodes() -> usize {
    150
}
fn default_check_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_ms() -> u64 {
    3000
}
fn default_grace_period_secs() -> u64 {
    60
}
fn default_max_concurrent_probes() -> usize {
    16
}
fn default_initial_state() -> HealthState {
    HealthState::Suspect
}
fn default_worker_pool_size() -> usize {
    10
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    8000
}
fn default_retry_jitter_ms() -> u64 {
    100
}
fn default_push_timeout_ms() -> u64 {
    30_000
}
fn default_node_timeout_ms() -> u64 {
    5000
}
fn default_deadline_ms() -> u64 {
    10_000
}
fn default_registry_base_url() -> String {
    "http://localhost:5001".to_string()
}
fn default_offerings_path() -> String {
    "/offerings".to_string()
}
fn default_nodes_path() -> String {
    "/nodes".to_string()
}
fn default_fetch_interval_secs() -> u64 {
    60
}
fn default_request_timeout_ms() -> u64 {
    15_000
}
fn default_discovery_mode() -> DiscoveryMode {
    DiscoveryMode::Static
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_push_path() -> String {
    "/update".to_string()
}
fn default_query_path() -> String {
    "/sparql".to_string()
}
fn default_push_content_type() -> String {
    "application/ld+json".to_string()
}
fn default_backend() -> PersistenceBackend {
    PersistenceBackend::Memory
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} has unparseable value {:?}", name, raw)))
}

impl CoordinatorConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring.replicas == 0 {
            return Err(ConfigError::Invalid("ring.replicas must be > 0".into()));
        }
        if self.ring.virtual_nodes == 0 {
            return Err(ConfigError::Invalid("ring.virtual_nodes must be > 0".into()));
        }
        if self.distribution.worker_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "distribution.worker_pool_size must be > 0".into(),
            ));
        }
        if self.distribution.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "distribution.retry_attempts must be > 0".into(),
            ));
        }
        if self.health.max_concurrent_probes == 0 {
            return Err(ConfigError::Invalid(
                "health.max_concurrent_probes must be > 0".into(),
            ));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "health.probe_timeout_ms must be > 0".into(),
            ));
        }
        if self.health.initial_state == HealthState::Down {
            return Err(ConfigError::Invalid(
                "health.initial_state must be suspect or healthy".into(),
            ));
        }
        if self.federation.deadline_ms < self.federation.node_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "federation.deadline_ms ({}) must be >= federation.node_timeout_ms ({})",
                self.federation.deadline_ms, self.federation.node_timeout_ms
            )));
        }
        Ok(())
    }

    /// Apply deployment environment variables on top of the file values.
    ///
    /// `lookup` is normally `|k| std::env::var(k).ok()`; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST_ADDRESS");
        let port = lookup("HOST_PORT");
        if host.is_some() || port.is_some() {
            let ip = match host {
                Some(h) => parse_env("HOST_ADDRESS", &h)?,
                None => self.listen.ip(),
            };
            let port = match port {
                Some(p) => parse_env("HOST_PORT", &p)?,
                None => self.listen.port(),
            };
            self.listen = SocketAddr::new(ip, port);
        }

        if let Some(v) = lookup("REDUNDANCY_REPLICAS") {
            self.ring.replicas = parse_env("REDUNDANCY_REPLICAS", &v)?;
        }
        if let Some(v) = lookup("HASH_RING_VIRTUAL_NODES") {
            self.ring.virtual_nodes = parse_env("HASH_RING_VIRTUAL_NODES", &v)?;
        }
        if let Some(v) = lookup("WORKER_POOL_SIZE") {
            self.distribution.worker_pool_size = parse_env("WORKER_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("NODE_HEALTH_CHECK_INTERVAL") {
            self.health.check_interval_secs = parse_env("NODE_HEALTH_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("NODE_GRACE_PERIOD") {
            self.health.grace_period_secs = parse_env("NODE_GRACE_PERIOD", &v)?;
        }
        if let Some(v) = lookup("NODE_TIMEOUT") {
            let secs: u64 = parse_env("NODE_TIMEOUT", &v)?;
            self.health.probe_timeout_ms = secs * 1000;
        }
        if let Some(v) = lookup("DLT_BASE_URL") {
            self.registry.base_url = v;
        }
        if let Some(v) = lookup("DLT_OFFERINGS_PATH") {
            self.registry.offerings_path = v;
        }
        if let Some(v) = lookup("DLT_NODES_PATH") {
            self.registry.nodes_path = v;
        }
        if let Some(v) = lookup("FETCH_INTERVAL_SECONDS") {
            self.registry.fetch_interval_secs = parse_env("FETCH_INTERVAL_SECONDS", &v)?;
        }
        Ok(())
    }
}

/// Load a `CoordinatorConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<CoordinatorConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `CoordinatorConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<CoordinatorConfig, ConfigError> {
    let config: CoordinatorConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
