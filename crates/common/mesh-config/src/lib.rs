use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable naming the coordinator config file.
pub const CONFIG_PATH_ENV: &str = "MESH_COORDINATOR_CONFIG";

/// Config file used when `MESH_COORDINATOR_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "coordinator.toml";

/// Top-level coordinator configuration
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Default tracing filter when RUST_LOG is not set
    pub log_level: Option<String>,
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub session: SessionConfig,
    pub shutdown: ShutdownConfig,
    pub reporting: ReportingConfig,
    /// Trusted TEE measurements and keys for the static trust store
    pub trust: TrustConfig,
    /// Static node credentials for the in-memory node directory
    pub nodes: Vec<NodeCredentialConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// e.g. "0.0.0.0:7400"
    pub listen_address: String,
    /// Maximum concurrently connected node sessions
    pub max_sessions: usize,
    /// Largest accepted wire frame in bytes
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:7400".to_string(),
            max_sessions: 1024,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    /// Additional attempts on a different node after a failover-eligible error
    pub retry_limit: u32,
    /// Window for a node to acknowledge JOB_ASSIGN
    pub assign_timeout_ms: u64,
    /// Delay before each retry attempt
    pub retry_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_limit: 1,
            assign_timeout_ms: 5_000,
            retry_backoff_ms: 0,
        }
    }
}

impl DispatchConfig {
    pub fn assign_timeout(&self) -> Duration {
        Duration::from_millis(self.assign_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct HealthConfig {
    /// Period of the liveness sweep
    pub interval_ms: u64,
    /// Heartbeat age after which a node is evicted
    pub heartbeat_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            heartbeat_timeout_ms: 30_000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Time a fresh connection has to send REGISTER
    pub register_timeout_ms: u64,
    /// Bounded chunk buffer between a node and its client
    pub relay_buffer: usize,
    /// How long a paused relay may stay full before the session is terminated
    pub stall_timeout_ms: u64,
    /// Bounded buffer of frames queued towards the node
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            register_timeout_ms: 10_000,
            relay_buffer: 64,
            stall_timeout_ms: 30_000,
            outbound_buffer: 32,
        }
    }
}

impl SessionConfig {
    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time in-flight jobs get to finish after new jobs are refused
    pub grace_period_ms: u64,
    /// Upper bound for joining background tasks
    pub join_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 15_000,
            join_timeout_ms: 5_000,
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ReportingConfig {
    /// Capacity of the usage record pipeline
    pub usage_capacity: usize,
    /// Capacity of the metrics record pipeline
    pub metrics_capacity: usize,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            usage_capacity: 1_024,
            metrics_capacity: 1_024,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct TrustConfig {
    /// Hex SHA-256 measurements of accepted attestation documents
    pub measurements: Vec<String>,
    /// Base58 Ed25519 public keys of accepted TEE nodes
    pub public_keys: Vec<String>,
}

/// A statically provisioned node credential
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NodeCredentialConfig {
    pub credential: String,
    pub node_id: String,
    pub account_id: String,
}

impl CoordinatorConfig {
    /// Reject configurations that would stall or spin the coordinator.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.health.interval_ms == 0 {
            anyhow::bail!("health.interval_ms must be greater than zero");
        }
        if self.health.heartbeat_timeout_ms == 0 {
            anyhow::bail!("health.heartbeat_timeout_ms must be greater than zero");
        }
        if self.dispatch.assign_timeout_ms == 0 {
            anyhow::bail!("dispatch.assign_timeout_ms must be greater than zero");
        }
        if self.session.relay_buffer == 0 || self.session.outbound_buffer == 0 {
            anyhow::bail!("session buffers must hold at least one frame");
        }
        if self.reporting.usage_capacity == 0 || self.reporting.metrics_capacity == 0 {
            anyhow::bail!("reporting capacities must be greater than zero");
        }
        if self.server.max_sessions == 0 {
            anyhow::bail!("server.max_sessions must be greater than zero");
        }
        Ok(())
    }
}

/// Config path from the environment, falling back to `coordinator.toml`.
pub fn config_path_from_env() -> String {
    std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

/// Parse and validate a coordinator config from TOML text.
pub fn parse_coordinator_config(content: &str) -> anyhow::Result<CoordinatorConfig> {
    let config: CoordinatorConfig = toml::from_str(content)
        .map_err(|e| anyhow::anyhow!("Failed to parse coordinator config: {}", e))?;
    config.validate()?;
    Ok(config)
}

// Basic config loader
pub fn load_coordinator_config(path: &str) -> anyhow::Result<CoordinatorConfig> {
    let config_content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file from {}: {}", path, e))?;
    parse_coordinator_config(&config_content)
        .map_err(|e| anyhow::anyhow!("Invalid config at {}: {}", path, e))
}
