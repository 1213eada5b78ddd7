//! Interfaces to systems outside the coordinator core, with in-memory
//! implementations used by the service binary and tests.

use crate::error::{MeshError, MeshResult};
use crate::types::{JobId, NodeId};
use async_trait::async_trait;
use base64::Engine;
use mesh_config::{NodeCredentialConfig, TrustConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{info, warn};

/// Node identity resolved from a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub account_id: String,
}

/// Durable record of provisioned nodes
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Resolve a node credential. `None` means the credential is unknown.
    async fn get_by_auth(&self, credential: &str) -> MeshResult<Option<NodeIdentity>>;

    /// Mark every durable row inactive. Returns the number of rows changed.
    async fn persist_inactive_all(&self) -> MeshResult<usize>;

    async fn persist_active(&self, node_id: &NodeId) -> MeshResult<()>;
}

/// Analytics events emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    NodeConnected {
        node_id: NodeId,
        tee: bool,
    },
    NodeDisconnected {
        node_id: NodeId,
        reason: String,
    },
    JobCompleted {
        job_id: JobId,
        node_id: NodeId,
        model: String,
        total_tokens: u64,
        verified: bool,
    },
    JobFailed {
        job_id: JobId,
        model: String,
        error: String,
    },
}

impl AnalyticsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AnalyticsEvent::NodeConnected { .. } => "node_connected",
            AnalyticsEvent::NodeDisconnected { .. } => "node_disconnected",
            AnalyticsEvent::JobCompleted { .. } => "job_completed",
            AnalyticsEvent::JobFailed { .. } => "job_failed",
        }
    }
}

/// Fire-and-forget analytics
pub trait AnalyticsSink: Send + Sync {
    fn track_event(&self, account_id: &str, event: AnalyticsEvent);
}

/// Downstream queue for usage and metrics records
#[async_trait]
pub trait RecordQueue<T: Send + 'static>: Send + Sync {
    async fn enqueue(&self, record: T) -> MeshResult<()>;
}

/// Token usage of one completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub job_id: JobId,
    /// Account billed for the request, if the caller supplied one
    pub account_id: Option<String>,
    pub node_id: NodeId,
    /// Account owning the node
    pub node_account_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub verified: bool,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Timing and outcome of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub job_id: JobId,
    pub node_id: Option<NodeId>,
    pub model: String,
    /// completed, failed or cancelled
    pub outcome: String,
    pub latency_ms: u64,
    pub first_chunk_ms: Option<u64>,
    pub retries: u32,
}

pub type UsageQueue = dyn RecordQueue<UsageRecord>;
pub type MetricsQueue = dyn RecordQueue<MetricsRecord>;

/// Attestation measurements and keys the coordinator accepts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedAttestations {
    pub measurements: Vec<String>,
    pub public_keys: Vec<String>,
}

impl TrustedAttestations {
    /// A node is trusted when its key is listed and, if any measurements are
    /// configured, its attestation measurement is listed too.
    pub fn is_trusted(&self, measurement: &str, public_key: &str) -> bool {
        let key_ok = self.public_keys.iter().any(|k| k == public_key);
        let measurement_ok =
            self.measurements.is_empty() || self.measurements.iter().any(|m| m == measurement);
        key_ok && measurement_ok
    }
}

/// Source of trusted TEE attestations
#[async_trait]
pub trait TeeTrustStore: Send + Sync {
    async fn list_trusted_attestations(&self) -> MeshResult<TrustedAttestations>;
}

/// Measurement of a base64 attestation document: hex SHA-256 of its bytes.
pub fn attestation_measurement(attestation: &str) -> MeshResult<String> {
    let document = base64::engine::general_purpose::STANDARD
        .decode(attestation.trim())
        .map_err(|e| MeshError::UntrustedAttestation(format!("attestation is not base64: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&document)))
}

/// Node directory backed by a static credential table
pub struct InMemoryNodeDirectory {
    credentials: RwLock<HashMap<String, NodeIdentity>>,

    /// Persisted active flag per node
    persisted: Mutex<HashMap<NodeId, bool>>,
}

impl Default for InMemoryNodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNodeDirectory {
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(HashMap::new()),
            persisted: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(nodes: &[NodeCredentialConfig]) -> Self {
        let directory = Self::new();
        for node in nodes {
            directory.add_node(&node.credential, NodeId::new(&node.node_id), &node.account_id);
        }
        directory
    }

    pub fn add_node(&self, credential: &str, node_id: NodeId, account_id: &str) {
        self.credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                credential.to_string(),
                NodeIdentity {
                    node_id,
                    account_id: account_id.to_string(),
                },
            );
    }

    /// Whether the node's durable row is currently marked active.
    pub fn is_persisted_active(&self, node_id: &NodeId) -> bool {
        self.persisted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait]
impl NodeDirectory for InMemoryNodeDirectory {
    async fn get_by_auth(&self, credential: &str) -> MeshResult<Option<NodeIdentity>> {
        Ok(self
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(credential)
            .cloned())
    }

    async fn persist_inactive_all(&self) -> MeshResult<usize> {
        let mut persisted = self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        let mut changed = 0;
        for active in persisted.values_mut().filter(|active| **active) {
            *active = false;
            changed += 1;
        }
        Ok(changed)
    }

    async fn persist_active(&self, node_id: &NodeId) -> MeshResult<()> {
        self.persisted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.clone(), true);
        Ok(())
    }
}

/// Trust store with a fixed set of attestations
pub struct StaticTrustStore {
    trusted: TrustedAttestations,
}

impl StaticTrustStore {
    pub fn new(trusted: TrustedAttestations) -> Self {
        Self { trusted }
    }

    pub fn from_config(config: &TrustConfig) -> Self {
        Self::new(TrustedAttestations {
            measurements: config.measurements.clone(),
            public_keys: config.public_keys.clone(),
        })
    }
}

#[async_trait]
impl TeeTrustStore for StaticTrustStore {
    async fn list_trusted_attestations(&self) -> MeshResult<TrustedAttestations> {
        Ok(self.trusted.clone())
    }
}

/// Analytics sink that writes events to the log
#[derive(Debug, Default)]
pub struct TracingAnalyticsSink;

impl AnalyticsSink for TracingAnalyticsSink {
    fn track_event(&self, account_id: &str, event: AnalyticsEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(account_id, event = event.name(), %payload, "analytics event"),
            Err(e) => warn!(account_id, event = event.name(), error = %e, "unserializable analytics event"),
        }
    }
}

/// Queue that writes each record to the log as JSON
#[derive(Debug, Default)]
pub struct TracingRecordQueue {
    kind: &'static str,
}

impl TracingRecordQueue {
    pub fn new(kind: &'static str) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl<T: Serialize + Send + 'static> RecordQueue<T> for TracingRecordQueue {
    async fn enqueue(&self, record: T) -> MeshResult<()> {
        let payload = serde_json::to_string(&record)?;
        info!(kind = self.kind, %payload, "record");
        Ok(())
    }
}

/// Bounded queue that keeps every record it accepts
pub struct CollectingQueue<T> {
    records: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Clone> CollectingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn records(&self) -> Vec<T> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> RecordQueue<T> for CollectingQueue<T> {
    async fn enqueue(&self, record: T) -> MeshResult<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= self.capacity {
            return Err(MeshError::QueueOverflow(format!(
                "queue full at {} records",
                self.capacity
            )));
        }
        records.push(record);
        Ok(())
    }
}
