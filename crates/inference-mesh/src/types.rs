use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a connected inference node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a single job attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Node status as tracked by the registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Registered, waiting for the first heartbeat
    Connecting,
    /// Live and idle
    Active,
    /// Holding exactly one job
    Busy,
    /// Evicted or disconnected; terminal until a fresh REGISTER
    Inactive,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Connecting => "connecting",
            NodeStatus::Active => "active",
            NodeStatus::Busy => "busy",
            NodeStatus::Inactive => "inactive",
        }
    }
}

/// Snapshot of a registry entry. Never carries the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// Owning account
    pub account_id: String,
    /// Model identifiers this node advertises
    pub models: BTreeSet<String>,
    /// Base58 Ed25519 key, present only for trusted TEE nodes
    pub public_key: Option<String>,
    /// Attestation document presented at REGISTER (base64)
    pub attestation: Option<String>,
    pub status: NodeStatus,
    /// Milliseconds since the registry epoch of the last heartbeat
    pub last_heartbeat_ms: u64,
    pub current_job: Option<JobId>,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

impl Node {
    pub fn is_tee(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }
}

/// Capabilities presented at REGISTER
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeCapabilities {
    pub account_id: String,
    pub models: BTreeSet<String>,
    pub public_key: Option<String>,
    pub attestation: Option<String>,
}

impl NodeCapabilities {
    pub fn for_models<I, S>(account_id: &str, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            account_id: account_id.to_string(),
            models: models.into_iter().map(Into::into).collect(),
            public_key: None,
            attestation: None,
        }
    }

    pub fn with_tee(mut self, public_key: String, attestation: String) -> Self {
        self.public_key = Some(public_key);
        self.attestation = Some(attestation);
        self
    }
}

/// Kind of inference a request asks for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InferenceKind {
    Completion,
    Embedding,
}

/// A client request as handed to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceRequest {
    pub kind: InferenceKind,
    pub model: String,
    /// Client body exactly as received; the request side of the digest
    pub body: serde_json::Value,
    pub stream: bool,
    /// Verified inference requested: only trusted TEE nodes are eligible
    pub verified: bool,
    /// Account billed for the request, set by the caller after authentication
    #[serde(default)]
    pub account_id: Option<String>,
}

impl InferenceRequest {
    /// Build a request from a client body, reading `model`, `stream` and `verified`.
    pub fn from_body(kind: InferenceKind, body: serde_json::Value) -> MeshResult<Self> {
        let object = body
            .as_object()
            .ok_or_else(|| MeshError::InvalidRequest("request body must be a JSON object".into()))?;
        let model = object
            .get("model")
            .and_then(|m| m.as_str())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| MeshError::InvalidRequest("missing model".into()))?
            .to_string();
        let stream = object.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
        let verified = object.get("verified").and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(Self {
            kind,
            model,
            body,
            stream,
            verified,
            account_id: None,
        })
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

/// Token counters reported with JOB_DONE
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Job lifecycle; only moves forward
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Dispatched,
    Streaming,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Dispatched | JobState::Streaming)
    }
}

/// One attempt at serving a request on one node
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub request: InferenceRequest,
    pub node_id: Option<NodeId>,
    state: JobState,
    pub retry_count: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub failure: Option<MeshError>,
}

impl Job {
    pub fn new(request: InferenceRequest) -> Self {
        Self {
            id: JobId::generate(),
            request,
            node_id: None,
            state: JobState::Queued,
            retry_count: 0,
            created_at: chrono::Utc::now(),
            failure: None,
        }
    }

    /// Fresh attempt for the same request after `self` failed.
    pub fn retry(&self) -> Self {
        Self {
            id: JobId::generate(),
            request: self.request.clone(),
            node_id: None,
            state: JobState::Queued,
            retry_count: self.retry_count + 1,
            created_at: self.created_at,
            failure: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move to `next`. Repeating the current non-terminal state is a no-op;
    /// moving backwards or out of a terminal state is rejected.
    pub fn advance(&mut self, next: JobState) -> MeshResult<()> {
        if self.state.is_terminal() {
            return Err(MeshError::Protocol(format!(
                "job {} is already {:?}",
                self.id, self.state
            )));
        }
        if next == self.state {
            return Ok(());
        }
        let allowed = match (self.state, next) {
            (_, JobState::Failed) => true,
            (JobState::Queued, JobState::Dispatched) => true,
            (JobState::Dispatched, JobState::Streaming) => true,
            (JobState::Dispatched, JobState::Completed) => true,
            (JobState::Streaming, JobState::Completed) => true,
            _ => false,
        };
        if !allowed {
            return Err(MeshError::Protocol(format!(
                "job {} cannot move from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self, error: MeshError) {
        if self.advance(JobState::Failed).is_ok() {
            self.failure = Some(error);
        }
    }
}
