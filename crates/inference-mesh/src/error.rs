use crate::types::{JobId, NodeId};
use thiserror::Error;

/// Errors produced by the inference mesh core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    /// Heartbeat, claim or release against a node the registry does not know
    #[error("node {0} is not registered")]
    NodeNotRegistered(NodeId),

    /// No node can currently serve the requested model
    #[error("no available inference nodes for model {0}")]
    NoAvailableInferenceNodes(String),

    /// The node did not acknowledge JOB_ASSIGN in time
    #[error("node {node_id} did not acknowledge job {job_id}")]
    DispatchTimeout { node_id: NodeId, job_id: JobId },

    /// Transport loss or eviction while the node was running a job
    #[error("node {node_id} disconnected while running job {job_id}")]
    NodeDisconnectedMidJob { node_id: NodeId, job_id: JobId },

    /// The node reported a failure or retries were exhausted
    #[error("inference error: {0}")]
    InferenceError(String),

    /// Digest or signature mismatch on a TEE response
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// A reporting record was dropped
    #[error("queue overflow: {0}")]
    QueueOverflow(String),

    #[error("unauthorized node credential")]
    Unauthorized,

    #[error("untrusted attestation: {0}")]
    UntrustedAttestation(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The session owning the node is gone
    #[error("session for node {0} is closed")]
    SessionClosed(NodeId),

    #[error("job {0} was cancelled")]
    Cancelled(JobId),

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("metrics error: {0}")]
    Metrics(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MeshError {
    /// Whether the dispatcher may fail the job over to a different node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::DispatchTimeout { .. }
                | MeshError::NodeDisconnectedMidJob { .. }
                | MeshError::SessionClosed(_)
        )
    }

    /// Stable machine-readable code for client-facing surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::NodeNotRegistered(_) => "node_not_registered",
            MeshError::NoAvailableInferenceNodes(_) => "no_available_inference_nodes",
            MeshError::DispatchTimeout { .. } => "dispatch_timeout",
            MeshError::NodeDisconnectedMidJob { .. } => "node_disconnected_mid_job",
            MeshError::InferenceError(_) => "inference_error",
            MeshError::VerificationFailed(_) => "verification_failed",
            MeshError::QueueOverflow(_) => "queue_overflow",
            MeshError::Unauthorized => "unauthorized",
            MeshError::UntrustedAttestation(_) => "untrusted_attestation",
            MeshError::Protocol(_) => "protocol_error",
            MeshError::InvalidRequest(_) => "invalid_request",
            MeshError::SessionClosed(_) => "session_closed",
            MeshError::Cancelled(_) => "cancelled",
            MeshError::ShuttingDown => "shutting_down",
            MeshError::Collaborator(_) => "collaborator_error",
            MeshError::Metrics(_) => "metrics_error",
            MeshError::Io(_) => "io_error",
            MeshError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<std::io::Error> for MeshError {
    fn from(error: std::io::Error) -> Self {
        MeshError::Io(error.to_string())
    }
}

impl From<prometheus::Error> for MeshError {
    fn from(error: prometheus::Error) -> Self {
        MeshError::Metrics(error.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(error: serde_json::Error) -> Self {
        MeshError::Serialization(error.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
