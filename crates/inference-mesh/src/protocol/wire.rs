//! Node wire protocol: message types and newline-delimited JSON framing.
//!
//! Every frame is one JSON object on a single line, tagged by `"type"`:
//!
//! ```text
//! {"type":"HEARTBEAT"}
//! {"type":"JOB_CHUNK","job_id":"…","index":0,"data":{…}}
//! ```

use crate::error::{MeshError, MeshResult};
use crate::types::{InferenceKind, JobId, NodeId, Usage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Default upper bound for a single frame (4 MB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Messages sent by a node to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeMessage {
    /// Authenticate and advertise capabilities
    Register {
        credential: String,
        models: Vec<String>,
        /// Base58 Ed25519 key (TEE nodes)
        #[serde(default)]
        public_key: Option<String>,
        /// Base64 attestation document (TEE nodes)
        #[serde(default)]
        attestation: Option<String>,
    },
    Heartbeat,
    /// Acknowledges a JOB_ASSIGN
    JobAck { job_id: JobId },
    /// Ordered partial output
    JobChunk {
        job_id: JobId,
        index: u64,
        data: serde_json::Value,
    },
    /// Final output and token counters
    JobDone {
        job_id: JobId,
        output: serde_json::Value,
        #[serde(default)]
        usage: Usage,
        /// Hex Ed25519 signature over the response digest (TEE nodes)
        #[serde(default)]
        signature: Option<String>,
    },
    JobError { job_id: JobId, message: String },
    /// Graceful goodbye
    Disconnect,
}

/// Messages sent by the coordinator to a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorMessage {
    Registered {
        node_id: NodeId,
        /// Whether the node was admitted for verified jobs
        verified_capable: bool,
    },
    Rejected { reason: String },
    JobAssign {
        job_id: JobId,
        kind: InferenceKind,
        request: serde_json::Value,
    },
    Cancel { job_id: JobId },
    /// Client side is backed up; stop sending chunks for this job
    Pause { job_id: JobId },
    Resume { job_id: JobId },
    Close { reason: String },
}

/// Encode a message as a single frame. The line codec appends the newline.
pub fn encode_frame<T: Serialize>(message: &T, max_frame_bytes: usize) -> MeshResult<String> {
    let line = serde_json::to_string(message)?;
    if line.len() > max_frame_bytes {
        return Err(MeshError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            line.len(),
            max_frame_bytes
        )));
    }
    Ok(line)
}

/// Decode one frame. Surrounding whitespace is ignored.
pub fn decode_frame<T: DeserializeOwned>(line: &str, max_frame_bytes: usize) -> MeshResult<T> {
    let line = line.trim();
    if line.len() > max_frame_bytes {
        return Err(MeshError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            line.len(),
            max_frame_bytes
        )));
    }
    serde_json::from_str(line).map_err(|e| MeshError::Protocol(format!("malformed frame: {}", e)))
}
