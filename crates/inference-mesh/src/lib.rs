#![deny(unsafe_code)]
//! Inference Mesh - routes inference requests to a fleet of remote nodes
//!
//! This crate provides the coordinator core:
//! - Node registry with liveness and job ownership
//! - One protocol session per connected node
//! - Dispatch with failover, streaming and flow control
//! - Heartbeat-based health monitoring
//! - Verification envelopes for TEE node responses

pub mod collaborators;
pub mod coordinator;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod reporting;
pub mod server;
pub mod types;

// Re-export common types
pub use collaborators::{
    AnalyticsEvent, AnalyticsSink, MetricsRecord, NodeDirectory, NodeIdentity, RecordQueue,
    TeeTrustStore, TrustedAttestations, UsageRecord,
};
pub use coordinator::{Collaborators, Coordinator};
pub use dispatcher::{Dispatcher, InferenceEvent, InferenceResponse, InferenceStream};
pub use envelope::{verify_envelope, VerificationEnvelope};
pub use error::{MeshError, MeshResult};
pub use health::HealthMonitor;
pub use registry::NodeRegistry;
pub use types::{InferenceKind, InferenceRequest, Job, JobId, JobState, Node, NodeId, NodeStatus, Usage};
