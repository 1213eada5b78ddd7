use crate::error::MeshResult;
use crate::registry::NodeRegistry;
use crate::types::NodeStatus;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder,
};

/// Prometheus metrics for the coordinator core
pub struct MeshMetrics {
    registry: Registry,

    /// Dispatch results by outcome (completed, failed, cancelled, rejected)
    pub dispatches: IntCounterVec,

    /// Failover attempts on a different node
    pub retries: IntCounter,

    /// Nodes moved to Inactive by the health monitor
    pub evictions: IntCounter,

    /// Registry population by status
    pub nodes: IntGaugeVec,

    /// Open node sessions
    pub sessions: IntGauge,

    /// PAUSE frames sent because a client fell behind
    pub relay_pauses: IntCounter,

    /// Records dropped by a reporting pipeline
    pub dropped_records: IntCounterVec,

    /// Envelope checks by result
    pub verifications: IntCounterVec,

    /// Seconds from dispatch to the first relayed chunk
    pub first_chunk_seconds: Histogram,
}

impl MeshMetrics {
    /// Create new metrics registered in a private registry
    pub fn new() -> MeshResult<Self> {
        let registry = Registry::new();

        let dispatches = IntCounterVec::new(
            prometheus::opts!("mesh_dispatch_total", "Dispatch results by outcome"),
            &["outcome"],
        )?;
        let retries = IntCounter::new("mesh_dispatch_retries_total", "Failover attempts")?;
        let evictions = IntCounter::new("mesh_node_evictions_total", "Nodes evicted for missed heartbeats")?;
        let nodes = IntGaugeVec::new(
            prometheus::opts!("mesh_nodes", "Registered nodes by status"),
            &["status"],
        )?;
        let sessions = IntGauge::new("mesh_sessions_open", "Open node sessions")?;
        let relay_pauses = IntCounter::new("mesh_relay_pauses_total", "Flow-control pauses sent to nodes")?;
        let dropped_records = IntCounterVec::new(
            prometheus::opts!("mesh_reporting_dropped_total", "Reporting records dropped on overflow"),
            &["pipeline"],
        )?;
        let verifications = IntCounterVec::new(
            prometheus::opts!("mesh_verifications_total", "Verification envelope checks"),
            &["result"],
        )?;
        let first_chunk_seconds = Histogram::with_opts(
            HistogramOpts::new("mesh_first_chunk_seconds", "Time to first streamed chunk")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(dispatches.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(nodes.clone()))?;
        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(relay_pauses.clone()))?;
        registry.register(Box::new(dropped_records.clone()))?;
        registry.register(Box::new(verifications.clone()))?;
        registry.register(Box::new(first_chunk_seconds.clone()))?;

        Ok(Self {
            registry,
            dispatches,
            retries,
            evictions,
            nodes,
            sessions,
            relay_pauses,
            dropped_records,
            verifications,
            first_chunk_seconds,
        })
    }

    pub fn record_dispatch(&self, outcome: &str) {
        self.dispatches.with_label_values(&[outcome]).inc();
    }

    pub fn record_verification(&self, passed: bool) {
        let result = if passed { "passed" } else { "failed" };
        self.verifications.with_label_values(&[result]).inc();
    }

    /// Refresh the node gauges from the registry.
    pub fn observe_registry(&self, registry: &NodeRegistry) {
        for status in [
            NodeStatus::Connecting,
            NodeStatus::Active,
            NodeStatus::Busy,
            NodeStatus::Inactive,
        ] {
            self.nodes
                .with_label_values(&[status.as_str()])
                .set(registry.count_by_status(status) as i64);
        }
    }

    /// Render all metrics in the Prometheus text format.
    pub fn gather_text(&self) -> MeshResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
