//! Periodic liveness sweep and durable-state reconciliation.

use crate::collaborators::NodeDirectory;
use crate::error::MeshResult;
use crate::metrics::MeshMetrics;
use crate::registry::NodeRegistry;
use crate::types::NodeId;
use mesh_config::HealthConfig;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    directory: Arc<dyn NodeDirectory>,
    metrics: Arc<MeshMetrics>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        directory: Arc<dyn NodeDirectory>,
        metrics: Arc<MeshMetrics>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            metrics,
            config,
        }
    }

    /// Deactivate every node whose last heartbeat is older than the timeout
    /// at `now`. Returns the nodes this sweep evicted.
    pub fn sweep(&self, now: Instant) -> Vec<NodeId> {
        let timeout = self.config.heartbeat_timeout();
        let mut evicted = Vec::new();
        for node_id in self.registry.stale_nodes(now, timeout) {
            match self.registry.deactivate(&node_id, "heartbeat timeout") {
                Ok(true) => {
                    self.metrics.evictions.inc();
                    evicted.push(node_id);
                }
                Ok(false) => {}
                Err(e) => debug!(node_id = %node_id, error = %e, "node left before eviction"),
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted stale nodes");
        }
        self.metrics.observe_registry(&self.registry);
        evicted
    }

    /// Mark durable rows left active by a previous run as inactive.
    pub async fn reconcile_startup(&self) -> MeshResult<usize> {
        let changed = self.directory.persist_inactive_all().await?;
        info!(changed, "startup reconciliation complete");
        Ok(changed)
    }

    /// Force every node inactive and persist the final state.
    pub async fn reconcile_shutdown(&self) -> MeshResult<usize> {
        let deactivated = self.registry.deactivate_all("coordinator shutdown");
        let changed = self.directory.persist_inactive_all().await?;
        info!(
            deactivated = deactivated.len(),
            persisted = changed,
            "shutdown reconciliation complete"
        );
        self.metrics.observe_registry(&self.registry);
        Ok(changed)
    }

    /// Sweep on a fixed interval until `shutdown` flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(Instant::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("health monitor stopped");
        })
    }
}
