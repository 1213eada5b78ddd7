//! Wires the registry, sessions, dispatcher, health monitor and reporting
//! pipelines into one running coordinator.

use crate::collaborators::{
    AnalyticsSink, InMemoryNodeDirectory, MetricsQueue, MetricsRecord, NodeDirectory,
    StaticTrustStore, TeeTrustStore, TracingAnalyticsSink, TracingRecordQueue, UsageQueue,
    UsageRecord,
};
use crate::dispatcher::Dispatcher;
use crate::error::{MeshError, MeshResult};
use crate::health::HealthMonitor;
use crate::metrics::MeshMetrics;
use crate::protocol::session::SessionContext;
use crate::registry::NodeRegistry;
use crate::reporting::ReportingPipeline;
use crate::server::{spawn_listener, ListenerLimits};
use mesh_config::CoordinatorConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// External systems the coordinator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn NodeDirectory>,
    pub trust: Arc<dyn TeeTrustStore>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub usage_queue: Arc<UsageQueue>,
    pub metrics_queue: Arc<MetricsQueue>,
}

impl Collaborators {
    /// Collaborators backed by the config file and the log.
    pub fn in_memory(config: &CoordinatorConfig) -> Self {
        Self {
            directory: Arc::new(InMemoryNodeDirectory::from_config(&config.nodes)),
            trust: Arc::new(StaticTrustStore::from_config(&config.trust)),
            analytics: Arc::new(TracingAnalyticsSink),
            usage_queue: Arc::new(TracingRecordQueue::new("usage")),
            metrics_queue: Arc::new(TracingRecordQueue::new("metrics")),
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    collaborators: Collaborators,
    registry: Arc<NodeRegistry>,
    metrics: Arc<MeshMetrics>,
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthMonitor>,
    usage: Arc<ReportingPipeline<UsageRecord>>,
    reports: Arc<ReportingPipeline<MetricsRecord>>,
    shutdown_tx: watch::Sender<bool>,
    /// Stops the node listener ahead of the other tasks
    listener_tx: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, collaborators: Collaborators) -> MeshResult<Self> {
        config
            .validate()
            .map_err(|e| MeshError::InvalidRequest(format!("invalid configuration: {:#}", e)))?;

        let metrics = Arc::new(MeshMetrics::new()?);
        let registry = Arc::new(NodeRegistry::new());
        let usage = Arc::new(ReportingPipeline::new(
            "usage",
            config.reporting.usage_capacity,
            metrics.clone(),
        ));
        let reports = Arc::new(ReportingPipeline::new(
            "metrics",
            config.reporting.metrics_capacity,
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            config.dispatch.clone(),
            config.session.relay_buffer,
            metrics.clone(),
            usage.clone(),
            reports.clone(),
            collaborators.analytics.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            collaborators.directory.clone(),
            metrics.clone(),
            config.health.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        let (listener_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            collaborators,
            registry,
            metrics,
            dispatcher,
            health,
            usage,
            reports,
            shutdown_tx,
            listener_tx,
            listener: None,
            tasks: Vec::new(),
            local_addr: None,
        })
    }

    /// Reconcile durable state, bind the node listener and start the
    /// background tasks. Returns the bound address.
    pub async fn start(&mut self) -> MeshResult<SocketAddr> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }
        self.health.reconcile_startup().await?;

        let listener = TcpListener::bind(&self.config.server.listen_address).await?;
        let addr = listener.local_addr()?;

        let ctx = Arc::new(SessionContext {
            registry: self.registry.clone(),
            directory: self.collaborators.directory.clone(),
            trust: self.collaborators.trust.clone(),
            analytics: self.collaborators.analytics.clone(),
            metrics: self.metrics.clone(),
            config: self.config.session.clone(),
        });
        let limits = ListenerLimits {
            max_sessions: self.config.server.max_sessions,
            max_frame_bytes: self.config.server.max_frame_bytes,
            outbound_buffer: self.config.session.outbound_buffer,
        };

        self.listener = Some(spawn_listener(
            listener,
            ctx,
            limits,
            self.listener_tx.subscribe(),
        ));
        self.tasks
            .push(self.health.clone().spawn(self.shutdown_tx.subscribe()));
        self.tasks.push(self.usage.spawn_drain(
            self.collaborators.usage_queue.clone(),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.push(self.reports.spawn_drain(
            self.collaborators.metrics_queue.clone(),
            self.shutdown_tx.subscribe(),
        ));

        self.local_addr = Some(addr);
        info!(%addr, "coordinator started");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.registry.clone()
    }

    pub fn metrics(&self) -> Arc<MeshMetrics> {
        self.metrics.clone()
    }

    /// Stop taking requests and node connections, let in-flight work
    /// finish within the grace period, mark every node inactive and stop
    /// the background tasks.
    pub async fn shutdown(mut self) -> MeshResult<()> {
        info!("coordinator shutting down");
        self.dispatcher.stop_accepting();
        let _ = self.listener_tx.send(true);
        if let Some(mut listener) = self.listener.take() {
            if tokio::time::timeout(self.config.shutdown.join_timeout(), &mut listener)
                .await
                .is_err()
            {
                warn!("node listener did not stop in time, aborting");
                listener.abort();
            }
        }
        // Sessions still in their handshake are turned away from here on.
        self.registry.close_registrations();
        if !self
            .dispatcher
            .wait_idle(self.config.shutdown.grace_period())
            .await
        {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                "grace period elapsed with requests still in flight"
            );
        }

        let reconciled = self.health.reconcile_shutdown().await;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown.join_timeout();
        for mut task in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "background task failed"),
                Err(_) => {
                    warn!("background task did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        info!("coordinator stopped");
        reconciled.map(|_| ())
    }
}
