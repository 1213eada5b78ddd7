//! One long-lived session per connected node.
//!
//! The session exclusively owns the transport. Everything else reaches the
//! node through a [`SessionHandle`], which the registry stores next to the
//! node entry. Lifecycle: Connected → Registered → Idle/Busy → Closing →
//! Closed.

use crate::collaborators::{
    attestation_measurement, AnalyticsEvent, AnalyticsSink, NodeDirectory, TeeTrustStore,
};
use crate::envelope::decode_public_key;
use crate::error::{MeshError, MeshResult};
use crate::metrics::MeshMetrics;
use crate::protocol::transport::Transport;
use crate::protocol::wire::{CoordinatorMessage, NodeMessage};
use crate::registry::NodeRegistry;
use crate::types::{Job, JobId, JobState, NodeCapabilities, NodeId, NodeStatus, Usage};
use mesh_config::SessionConfig;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Output of a running job, in node order
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Chunk {
        index: u64,
        data: serde_json::Value,
    },
    Done {
        output: serde_json::Value,
        usage: Usage,
        signature: Option<String>,
    },
    Failed(MeshError),
}

/// A job handed to a session together with the channel its output goes to
pub struct JobTicket {
    pub job: Job,
    pub events: mpsc::Sender<JobEvent>,
}

enum SessionCommand {
    Assign {
        ticket: JobTicket,
        ack: oneshot::Sender<MeshResult<()>>,
    },
    Cancel {
        job_id: JobId,
    },
    Close {
        reason: String,
    },
}

/// Command handle to a node session
#[derive(Clone)]
pub struct SessionHandle {
    node_id: NodeId,
    session_id: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("node_id", &self.node_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl SessionHandle {
    fn new(node_id: NodeId, session_id: u64) -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (
            Self {
                node_id,
                session_id,
                commands,
            },
            receiver,
        )
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Ask the session to close. No-op if it is already gone.
    pub fn close(&self, reason: &str) {
        let _ = self.commands.send(SessionCommand::Close {
            reason: reason.to_string(),
        });
    }

    pub fn cancel(&self, job_id: &JobId) {
        let _ = self.commands.send(SessionCommand::Cancel {
            job_id: job_id.clone(),
        });
    }

    /// Send JOB_ASSIGN and wait for the node's acknowledgement. On failure
    /// the claim on the node is released; a missing ack within `timeout` is
    /// a `DispatchTimeout`. If the caller stops waiting, the job is
    /// cancelled and the claim released.
    pub async fn assign(
        &self,
        ticket: JobTicket,
        timeout: Duration,
        registry: &NodeRegistry,
    ) -> MeshResult<()> {
        let job_id = ticket.job.id.clone();
        let mut pending = PendingAssign {
            handle: self,
            registry,
            job_id: job_id.clone(),
            armed: true,
        };
        let (ack, acked) = oneshot::channel();
        let result = if self
            .commands
            .send(SessionCommand::Assign { ticket, ack })
            .is_err()
        {
            Err(MeshError::SessionClosed(self.node_id.clone()))
        } else {
            match tokio::time::timeout(timeout, acked).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(MeshError::SessionClosed(self.node_id.clone())),
                Err(_) => {
                    self.cancel(&job_id);
                    Err(MeshError::DispatchTimeout {
                        node_id: self.node_id.clone(),
                        job_id: job_id.clone(),
                    })
                }
            }
        };
        pending.armed = false;
        if let Err(e) = &result {
            debug!(node_id = %self.node_id, job_id = %job_id, error = %e, "assignment failed");
            registry.release_job(&self.node_id, &job_id);
        }
        result
    }
}

/// An assignment still waiting for its ack. Dropped while armed, it
/// cancels the job on the node and frees the claim.
struct PendingAssign<'a> {
    handle: &'a SessionHandle,
    registry: &'a NodeRegistry,
    job_id: JobId,
    armed: bool,
}

impl Drop for PendingAssign<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(node_id = %self.handle.node_id, job_id = %self.job_id, "assignment abandoned by caller");
            self.handle.cancel(&self.job_id);
            self.registry.release_job(&self.handle.node_id, &self.job_id);
        }
    }
}

/// Shared services a session needs
pub struct SessionContext {
    pub registry: Arc<NodeRegistry>,
    pub directory: Arc<dyn NodeDirectory>,
    pub trust: Arc<dyn TeeTrustStore>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub metrics: Arc<MeshMetrics>,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, waiting for REGISTER
    Connected,
    /// Registered, waiting for the first heartbeat
    Registered,
    Idle,
    Busy,
    Closing,
    Closed,
}

enum Flow {
    Continue,
    Close(String),
}

/// Job currently held by the session
struct ActiveJob {
    job: Job,
    events: mpsc::Sender<JobEvent>,
    /// Pending acknowledgement for the dispatcher
    ack: Option<oneshot::Sender<MeshResult<()>>>,
    /// Events waiting for room in `events`; non-empty means the node is paused
    backlog: VecDeque<JobEvent>,
    /// Last time the backlog moved while paused
    last_progress: Option<Instant>,
    last_index: Option<u64>,
    /// JOB_DONE or JOB_ERROR received
    finished: bool,
}

impl ActiveJob {
    fn acknowledge(&mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(Ok(()));
        }
    }
}

pub struct NodeSession {
    session_id: u64,
    transport: Transport,
    ctx: Arc<SessionContext>,
    state: SessionState,
    node_id: Option<NodeId>,
    account_id: String,
    job: Option<ActiveJob>,
    /// False once the node said DISCONNECT or the transport dropped
    notify_node: bool,
}

impl NodeSession {
    pub fn new(transport: Transport, ctx: Arc<SessionContext>) -> Self {
        Self {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            ctx,
            state: SessionState::Connected,
            node_id: None,
            account_id: String::new(),
            job: None,
            notify_node: true,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(session_id = self.session_id, from = ?self.state, to = ?state, "session state");
            self.state = state;
        }
    }

    /// Drive the session until the node goes away or the session is closed.
    pub async fn run(mut self) -> MeshResult<()> {
        let mut commands = match self.handshake().await {
            Ok(commands) => commands,
            Err(e) => {
                warn!(peer = %self.transport.peer, error = %e, "node registration rejected");
                self.transport.try_send(CoordinatorMessage::Rejected {
                    reason: e.to_string(),
                });
                self.set_state(SessionState::Closed);
                return Err(e);
            }
        };
        let reason = self.serve(&mut commands).await;
        commands.close();
        self.teardown(&reason).await;
        Ok(())
    }

    async fn handshake(&mut self) -> MeshResult<mpsc::UnboundedReceiver<SessionCommand>> {
        let frame = tokio::time::timeout(self.ctx.config.register_timeout(), self.transport.recv())
            .await
            .map_err(|_| MeshError::Protocol("no REGISTER within timeout".to_string()))?;
        let message = match frame {
            Some(frame) => frame?,
            None => {
                return Err(MeshError::Io(format!(
                    "{} closed before REGISTER",
                    self.transport.peer
                )))
            }
        };
        let (credential, models, public_key, attestation) = match message {
            NodeMessage::Register {
                credential,
                models,
                public_key,
                attestation,
            } => (credential, models, public_key, attestation),
            other => {
                return Err(MeshError::Protocol(format!(
                    "expected REGISTER, got {:?}",
                    other
                )))
            }
        };
        if models.is_empty() {
            return Err(MeshError::Protocol(
                "REGISTER must advertise at least one model".to_string(),
            ));
        }

        let identity = self
            .ctx
            .directory
            .get_by_auth(&credential)
            .await?
            .ok_or(MeshError::Unauthorized)?;
        let node_id = identity.node_id.clone();

        let mut capabilities = NodeCapabilities::for_models(&identity.account_id, models);
        let verified_capable = match (public_key, attestation) {
            (Some(public_key), Some(attestation)) => {
                match self.check_attestation(&public_key, &attestation).await {
                    Ok(()) => {
                        capabilities = capabilities.with_tee(public_key, attestation);
                        true
                    }
                    Err(e) => {
                        warn!(node_id = %node_id, error = %e, "admitting node without TEE eligibility");
                        false
                    }
                }
            }
            (None, None) => false,
            _ => {
                warn!(node_id = %node_id, "public_key and attestation must be presented together");
                false
            }
        };

        let (handle, commands) = SessionHandle::new(node_id.clone(), self.session_id);
        self.ctx
            .registry
            .register_session(node_id.clone(), capabilities, handle)?;
        self.node_id = Some(node_id.clone());
        self.account_id = identity.account_id;
        self.set_state(SessionState::Registered);
        self.ctx.metrics.sessions.inc();

        if let Err(e) = self
            .transport
            .send(CoordinatorMessage::Registered {
                node_id: node_id.clone(),
                verified_capable,
            })
            .await
        {
            warn!(node_id = %node_id, error = %e, "failed to confirm registration");
        }
        self.ctx.analytics.track_event(
            &self.account_id,
            AnalyticsEvent::NodeConnected {
                node_id,
                tee: verified_capable,
            },
        );
        Ok(commands)
    }

    async fn check_attestation(&self, public_key: &str, attestation: &str) -> MeshResult<()> {
        decode_public_key(public_key)
            .map_err(|e| MeshError::UntrustedAttestation(e.to_string()))?;
        let measurement = attestation_measurement(attestation)?;
        let trusted = self.ctx.trust.list_trusted_attestations().await?;
        if trusted.is_trusted(&measurement, public_key) {
            Ok(())
        } else {
            Err(MeshError::UntrustedAttestation(format!(
                "measurement {} with key {} is not trusted",
                measurement, public_key
            )))
        }
    }

    async fn serve(&mut self, commands: &mut mpsc::UnboundedReceiver<SessionCommand>) -> String {
        loop {
            let relay = self
                .job
                .as_ref()
                .filter(|job| !job.backlog.is_empty())
                .map(|job| job.events.clone());
            let relay_pending = relay.is_some();
            let stall_deadline = self
                .job
                .as_ref()
                .and_then(|job| job.last_progress)
                .map(|at| at + self.ctx.config.stall_timeout());

            let flow = tokio::select! {
                frame = self.transport.recv() => match frame {
                    Some(Ok(message)) => self.on_message(message).await,
                    Some(Err(e)) => Flow::Close(format!("protocol error: {}", e)),
                    None => {
                        self.notify_node = false;
                        Flow::Close("transport closed".to_string())
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => Flow::Close("session handle dropped".to_string()),
                },
                permit = reserve_relay(relay), if relay_pending => self.on_relay_slot(permit).await,
                _ = sleep_until_deadline(stall_deadline), if stall_deadline.is_some() => {
                    Flow::Close("client stalled".to_string())
                }
            };
            if let Flow::Close(reason) = flow {
                return reason;
            }
        }
    }

    fn node_id(&self) -> NodeId {
        self.node_id.clone().unwrap_or_else(|| NodeId::new("unregistered"))
    }

    /// The running job if it matches `job_id` and has not finished.
    fn job_mut(&mut self, job_id: &JobId) -> Option<&mut ActiveJob> {
        self.job
            .as_mut()
            .filter(|active| &active.job.id == job_id && !active.finished)
    }

    async fn on_message(&mut self, message: NodeMessage) -> Flow {
        match message {
            NodeMessage::Register { .. } => {
                warn!(node_id = %self.node_id(), "duplicate REGISTER ignored");
                Flow::Continue
            }
            NodeMessage::Heartbeat => self.on_heartbeat().await,
            NodeMessage::JobAck { job_id } => {
                let node_id = self.node_id();
                match self.job_mut(&job_id) {
                    Some(active) => active.acknowledge(),
                    None => warn!(node_id = %node_id, job_id = %job_id, "JOB_ACK for unknown job"),
                }
                Flow::Continue
            }
            NodeMessage::JobChunk {
                job_id,
                index,
                data,
            } => self.on_chunk(job_id, index, data).await,
            NodeMessage::JobDone {
                job_id,
                output,
                usage,
                signature,
            } => {
                let node_id = self.node_id();
                let Some(active) = self.job_mut(&job_id) else {
                    warn!(node_id = %node_id, job_id = %job_id, "JOB_DONE for unknown job");
                    return Flow::Continue;
                };
                active.acknowledge();
                if let Err(e) = active.job.advance(JobState::Completed) {
                    warn!(node_id = %node_id, error = %e, "ignoring JOB_DONE");
                    return Flow::Continue;
                }
                active.finished = true;
                debug!(node_id = %node_id, job_id = %job_id, tokens = usage.total_tokens(), "job done");
                self.relay(JobEvent::Done {
                    output,
                    usage,
                    signature,
                })
                .await
            }
            NodeMessage::JobError { job_id, message } => {
                let node_id = self.node_id();
                let Some(active) = self.job_mut(&job_id) else {
                    warn!(node_id = %node_id, job_id = %job_id, "JOB_ERROR for unknown job");
                    return Flow::Continue;
                };
                warn!(node_id = %node_id, job_id = %job_id, error = %message, "node reported job failure");
                let error = MeshError::InferenceError(message);
                active.job.fail(error.clone());
                active.finished = true;
                let flow = match active.ack.take() {
                    Some(ack) => {
                        let _ = ack.send(Err(error));
                        self.job = None;
                        self.set_state(SessionState::Idle);
                        Flow::Continue
                    }
                    None => self.relay(JobEvent::Failed(error)).await,
                };
                // A backlogged failure releases the node once it is delivered.
                if self.job.is_none() {
                    self.ctx.registry.release_job(&node_id, &job_id);
                }
                flow
            }
            NodeMessage::Disconnect => {
                self.notify_node = false;
                Flow::Close("node disconnected".to_string())
            }
        }
    }

    async fn on_heartbeat(&mut self) -> Flow {
        let node_id = self.node_id();
        match self.ctx.registry.heartbeat(&node_id, Instant::now()) {
            Ok(outcome) => {
                if outcome.promoted {
                    info!(node_id = %node_id, "node active");
                    self.set_state(SessionState::Idle);
                    if let Err(e) = self.ctx.directory.persist_active(&node_id).await {
                        warn!(node_id = %node_id, error = %e, "failed to persist active node");
                    }
                }
                if outcome.status == NodeStatus::Inactive {
                    return Flow::Close("node deactivated".to_string());
                }
                Flow::Continue
            }
            Err(e) => Flow::Close(format!("registry entry lost: {}", e)),
        }
    }

    async fn on_chunk(&mut self, job_id: JobId, index: u64, data: serde_json::Value) -> Flow {
        let node_id = self.node_id();
        let Some(active) = self.job_mut(&job_id) else {
            warn!(node_id = %node_id, job_id = %job_id, "JOB_CHUNK for unknown job");
            return Flow::Continue;
        };
        // A chunk before JOB_ACK acknowledges implicitly.
        active.acknowledge();
        if active.job.state() == JobState::Dispatched {
            if let Err(e) = active.job.advance(JobState::Streaming) {
                warn!(node_id = %node_id, error = %e, "ignoring chunk");
                return Flow::Continue;
            }
        }
        if let Some(last) = active.last_index {
            if index <= last {
                warn!(node_id = %node_id, job_id = %job_id, index, last, "chunk index out of sequence");
            }
        }
        active.last_index = Some(index);
        self.relay(JobEvent::Chunk { index, data }).await
    }

    /// Hand an event to the job's consumer, pausing the node while the
    /// consumer is behind.
    async fn relay(&mut self, event: JobEvent) -> Flow {
        let limit = self.ctx.config.relay_buffer;
        let node_id = self.node_id();
        let Some(active) = self.job.as_mut() else {
            return Flow::Continue;
        };

        if active.backlog.is_empty() {
            match active.events.try_send(event) {
                Ok(()) => {
                    if active.finished {
                        self.job = None;
                        self.set_state(SessionState::Idle);
                    }
                    return Flow::Continue;
                }
                Err(TrySendError::Full(event)) => active.backlog.push_back(event),
                Err(TrySendError::Closed(_)) => return self.abandon("client went away").await,
            }
        } else {
            active.backlog.push_back(event);
        }

        if active.backlog.len() > limit {
            return Flow::Close("relay backlog exceeded".to_string());
        }
        if active.last_progress.is_none() {
            active.last_progress = Some(Instant::now());
            let job_id = active.job.id.clone();
            self.ctx.metrics.relay_pauses.inc();
            debug!(node_id = %node_id, job_id = %job_id, "client behind, pausing node");
            if !active.finished {
                return self.send(CoordinatorMessage::Pause { job_id }).await;
            }
        }
        Flow::Continue
    }

    /// Room opened up in the consumer channel while paused.
    async fn on_relay_slot(&mut self, permit: Option<mpsc::OwnedPermit<JobEvent>>) -> Flow {
        let Some(permit) = permit else {
            return self.abandon("client went away").await;
        };
        let Some(active) = self.job.as_mut() else {
            return Flow::Continue;
        };
        if let Some(event) = active.backlog.pop_front() {
            permit.send(event);
            active.last_progress = Some(Instant::now());
        }
        if !active.backlog.is_empty() {
            return Flow::Continue;
        }

        active.last_progress = None;
        if active.finished {
            let failed = active.job.state() == JobState::Failed;
            let job_id = active.job.id.clone();
            self.job = None;
            self.set_state(SessionState::Idle);
            if failed {
                self.ctx.registry.release_job(&self.node_id(), &job_id);
            }
            return Flow::Continue;
        }
        let job_id = active.job.id.clone();
        debug!(node_id = %self.node_id(), job_id = %job_id, "client caught up, resuming node");
        self.send(CoordinatorMessage::Resume { job_id }).await
    }

    /// Drop the running job: the consumer is gone or the job was cancelled.
    async fn abandon(&mut self, reason: &str) -> Flow {
        let Some(mut active) = self.job.take() else {
            return Flow::Continue;
        };
        let node_id = self.node_id();
        let job_id = active.job.id.clone();
        info!(node_id = %node_id, job_id = %job_id, reason, "cancelling job");
        active.job.fail(MeshError::Cancelled(job_id.clone()));
        if let Some(ack) = active.ack.take() {
            let _ = ack.send(Err(MeshError::Cancelled(job_id.clone())));
        }
        self.ctx.registry.release_job(&node_id, &job_id);
        self.set_state(SessionState::Idle);
        if active.finished {
            return Flow::Continue;
        }
        self.send(CoordinatorMessage::Cancel { job_id }).await
    }

    async fn on_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Assign { ticket, ack } => self.on_assign(ticket, ack).await,
            SessionCommand::Cancel { job_id } => {
                if self.job.as_ref().map(|a| a.job.id == job_id).unwrap_or(false) {
                    self.abandon("cancelled").await
                } else {
                    debug!(node_id = %self.node_id(), job_id = %job_id, "cancel for job not running here");
                    Flow::Continue
                }
            }
            SessionCommand::Close { reason } => Flow::Close(reason),
        }
    }

    async fn on_assign(&mut self, ticket: JobTicket, ack: oneshot::Sender<MeshResult<()>>) -> Flow {
        let node_id = self.node_id();
        if self.job.is_some() || self.state != SessionState::Idle {
            let _ = ack.send(Err(MeshError::Protocol(format!(
                "node {} cannot take a job while {:?}",
                node_id, self.state
            ))));
            return Flow::Continue;
        }

        let JobTicket { mut job, events } = ticket;
        job.node_id = Some(node_id.clone());
        if let Err(e) = job.advance(JobState::Dispatched) {
            let _ = ack.send(Err(e));
            return Flow::Continue;
        }
        let assign = CoordinatorMessage::JobAssign {
            job_id: job.id.clone(),
            kind: job.request.kind,
            request: job.request.body.clone(),
        };
        if self.transport.send(assign).await.is_err() {
            let _ = ack.send(Err(MeshError::SessionClosed(node_id)));
            self.notify_node = false;
            return Flow::Close("transport closed".to_string());
        }
        debug!(node_id = %node_id, job_id = %job.id, model = %job.request.model, "job assigned");
        self.job = Some(ActiveJob {
            job,
            events,
            ack: Some(ack),
            backlog: VecDeque::new(),
            last_progress: None,
            last_index: None,
            finished: false,
        });
        self.set_state(SessionState::Busy);
        Flow::Continue
    }

    async fn send(&mut self, message: CoordinatorMessage) -> Flow {
        match self.transport.send(message).await {
            Ok(()) => Flow::Continue,
            Err(_) => {
                self.notify_node = false;
                Flow::Close("transport closed".to_string())
            }
        }
    }

    async fn teardown(&mut self, reason: &str) {
        self.set_state(SessionState::Closing);
        let node_id = self.node_id();

        if let Some(mut active) = self.job.take() {
            if !active.finished {
                let error = MeshError::NodeDisconnectedMidJob {
                    node_id: node_id.clone(),
                    job_id: active.job.id.clone(),
                };
                active.job.fail(error.clone());
                match active.ack.take() {
                    Some(ack) => {
                        let _ = ack.send(Err(MeshError::SessionClosed(node_id.clone())));
                    }
                    None => {
                        let _ = active.events.try_send(JobEvent::Failed(error));
                    }
                }
            }
        }

        self.ctx
            .registry
            .deactivate_session(&node_id, self.session_id, reason);
        self.ctx.registry.remove_session(&node_id, self.session_id);

        if self.notify_node {
            self.transport.try_send(CoordinatorMessage::Close {
                reason: reason.to_string(),
            });
        }
        self.ctx.metrics.sessions.dec();
        self.ctx.analytics.track_event(
            &self.account_id,
            AnalyticsEvent::NodeDisconnected {
                node_id: node_id.clone(),
                reason: reason.to_string(),
            },
        );
        info!(node_id = %node_id, reason, "session closed");
        self.set_state(SessionState::Closed);
    }
}

async fn reserve_relay(
    sender: Option<mpsc::Sender<JobEvent>>,
) -> Option<mpsc::OwnedPermit<JobEvent>> {
    match sender {
        Some(sender) => sender.reserve_owned().await.ok(),
        None => futures::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
