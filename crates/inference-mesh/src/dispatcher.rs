//! Dispatcher: selects a node for each request and drives the job until a
//! response, a terminal error, or client cancellation.

use crate::collaborators::{AnalyticsEvent, AnalyticsSink, MetricsRecord, UsageRecord};
use crate::envelope::VerificationEnvelope;
use crate::error::{MeshError, MeshResult};
use crate::metrics::MeshMetrics;
use crate::protocol::session::{JobEvent, JobTicket, SessionHandle};
use crate::registry::{Eviction, NodeRegistry};
use crate::reporting::ReportingPipeline;
use crate::types::{InferenceRequest, Job, JobId, JobState, Node, NodeId, Usage};
use futures::{Stream, StreamExt};
use mesh_config::DispatchConfig;
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Item of an [`InferenceStream`]
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceEvent {
    /// Partial output, in node order
    Chunk { index: u64, data: Value },
    /// The previous attempt failed; discard partial output received so far
    Retrying { attempt: u32, node_id: NodeId },
    Completed(InferenceResponse),
}

/// Final result of a dispatched request
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub model: String,
    pub output: Value,
    pub usage: Usage,
    /// Present when the serving node is TEE-backed
    pub envelope: Option<VerificationEnvelope>,
    /// Failovers needed to produce this response
    pub retries: u32,
}

impl InferenceResponse {
    pub fn is_verified(&self) -> bool {
        self.envelope.is_some()
    }

    /// Response body as returned to the client, envelope fields included.
    pub fn to_client_json(&self) -> Value {
        let mut body = self.output.clone();
        if let Some(envelope) = &self.envelope {
            envelope.attach(&mut body);
        }
        body
    }
}

/// Output of one dispatched request. Dropping it cancels the job.
#[derive(Debug)]
pub struct InferenceStream {
    job_id: JobId,
    events: mpsc::Receiver<MeshResult<InferenceEvent>>,
}

impl InferenceStream {
    /// Id of the first attempt
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Wait for the final response, skipping partial output.
    pub async fn collect_response(mut self) -> MeshResult<InferenceResponse> {
        while let Some(item) = self.next().await {
            if let InferenceEvent::Completed(response) = item? {
                return Ok(response);
            }
        }
        Err(MeshError::InferenceError(
            "stream ended without a response".to_string(),
        ))
    }
}

impl Stream for InferenceStream {
    type Item = MeshResult<InferenceEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Jobs currently being driven
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn new(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// A job that a node has acknowledged
struct Attempt {
    job: Job,
    node: Node,
    handle: SessionHandle,
    events: mpsc::Receiver<JobEvent>,
    evictions: broadcast::Receiver<Eviction>,
}

enum AttemptOutcome {
    Done {
        output: Value,
        usage: Usage,
        signature: Option<String>,
    },
    Failed(MeshError),
    ClientGone,
}

/// Timing carried across attempts of one request
struct Timing {
    started: Instant,
    first_chunk: Option<Duration>,
}

pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    config: DispatchConfig,
    relay_buffer: usize,
    metrics: Arc<MeshMetrics>,
    usage: Arc<ReportingPipeline<UsageRecord>>,
    reports: Arc<ReportingPipeline<MetricsRecord>>,
    analytics: Arc<dyn AnalyticsSink>,

    /// Round-robin position over the eligible set
    cursor: AtomicUsize,
    accepting: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        config: DispatchConfig,
        relay_buffer: usize,
        metrics: Arc<MeshMetrics>,
        usage: Arc<ReportingPipeline<UsageRecord>>,
        reports: Arc<ReportingPipeline<MetricsRecord>>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        Self {
            registry,
            config,
            relay_buffer: relay_buffer.max(1),
            metrics,
            usage,
            reports,
            analytics,
            cursor: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Refuse new requests from now on.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("dispatcher no longer accepting requests");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Requests currently being served
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait up to `grace` for in-flight requests to finish. Returns true if
    /// none are left.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.in_flight.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }

    /// Route a request to a node. Fails immediately when no node can take
    /// it; later failures arrive on the stream.
    pub async fn dispatch(self: &Arc<Self>, request: InferenceRequest) -> MeshResult<InferenceStream> {
        if !self.is_accepting() {
            return Err(MeshError::ShuttingDown);
        }
        let guard = InFlightGuard::new(&self.in_flight);
        let timing = Timing {
            started: Instant::now(),
            first_chunk: None,
        };
        let job = Job::new(request);
        let job_id = job.id.clone();
        let mut tried = HashSet::new();

        let attempt = match self.launch(job, &mut tried).await {
            Ok(attempt) => attempt,
            Err(e) => {
                self.metrics.record_dispatch(match &e {
                    MeshError::NoAvailableInferenceNodes(_) => "no_nodes",
                    _ => "failed",
                });
                warn!(job_id = %job_id, error = %e, "dispatch failed");
                return Err(e);
            }
        };

        let (client, events) = mpsc::channel(self.relay_buffer);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.drive(attempt, client, tried, timing).await;
            drop(guard);
        });
        Ok(InferenceStream { job_id, events })
    }

    /// Eligible, untried nodes for the request.
    fn candidates(&self, request: &InferenceRequest, tried: &HashSet<NodeId>) -> Vec<Node> {
        self.registry
            .list_eligible(&request.model)
            .into_iter()
            .filter(|node| !tried.contains(&node.id))
            .filter(|node| !request.verified || node.is_tee())
            .collect()
    }

    /// Claim a node and get the job acknowledged, failing over on retryable
    /// errors within the retry limit.
    async fn launch(&self, mut job: Job, tried: &mut HashSet<NodeId>) -> MeshResult<Attempt> {
        loop {
            let candidates = self.candidates(&job.request, tried);
            if candidates.is_empty() {
                return Err(MeshError::NoAvailableInferenceNodes(job.request.model.clone()));
            }

            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
            let mut claimed = None;
            for offset in 0..candidates.len() {
                let node = &candidates[(start + offset) % candidates.len()];
                match self.registry.claim(&node.id, &job.id) {
                    Ok(true) => {
                        claimed = Some(node.clone());
                        break;
                    }
                    Ok(false) => debug!(node_id = %node.id, job_id = %job.id, "lost claim race"),
                    Err(e) => debug!(node_id = %node.id, error = %e, "candidate vanished"),
                }
            }
            // Every candidate was taken meanwhile; list again.
            let Some(node) = claimed else { continue };

            let Some(handle) = self.registry.session(&node.id) else {
                self.registry.release_job(&node.id, &job.id);
                tried.insert(node.id.clone());
                continue;
            };

            let evictions = self.registry.subscribe_evictions();
            let (events_tx, events) = mpsc::channel(self.relay_buffer);
            job.node_id = Some(node.id.clone());
            let ticket = JobTicket {
                job: job.clone(),
                events: events_tx,
            };
            debug!(node_id = %node.id, job_id = %job.id, model = %job.request.model, "assigning job");

            match handle
                .assign(ticket, self.config.assign_timeout(), &self.registry)
                .await
            {
                Ok(()) => {
                    job.advance(JobState::Dispatched)?;
                    return Ok(Attempt {
                        job,
                        node,
                        handle,
                        events,
                        evictions,
                    });
                }
                Err(MeshError::Protocol(reason)) => {
                    // Session refused the job; try elsewhere without spending a retry.
                    warn!(node_id = %node.id, reason = %reason, "node refused assignment");
                    tried.insert(node.id.clone());
                }
                Err(e) if e.is_retryable() => {
                    warn!(node_id = %node.id, job_id = %job.id, error = %e, "assignment failed");
                    tried.insert(node.id.clone());
                    job.fail(e.clone());
                    job = self.next_attempt(&job, &e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fresh attempt after a retryable failure, or the terminal error once
    /// the retry limit is spent.
    async fn next_attempt(&self, failed: &Job, error: &MeshError) -> MeshResult<Job> {
        if failed.retry_count >= self.config.retry_limit {
            return Err(MeshError::InferenceError(format!(
                "giving up after {} retries: {}",
                failed.retry_count, error
            )));
        }
        self.metrics.retries.inc();
        let backoff = self.config.retry_backoff();
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
        Ok(failed.retry())
    }

    async fn drive(
        self: Arc<Self>,
        mut attempt: Attempt,
        client: mpsc::Sender<MeshResult<InferenceEvent>>,
        mut tried: HashSet<NodeId>,
        mut timing: Timing,
    ) {
        loop {
            match self.relay(&mut attempt, &client, &mut timing).await {
                AttemptOutcome::Done {
                    output,
                    usage,
                    signature,
                } => {
                    let result = self.finish(&mut attempt, output, usage, signature);
                    self.registry.release_job(&attempt.node.id, &attempt.job.id);
                    match result {
                        Ok(response) => {
                            self.report_success(&attempt, &response, &timing);
                            let _ = client.send(Ok(InferenceEvent::Completed(response))).await;
                        }
                        Err(e) => {
                            self.report_failure(&attempt, &e, &timing);
                            let _ = client.send(Err(e)).await;
                        }
                    }
                    return;
                }
                AttemptOutcome::ClientGone => {
                    info!(job_id = %attempt.job.id, node_id = %attempt.node.id, "client went away, cancelling");
                    attempt.handle.cancel(&attempt.job.id);
                    attempt.job.fail(MeshError::Cancelled(attempt.job.id.clone()));
                    self.metrics.record_dispatch("cancelled");
                    self.submit_metrics(&attempt, "cancelled", &timing);
                    return;
                }
                AttemptOutcome::Failed(e) if e.is_retryable() => {
                    warn!(job_id = %attempt.job.id, node_id = %attempt.node.id, error = %e, "attempt failed");
                    attempt.job.fail(e.clone());
                    tried.insert(attempt.node.id.clone());
                    let failed_node = attempt.node.id.clone();

                    let next = match self.next_attempt(&attempt.job, &e).await {
                        Ok(next) => next,
                        Err(terminal) => {
                            self.report_failure(&attempt, &terminal, &timing);
                            let _ = client.send(Err(terminal)).await;
                            return;
                        }
                    };
                    let marker = InferenceEvent::Retrying {
                        attempt: next.retry_count,
                        node_id: failed_node,
                    };
                    if client.send(Ok(marker)).await.is_err() {
                        self.metrics.record_dispatch("cancelled");
                        return;
                    }
                    match self.launch(next, &mut tried).await {
                        Ok(relaunched) => attempt = relaunched,
                        Err(terminal) => {
                            self.report_failure(&attempt, &terminal, &timing);
                            let _ = client.send(Err(terminal)).await;
                            return;
                        }
                    }
                }
                AttemptOutcome::Failed(e) => {
                    warn!(job_id = %attempt.job.id, node_id = %attempt.node.id, error = %e, "job failed");
                    attempt.job.fail(e.clone());
                    self.report_failure(&attempt, &e, &timing);
                    let _ = client.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    /// Forward node output to the client until the attempt ends.
    async fn relay(
        &self,
        attempt: &mut Attempt,
        client: &mpsc::Sender<MeshResult<InferenceEvent>>,
        timing: &mut Timing,
    ) -> AttemptOutcome {
        let lost = MeshError::NodeDisconnectedMidJob {
            node_id: attempt.node.id.clone(),
            job_id: attempt.job.id.clone(),
        };
        let mut watch_evictions = true;
        loop {
            tokio::select! {
                biased;
                event = attempt.events.recv() => match event {
                    Some(JobEvent::Chunk { index, data }) => {
                        if attempt.job.state() == JobState::Dispatched {
                            let _ = attempt.job.advance(JobState::Streaming);
                        }
                        if timing.first_chunk.is_none() {
                            let elapsed = timing.started.elapsed();
                            timing.first_chunk = Some(elapsed);
                            self.metrics.first_chunk_seconds.observe(elapsed.as_secs_f64());
                        }
                        if client.send(Ok(InferenceEvent::Chunk { index, data })).await.is_err() {
                            return AttemptOutcome::ClientGone;
                        }
                    }
                    Some(JobEvent::Done { output, usage, signature }) => {
                        return AttemptOutcome::Done { output, usage, signature };
                    }
                    Some(JobEvent::Failed(e)) => return AttemptOutcome::Failed(e),
                    None => return AttemptOutcome::Failed(lost),
                },
                eviction = attempt.evictions.recv(), if watch_evictions => match eviction {
                    Ok(eviction) if eviction.job_id.as_ref() == Some(&attempt.job.id) => {
                        debug!(node_id = %eviction.node_id, reason = %eviction.reason, "node evicted mid-job");
                        return AttemptOutcome::Failed(lost);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "eviction feed lagged, checking node directly");
                        let holds_job = self
                            .registry
                            .get(&attempt.node.id)
                            .and_then(|node| node.current_job)
                            .map(|job| job == attempt.job.id)
                            .unwrap_or(false);
                        if !holds_job {
                            return AttemptOutcome::Failed(lost);
                        }
                    }
                    Err(RecvError::Closed) => watch_evictions = false,
                },
                _ = client.closed() => return AttemptOutcome::ClientGone,
            }
        }
    }

    /// Complete the attempt, sealing the envelope for TEE nodes.
    fn finish(
        &self,
        attempt: &mut Attempt,
        output: Value,
        usage: Usage,
        signature: Option<String>,
    ) -> MeshResult<InferenceResponse> {
        let envelope = match (&attempt.node.public_key, &attempt.node.attestation) {
            (Some(public_key), Some(attestation)) => {
                let sealed = self.seal(attempt, &output, signature.as_deref(), attestation, public_key);
                self.metrics.record_verification(sealed.is_ok());
                match sealed {
                    Ok(envelope) => Some(envelope),
                    Err(e) => {
                        warn!(node_id = %attempt.node.id, job_id = %attempt.job.id, error = %e, "verification failed");
                        attempt.job.fail(e.clone());
                        return Err(e);
                    }
                }
            }
            _ if attempt.job.request.verified => {
                let e = MeshError::VerificationFailed(format!(
                    "node {} is not TEE-backed",
                    attempt.node.id
                ));
                attempt.job.fail(e.clone());
                return Err(e);
            }
            _ => None,
        };

        attempt.job.advance(JobState::Completed)?;
        Ok(InferenceResponse {
            job_id: attempt.job.id.clone(),
            node_id: attempt.node.id.clone(),
            model: attempt.job.request.model.clone(),
            output,
            usage,
            envelope,
            retries: attempt.job.retry_count,
        })
    }

    fn seal(
        &self,
        attempt: &Attempt,
        output: &Value,
        signature: Option<&str>,
        attestation: &str,
        public_key: &str,
    ) -> MeshResult<VerificationEnvelope> {
        if !output.is_object() {
            return Err(MeshError::VerificationFailed(
                "TEE output must be a JSON object".to_string(),
            ));
        }
        let signature = signature.ok_or_else(|| {
            MeshError::VerificationFailed("TEE node returned no signature".to_string())
        })?;
        VerificationEnvelope::seal(
            &attempt.job.request.body,
            output,
            signature,
            attestation,
            public_key,
        )
    }

    fn account(attempt: &Attempt) -> &str {
        attempt.job.request.account_id.as_deref().unwrap_or("anonymous")
    }

    fn report_success(&self, attempt: &Attempt, response: &InferenceResponse, timing: &Timing) {
        info!(
            job_id = %response.job_id,
            node_id = %response.node_id,
            model = %response.model,
            tokens = response.usage.total_tokens(),
            verified = response.is_verified(),
            retries = response.retries,
            "job completed"
        );
        self.metrics.record_dispatch("completed");
        let _ = self.usage.submit(UsageRecord {
            job_id: response.job_id.clone(),
            account_id: attempt.job.request.account_id.clone(),
            node_id: response.node_id.clone(),
            node_account_id: attempt.node.account_id.clone(),
            model: response.model.clone(),
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            verified: response.is_verified(),
            recorded_at: chrono::Utc::now(),
        });
        self.submit_metrics(attempt, "completed", timing);
        self.analytics.track_event(
            Self::account(attempt),
            AnalyticsEvent::JobCompleted {
                job_id: response.job_id.clone(),
                node_id: response.node_id.clone(),
                model: response.model.clone(),
                total_tokens: response.usage.total_tokens(),
                verified: response.is_verified(),
            },
        );
    }

    fn report_failure(&self, attempt: &Attempt, error: &MeshError, timing: &Timing) {
        self.metrics.record_dispatch(match error {
            MeshError::NoAvailableInferenceNodes(_) => "no_nodes",
            MeshError::VerificationFailed(_) => "verification_failed",
            _ => "failed",
        });
        self.submit_metrics(attempt, "failed", timing);
        self.analytics.track_event(
            Self::account(attempt),
            AnalyticsEvent::JobFailed {
                job_id: attempt.job.id.clone(),
                model: attempt.job.request.model.clone(),
                error: error.code().to_string(),
            },
        );
    }

    fn submit_metrics(&self, attempt: &Attempt, outcome: &str, timing: &Timing) {
        let _ = self.reports.submit(MetricsRecord {
            job_id: attempt.job.id.clone(),
            node_id: Some(attempt.node.id.clone()),
            model: attempt.job.request.model.clone(),
            outcome: outcome.to_string(),
            latency_ms: timing.started.elapsed().as_millis() as u64,
            first_chunk_ms: timing.first_chunk.map(|d| d.as_millis() as u64),
            retries: attempt.job.retry_count,
        });
    }
}
