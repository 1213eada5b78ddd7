//! Shared harness: a coordinator on an ephemeral port and simulated nodes
//! speaking the wire protocol over TCP.

#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use inference_mesh::collaborators::{
    CollectingQueue, InMemoryNodeDirectory, StaticTrustStore, TracingAnalyticsSink,
};
use inference_mesh::envelope::{compute_digest, encode_public_key, sign_digest};
use inference_mesh::protocol::{CoordinatorMessage, NodeEndpoint, NodeMessage};
use inference_mesh::{
    Collaborators, Coordinator, InferenceKind, InferenceRequest, MetricsRecord, NodeId,
    NodeStatus, TrustedAttestations, Usage, UsageRecord,
};
use mesh_config::CoordinatorConfig;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);
pub const ATTESTATION: &str = "YXR0ZXN0YXRpb24=";

pub struct TestMesh {
    pub coordinator: Coordinator,
    pub addr: SocketAddr,
    pub directory: Arc<InMemoryNodeDirectory>,
    pub usage: Arc<CollectingQueue<UsageRecord>>,
    pub reports: Arc<CollectingQueue<MetricsRecord>>,
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn start_mesh(
    configure: impl FnOnce(&mut CoordinatorConfig),
    trusted: TrustedAttestations,
) -> TestMesh {
    init_logging();
    let mut config = CoordinatorConfig::default();
    config.server.listen_address = "127.0.0.1:0".into();
    config.dispatch.assign_timeout_ms = 1_000;
    config.shutdown.grace_period_ms = 1_000;
    config.shutdown.join_timeout_ms = 1_000;
    configure(&mut config);

    let directory = Arc::new(InMemoryNodeDirectory::new());
    let usage = Arc::new(CollectingQueue::new(256));
    let reports = Arc::new(CollectingQueue::new(256));
    let collaborators = Collaborators {
        directory: directory.clone(),
        trust: Arc::new(StaticTrustStore::new(trusted)),
        analytics: Arc::new(TracingAnalyticsSink),
        usage_queue: usage.clone(),
        metrics_queue: reports.clone(),
    };
    let mut coordinator = Coordinator::new(config, collaborators).unwrap();
    let addr = coordinator.start().await.unwrap();
    TestMesh {
        coordinator,
        addr,
        directory,
        usage,
        reports,
    }
}

pub fn request(verified: bool) -> InferenceRequest {
    InferenceRequest::from_body(
        InferenceKind::Completion,
        json!({
            "model": "llama3",
            "messages": [{"role": "user", "content": "Hello!"}],
            "stream": true,
            "verified": verified
        }),
    )
    .unwrap()
}

/// How a simulated node answers JOB_ASSIGN
#[derive(Clone)]
pub enum Behavior {
    /// Ack, stream `chunks` chunks, then JOB_DONE
    Serve { chunks: u64 },
    /// Ack, one chunk, then close the connection
    DropMidStream,
    /// Ack, one chunk, then wait
    Hold,
    /// Serve and sign the output with `key`
    Tee { key: SigningKey },
}

/// A connected simulated node. Frames other than JOB_ASSIGN are forwarded
/// to `seen`.
pub struct SimNode {
    pub node_id: NodeId,
    pub seen: mpsc::UnboundedReceiver<CoordinatorMessage>,
}

impl SimNode {
    /// Next forwarded frame matching `pred`.
    pub async fn expect(&mut self, pred: impl Fn(&CoordinatorMessage) -> bool) -> CoordinatorMessage {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.seen.recv().await {
                    Some(frame) if pred(&frame) => return frame,
                    Some(_) => continue,
                    None => panic!("node connection closed"),
                }
            }
        })
        .await
        .expect("expected frame not received")
    }
}

/// Register a node over TCP, send its first heartbeat and wait until it is Active.
pub async fn connect_node(mesh: &TestMesh, id: &str, behavior: Behavior) -> SimNode {
    let node_id = NodeId::from(id);
    let credential = format!("cred-{}", id);
    mesh.directory.add_node(&credential, node_id.clone(), "acct-node");

    let mut endpoint = NodeEndpoint::connect(mesh.addr, inference_mesh::protocol::DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap();
    let (public_key, attestation) = match &behavior {
        Behavior::Tee { key } => (
            Some(encode_public_key(&key.verifying_key())),
            Some(ATTESTATION.to_string()),
        ),
        _ => (None, None),
    };
    endpoint
        .send(NodeMessage::Register {
            credential,
            models: vec!["llama3".into()],
            public_key,
            attestation,
        })
        .await
        .unwrap();
    match endpoint.recv_timeout(WAIT).await.unwrap() {
        CoordinatorMessage::Registered { node_id: assigned, .. } => assert_eq!(assigned, node_id),
        other => panic!("expected REGISTERED, got {:?}", other),
    }
    endpoint.send(NodeMessage::Heartbeat).await.unwrap();

    let (seen_tx, seen) = mpsc::unbounded_channel();
    tokio::spawn(run_node(endpoint, behavior, seen_tx));
    wait_status(&mesh.coordinator, &node_id, NodeStatus::Active).await;
    SimNode { node_id, seen }
}

pub async fn wait_status(coordinator: &Coordinator, node_id: &NodeId, status: NodeStatus) {
    let registry = coordinator.registry();
    tokio::time::timeout(WAIT, async {
        while registry.get(node_id).map(|n| n.status) != Some(status) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {:?}", node_id, status));
}

/// Wait until the node's registry entry is gone.
pub async fn wait_gone(coordinator: &Coordinator, node_id: &NodeId) {
    let registry = coordinator.registry();
    tokio::time::timeout(WAIT, async {
        while registry.get(node_id).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} still registered", node_id));
}

/// Wait until the node holds no job.
pub async fn wait_released(coordinator: &Coordinator, node_id: &NodeId) {
    let registry = coordinator.registry();
    tokio::time::timeout(WAIT, async {
        while registry
            .get(node_id)
            .map(|n| n.current_job.is_some())
            .unwrap_or(false)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} still holds a job", node_id));
}

async fn run_node(
    mut endpoint: NodeEndpoint,
    behavior: Behavior,
    seen: mpsc::UnboundedSender<CoordinatorMessage>,
) {
    while let Some(Ok(frame)) = endpoint.recv().await {
        let CoordinatorMessage::JobAssign { job_id, request, .. } = frame else {
            let _ = seen.send(frame);
            continue;
        };
        if endpoint
            .send(NodeMessage::JobAck { job_id: job_id.clone() })
            .await
            .is_err()
        {
            return;
        }
        match &behavior {
            Behavior::Serve { chunks } => {
                for index in 0..*chunks {
                    let _ = endpoint
                        .send(NodeMessage::JobChunk {
                            job_id: job_id.clone(),
                            index,
                            data: json!({"delta": format!("t{}", index)}),
                        })
                        .await;
                }
                let _ = endpoint
                    .send(NodeMessage::JobDone {
                        job_id,
                        output: json!({"choices": [{"message": {"content": "hello"}}]}),
                        usage: Usage {
                            prompt_tokens: 5,
                            completion_tokens: 2,
                        },
                        signature: None,
                    })
                    .await;
            }
            Behavior::DropMidStream => {
                let _ = endpoint
                    .send(NodeMessage::JobChunk {
                        job_id,
                        index: 0,
                        data: json!({"delta": "partial"}),
                    })
                    .await;
                return;
            }
            Behavior::Hold => {
                let _ = endpoint
                    .send(NodeMessage::JobChunk {
                        job_id,
                        index: 0,
                        data: json!({"delta": "thinking"}),
                    })
                    .await;
            }
            Behavior::Tee { key } => {
                let output = json!({"choices": [{"message": {"content": "attested"}}]});
                let signature = sign_digest(key, &compute_digest(&request, &output));
                let _ = endpoint
                    .send(NodeMessage::JobDone {
                        job_id,
                        output,
                        usage: Usage {
                            prompt_tokens: 4,
                            completion_tokens: 1,
                        },
                        signature: Some(signature),
                    })
                    .await;
            }
        }
    }
}
