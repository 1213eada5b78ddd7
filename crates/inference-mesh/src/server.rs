//! TCP listener for node connections.

use crate::protocol::session::{NodeSession, SessionContext};
use crate::protocol::transport::Transport;
use crate::protocol::wire::CoordinatorMessage;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Limits applied to accepted connections
#[derive(Debug, Clone, Copy)]
pub struct ListenerLimits {
    pub max_sessions: usize,
    pub max_frame_bytes: usize,
    pub outbound_buffer: usize,
}

/// Accept node connections until `shutdown` flips. Each connection gets its
/// own [`NodeSession`]; connections beyond `max_sessions` are rejected.
pub fn spawn_listener(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    limits: ListenerLimits,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(limits.max_sessions.max(1)));
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, max_sessions = limits.max_sessions, "accepting node connections");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "could not set TCP_NODELAY");
                    }
                    let transport =
                        Transport::from_tcp(stream, limits.max_frame_bytes, limits.outbound_buffer);

                    let permit = match permits.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(%peer, "session limit reached, rejecting connection");
                            transport.try_send(CoordinatorMessage::Rejected {
                                reason: "session limit reached".to_string(),
                            });
                            continue;
                        }
                    };

                    debug!(%peer, "node connected");
                    let session = NodeSession::new(transport, ctx.clone());
                    tokio::spawn(async move {
                        if let Err(e) = session.run().await {
                            debug!(%peer, error = %e, "session ended with error");
                        }
                        drop(permit);
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("node listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        InMemoryNodeDirectory, StaticTrustStore, TracingAnalyticsSink, TrustedAttestations,
    };
    use crate::metrics::MeshMetrics;
    use crate::protocol::transport::NodeEndpoint;
    use crate::protocol::wire::{NodeMessage, DEFAULT_MAX_FRAME_BYTES};
    use crate::registry::NodeRegistry;
    use crate::types::{NodeId, NodeStatus};
    use mesh_config::SessionConfig;
    use std::net::SocketAddr;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    async fn listen(max_sessions: usize) -> (SocketAddr, Arc<SessionContext>, watch::Sender<bool>, JoinHandle<()>) {
        let directory = Arc::new(InMemoryNodeDirectory::new());
        directory.add_node("cred-a", NodeId::from("node-a"), "acct-a");
        directory.add_node("cred-b", NodeId::from("node-b"), "acct-b");
        let ctx = Arc::new(SessionContext {
            registry: Arc::new(NodeRegistry::new()),
            directory,
            trust: Arc::new(StaticTrustStore::new(TrustedAttestations::default())),
            analytics: Arc::new(TracingAnalyticsSink),
            metrics: Arc::new(MeshMetrics::new().unwrap()),
            config: SessionConfig::default(),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let limits = ListenerLimits {
            max_sessions,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_buffer: 16,
        };
        let task = spawn_listener(listener, ctx.clone(), limits, shutdown_rx);
        (addr, ctx, shutdown_tx, task)
    }

    async fn register(addr: SocketAddr, credential: &str) -> (NodeEndpoint, CoordinatorMessage) {
        let mut node = NodeEndpoint::connect(addr, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        node.send(NodeMessage::Register {
            credential: credential.into(),
            models: vec!["llama3".into()],
            public_key: None,
            attestation: None,
        })
        .await
        .unwrap();
        let reply = node.recv_timeout(WAIT).await.unwrap();
        (node, reply)
    }

    #[tokio::test]
    async fn node_registers_over_tcp() {
        let (addr, ctx, _shutdown, _task) = listen(4).await;
        let (node, reply) = register(addr, "cred-a").await;
        assert_eq!(
            reply,
            CoordinatorMessage::Registered {
                node_id: NodeId::from("node-a"),
                verified_capable: false,
            }
        );
        node.send(NodeMessage::Heartbeat).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while ctx.registry.get(&NodeId::from("node-a")).map(|n| n.status)
                != Some(NodeStatus::Active)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn connections_over_the_limit_are_rejected() {
        let (addr, _ctx, _shutdown, _task) = listen(1).await;
        let (_first, reply) = register(addr, "cred-a").await;
        assert!(matches!(reply, CoordinatorMessage::Registered { .. }));

        let mut second = NodeEndpoint::connect(addr, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        match second.recv_timeout(WAIT).await.unwrap() {
            CoordinatorMessage::Rejected { reason } => assert!(reason.contains("session limit")),
            other => panic!("expected REJECTED, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn listener_stops_on_shutdown() {
        let (_addr, _ctx, shutdown, task) = listen(4).await;
        shutdown.send(true).unwrap();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }
}
