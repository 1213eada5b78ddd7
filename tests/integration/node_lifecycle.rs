mod support;

use inference_mesh::protocol::{CoordinatorMessage, NodeEndpoint, NodeMessage, DEFAULT_MAX_FRAME_BYTES};
use inference_mesh::{MeshError, TrustedAttestations};
use support::{connect_node, request, start_mesh, wait_gone, Behavior, WAIT};

#[tokio::test]
async fn unknown_credential_is_rejected() {
    let mesh = start_mesh(|_| {}, TrustedAttestations::default()).await;
    let mut endpoint = NodeEndpoint::connect(mesh.addr, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap();
    endpoint
        .send(NodeMessage::Register {
            credential: "not-provisioned".into(),
            models: vec!["llama3".into()],
            public_key: None,
            attestation: None,
        })
        .await
        .unwrap();
    match endpoint.recv_timeout(WAIT).await.unwrap() {
        CoordinatorMessage::Rejected { reason } => assert!(reason.contains("unauthorized")),
        other => panic!("expected REJECTED, got {:?}", other),
    }
    assert!(mesh.coordinator.registry().is_empty());
    mesh.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn silent_node_is_evicted_and_closed() {
    let mesh = start_mesh(
        |config| {
            config.health.interval_ms = 50;
            config.health.heartbeat_timeout_ms = 200;
        },
        TrustedAttestations::default(),
    )
    .await;
    let mut node = connect_node(&mesh, "quiet", Behavior::Hold).await;

    match node
        .expect(|frame| matches!(frame, CoordinatorMessage::Close { .. }))
        .await
    {
        CoordinatorMessage::Close { reason } => assert_eq!(reason, "heartbeat timeout"),
        _ => unreachable!(),
    }
    wait_gone(&mesh.coordinator, &node.node_id).await;
    assert!(mesh.coordinator.metrics().evictions.get() >= 1);

    let err = mesh
        .coordinator
        .dispatcher()
        .dispatch(request(false))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::NoAvailableInferenceNodes(_)));
    mesh.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_nodes_and_persists_inactive() {
    let mesh = start_mesh(|_| {}, TrustedAttestations::default()).await;
    let mut node = connect_node(&mesh, "a", Behavior::Serve { chunks: 0 }).await;
    tokio::time::timeout(WAIT, async {
        while !mesh.directory.is_persisted_active(&node.node_id) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("node never persisted active");

    let dispatcher = mesh.coordinator.dispatcher();
    mesh.coordinator.shutdown().await.unwrap();

    node.expect(|frame| matches!(frame, CoordinatorMessage::Close { .. }))
        .await;
    assert!(!mesh.directory.is_persisted_active(&node.node_id));
    assert_eq!(
        dispatcher.dispatch(request(false)).await.unwrap_err(),
        MeshError::ShuttingDown
    );
}
