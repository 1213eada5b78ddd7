mod support;

use futures::StreamExt;
use inference_mesh::{InferenceEvent, MeshError, NodeStatus, TrustedAttestations};
use support::{
    connect_node, request, start_mesh, wait_gone, wait_released, wait_status, Behavior, WAIT,
};

async fn drain(
    mut stream: inference_mesh::InferenceStream,
) -> (Vec<InferenceEvent>, Option<MeshError>) {
    let mut events = Vec::new();
    while let Some(item) = tokio::time::timeout(WAIT, stream.next()).await.unwrap() {
        match item {
            Ok(event) => events.push(event),
            Err(e) => return (events, Some(e)),
        }
    }
    (events, None)
}

#[tokio::test]
async fn busy_node_is_skipped_for_idle_one() {
    let mesh = start_mesh(|_| {}, TrustedAttestations::default()).await;
    let mut a = connect_node(&mesh, "a", Behavior::Hold).await;
    let b = connect_node(&mesh, "b", Behavior::Serve { chunks: 2 }).await;
    let dispatcher = mesh.coordinator.dispatcher();

    // First request lands on "a" and stays there.
    let held = dispatcher.dispatch(request(false)).await.unwrap();
    wait_status(&mesh.coordinator, &a.node_id, NodeStatus::Busy).await;
    let registry = mesh.coordinator.registry();
    assert_eq!(
        registry.get(&a.node_id).unwrap().current_job.as_ref(),
        Some(held.job_id())
    );

    let response = dispatcher
        .dispatch(request(false))
        .await
        .unwrap()
        .collect_response()
        .await
        .unwrap();
    assert_eq!(response.node_id, b.node_id);
    assert_eq!(response.retries, 0);

    // Dropping the held stream cancels the job on "a" and frees it.
    let job_id = held.job_id().clone();
    drop(held);
    let cancel = a
        .expect(|frame| matches!(frame, inference_mesh::protocol::CoordinatorMessage::Cancel { .. }))
        .await;
    assert_eq!(
        cancel,
        inference_mesh::protocol::CoordinatorMessage::Cancel { job_id }
    );
    wait_released(&mesh.coordinator, &a.node_id).await;
    mesh.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn mid_stream_disconnect_retries_on_another_node() {
    let mesh = start_mesh(|_| {}, TrustedAttestations::default()).await;
    // Round robin starts at the lowest id.
    let a = connect_node(&mesh, "a", Behavior::DropMidStream).await;
    let b = connect_node(&mesh, "b", Behavior::Serve { chunks: 3 }).await;

    let stream = mesh.coordinator.dispatcher().dispatch(request(false)).await.unwrap();
    let (events, error) = drain(stream).await;
    assert!(error.is_none(), "unexpected error {:?}", error);

    let retry_at = events
        .iter()
        .position(|e| matches!(e, InferenceEvent::Retrying { .. }))
        .expect("no retry marker");
    match &events[retry_at] {
        InferenceEvent::Retrying { attempt, node_id } => {
            assert_eq!(*attempt, 1);
            assert_eq!(node_id, &a.node_id);
        }
        _ => unreachable!(),
    }
    let after: Vec<u64> = events[retry_at + 1..]
        .iter()
        .filter_map(|e| match e {
            InferenceEvent::Chunk { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(after, vec![0, 1, 2]);

    match events.last() {
        Some(InferenceEvent::Completed(response)) => {
            assert_eq!(response.node_id, b.node_id);
            assert_eq!(response.retries, 1);
        }
        other => panic!("expected completion, got {:?}", other),
    }

    wait_gone(&mesh.coordinator, &a.node_id).await;
    wait_released(&mesh.coordinator, &b.node_id).await;
    assert_eq!(mesh.coordinator.metrics().retries.get(), 1);
    mesh.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn disconnect_without_spare_node_fails_request() {
    let mesh = start_mesh(|_| {}, TrustedAttestations::default()).await;
    connect_node(&mesh, "a", Behavior::DropMidStream).await;

    let stream = mesh.coordinator.dispatcher().dispatch(request(false)).await.unwrap();
    let (_, error) = drain(stream).await;
    assert_eq!(
        error,
        Some(MeshError::NoAvailableInferenceNodes("llama3".into()))
    );
    mesh.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn request_without_nodes_is_refused() {
    let mesh = start_mesh(|_| {}, TrustedAttestations::default()).await;
    let err = mesh
        .coordinator
        .dispatcher()
        .dispatch(request(false))
        .await
        .unwrap_err();
    assert_eq!(err, MeshError::NoAvailableInferenceNodes("llama3".into()));
    mesh.coordinator.shutdown().await.unwrap();
}
