mod support;

use base64::Engine;
use ed25519_dalek::SigningKey;
use inference_mesh::envelope::{encode_public_key, verify_envelope};
use inference_mesh::{MeshError, TrustedAttestations};
use rand::rngs::OsRng;
use serde_json::json;
use sha2::{Digest, Sha256};
use support::{connect_node, request, start_mesh, Behavior, ATTESTATION};

fn measurement() -> String {
    let document = base64::engine::general_purpose::STANDARD
        .decode(ATTESTATION)
        .unwrap();
    hex::encode(Sha256::digest(&document))
}

#[tokio::test]
async fn verified_request_returns_checkable_envelope() {
    let key = SigningKey::generate(&mut OsRng);
    let trusted = TrustedAttestations {
        measurements: vec![measurement()],
        public_keys: vec![encode_public_key(&key.verifying_key())],
    };
    let mesh = start_mesh(|_| {}, trusted).await;
    connect_node(&mesh, "a-plain", Behavior::Serve { chunks: 1 }).await;
    let tee = connect_node(&mesh, "b-tee", Behavior::Tee { key: key.clone() }).await;

    let registry = mesh.coordinator.registry();
    assert!(registry.get(&tee.node_id).unwrap().is_tee());

    let req = request(true).with_account("acct-client");
    let body = req.body.clone();
    let response = mesh
        .coordinator
        .dispatcher()
        .dispatch(req)
        .await
        .unwrap()
        .collect_response()
        .await
        .unwrap();
    assert_eq!(response.node_id, tee.node_id);
    let envelope = response.envelope.clone().expect("envelope missing");
    assert_eq!(envelope.attestation, ATTESTATION);
    assert_eq!(envelope.public_key, encode_public_key(&key.verifying_key()));

    // A client can check the returned body against its own request.
    let client_body = response.to_client_json();
    assert!(verify_envelope(&body, &client_body));
    let mut forged = client_body.clone();
    forged["choices"][0]["message"]["content"] = json!("forged");
    assert!(!verify_envelope(&body, &forged));

    mesh.coordinator.shutdown().await.unwrap();
    let usage = mesh.usage.records();
    assert_eq!(usage.len(), 1);
    assert!(usage[0].verified);
    assert_eq!(usage[0].account_id.as_deref(), Some("acct-client"));
    assert_eq!(usage[0].node_id, tee.node_id);
}

#[tokio::test]
async fn untrusted_key_is_admitted_as_ordinary_node() {
    let trusted_key = SigningKey::generate(&mut OsRng);
    let rogue_key = SigningKey::generate(&mut OsRng);
    let trusted = TrustedAttestations {
        measurements: vec![measurement()],
        public_keys: vec![encode_public_key(&trusted_key.verifying_key())],
    };
    let mesh = start_mesh(|_| {}, trusted).await;
    let rogue = connect_node(&mesh, "rogue", Behavior::Tee { key: rogue_key }).await;

    let registry = mesh.coordinator.registry();
    let node = registry.get(&rogue.node_id).unwrap();
    assert!(!node.is_tee());
    assert!(node.attestation.is_none());

    let err = mesh
        .coordinator
        .dispatcher()
        .dispatch(request(true))
        .await
        .unwrap_err();
    assert_eq!(err, MeshError::NoAvailableInferenceNodes("llama3".into()));
    mesh.coordinator.shutdown().await.unwrap();
}
