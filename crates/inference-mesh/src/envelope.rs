//! Verification envelope for responses produced on TEE nodes.
//!
//! The digest is SHA-256 over the canonical JSON of the request followed by
//! the canonical JSON of the response with the envelope fields removed.
//! Canonical JSON is compact with object keys sorted at every depth. The node
//! signs the raw 32-byte digest with Ed25519.
//!
//! Node implementations must produce byte-identical canonical text. There is
//! no whitespace anywhere: no space after `,` or `:`. Serializers that sort
//! keys but keep the default `", "` and `": "` separators yield a different
//! digest, so the signature will not verify. For example:
//!
//! ```text
//! {"messages":[{"content":"Hello!","role":"user"}],"model":"llama3"}
//! ```

use crate::error::{MeshError, MeshResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use tracing::debug;

/// Response fields that carry the envelope and are excluded from the digest
pub const ENVELOPE_FIELDS: [&str; 4] = ["hash", "signature", "attestation", "public_key"];

/// Proof attached to a verified response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationEnvelope {
    /// Hex SHA-256 digest of request and response
    pub hash: String,

    /// Hex Ed25519 signature over the raw digest
    pub signature: String,

    /// Attestation document of the signing node, opaque here
    pub attestation: String,

    /// Base58 Ed25519 public key
    pub public_key: String,
}

/// Render `value` as compact JSON with object keys sorted.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => {
            let _ = write!(out, "{}", value);
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Display on a string Value applies standard JSON escaping.
    let _ = write!(out, "{}", Value::String(s.to_string()));
}

/// Copy of a response without the envelope fields.
pub fn strip_envelope_fields(response: &Value) -> Value {
    match response {
        Value::Object(map) => {
            let stripped: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !ENVELOPE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(stripped)
        }
        other => other.clone(),
    }
}

/// Digest binding a request to its response.
pub fn compute_digest(request: &Value, response: &Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(request).as_bytes());
    hasher.update(canonical_json(&strip_envelope_fields(response)).as_bytes());
    hasher.finalize().into()
}

pub fn digest_hex(request: &Value, response: &Value) -> String {
    hex::encode(compute_digest(request, response))
}

/// Sign a digest as a TEE node does. Returns the hex signature.
pub fn sign_digest(key: &SigningKey, digest: &[u8; 32]) -> String {
    hex::encode(key.sign(digest).to_bytes())
}

/// Base58 encoding of a raw 32-byte Ed25519 public key.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    multibase::Base::Base58Btc.encode(key.as_bytes())
}

pub fn decode_public_key(encoded: &str) -> MeshResult<VerifyingKey> {
    let bytes = multibase::Base::Base58Btc
        .decode(encoded)
        .map_err(|e| MeshError::VerificationFailed(format!("public key is not base58: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| MeshError::VerificationFailed("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| MeshError::VerificationFailed(format!("invalid public key: {}", e)))
}

/// Check an Ed25519 signature over a hex digest. Any decoding problem
/// yields `false`.
pub fn verify_signature(hash_hex: &str, signature_hex: &str, public_key: &str) -> bool {
    match try_verify(hash_hex, signature_hex, public_key) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "signature check failed");
            false
        }
    }
}

fn try_verify(hash_hex: &str, signature_hex: &str, public_key: &str) -> MeshResult<()> {
    let digest: [u8; 32] = hex::decode(hash_hex)
        .map_err(|e| MeshError::VerificationFailed(format!("hash is not hex: {}", e)))?
        .try_into()
        .map_err(|_| MeshError::VerificationFailed("hash must be 32 bytes".into()))?;
    let signature: [u8; 64] = hex::decode(signature_hex)
        .map_err(|e| MeshError::VerificationFailed(format!("signature is not hex: {}", e)))?
        .try_into()
        .map_err(|_| MeshError::VerificationFailed("signature must be 64 bytes".into()))?;
    let key = decode_public_key(public_key)?;
    key.verify(&digest, &Signature::from_bytes(&signature))
        .map_err(|e| MeshError::VerificationFailed(e.to_string()))
}

impl VerificationEnvelope {
    /// Build the envelope for a response the node signed. Fails if the
    /// signature does not match the recomputed digest.
    pub fn seal(
        request: &Value,
        response: &Value,
        signature: &str,
        attestation: &str,
        public_key: &str,
    ) -> MeshResult<Self> {
        let hash = digest_hex(request, response);
        try_verify(&hash, signature, public_key)?;
        Ok(Self {
            hash,
            signature: signature.to_string(),
            attestation: attestation.to_string(),
            public_key: public_key.to_string(),
        })
    }

    /// Merge the envelope fields into a response object.
    pub fn attach(&self, response: &mut Value) {
        if let Value::Object(map) = response {
            map.insert("hash".into(), Value::String(self.hash.clone()));
            map.insert("signature".into(), Value::String(self.signature.clone()));
            map.insert("attestation".into(), Value::String(self.attestation.clone()));
            map.insert("public_key".into(), Value::String(self.public_key.clone()));
        }
    }
}

/// Verify a response carrying envelope fields against its request, as a
/// client would. Total: malformed input is `false`.
pub fn verify_envelope(request: &Value, response: &Value) -> bool {
    let field = |name: &str| response.get(name).and_then(Value::as_str);
    let (hash, signature, public_key) = match (field("hash"), field("signature"), field("public_key")) {
        (Some(h), Some(s), Some(k)) => (h, s, k),
        _ => return false,
    };
    if digest_hex(request, response) != hash {
        debug!("envelope digest does not match response");
        return false;
    }
    verify_signature(hash, signature, public_key)
}
