//! NIP-01: Basic protocol
//!
//! Event model with canonical serialization, sha256 event ids and BIP-340
//! Schnorr signing/verification.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/01.md>

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while building or verifying events
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid event id: {0}")]
    InvalidId(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A signed Nostr event as it travels over the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier: lowercase hex sha256 of the canonical serialization
    pub id: String,
    /// Author x-only public key, lowercase hex
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Arbitrary tags; first element of each tag is its name
    pub tags: Vec<Vec<String>>,
    /// Event content body
    pub content: String,
    /// 64-byte Schnorr signature over the event id, lowercase hex
    pub sig: String,
}

/// Everything needed to produce a signed [`Event`] except the keys
#[derive(Debug, Clone)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Canonical NIP-01 serialization: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(pubkey: &str, template: &EventTemplate) -> Result<String, EventError> {
    let canonical = (
        0u8,
        pubkey,
        template.created_at,
        template.kind,
        &template.tags,
        &template.content,
    );
    Ok(serde_json::to_string(&canonical)?)
}

/// Compute the event id (sha256 of the canonical serialization)
pub fn get_event_hash(pubkey: &str, template: &EventTemplate) -> Result<[u8; 32], EventError> {
    let serialized = serialize_event(pubkey, template)?;
    Ok(sha256::Hash::hash(serialized.as_bytes()).to_byte_array())
}

/// Sign an [`EventTemplate`] with the given secret key, producing a full event
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event, EventError> {
    let secp = Secp256k1::new();
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| EventError::InvalidKey(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _parity) = XOnlyPublicKey::from_keypair(&keypair);
    let pubkey = hex::encode(xonly.serialize());

    let id_bytes = get_event_hash(&pubkey, template)?;
    let msg = Message::from_digest(id_bytes);
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &keypair);

    Ok(Event {
        id: hex::encode(id_bytes),
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig: hex::encode(sig.as_ref()),
    })
}

/// Verify an event's id and Schnorr signature
pub fn verify_event(event: &Event) -> Result<(), EventError> {
    let template = EventTemplate {
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    let id_bytes = get_event_hash(&event.pubkey, &template)?;
    if hex::encode(id_bytes) != event.id {
        return Err(EventError::InvalidId(format!(
            "event id does not match content hash: {}",
            event.id
        )));
    }

    let pubkey_bytes =
        hex::decode(&event.pubkey).map_err(|e| EventError::InvalidKey(e.to_string()))?;
    let xonly = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| EventError::InvalidKey(e.to_string()))?;

    let sig_bytes =
        hex::decode(&event.sig).map_err(|e| EventError::InvalidSignature(e.to_string()))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| EventError::InvalidSignature(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest(id_bytes);
    secp.verify_schnorr(&sig, &msg, &xonly)
        .map_err(|e| EventError::InvalidSignature(e.to_string()))
}

/// Generate a fresh random secret key
pub fn generate_secret_key() -> [u8; 32] {
    loop {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        if SecretKey::from_slice(&bytes).is_ok() {
            return bytes;
        }
    }
}

/// Derive the x-only public key for a secret key, as lowercase hex
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, EventError> {
    let secp = Secp256k1::new();
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| EventError::InvalidKey(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _parity) = XOnlyPublicKey::from_keypair(&keypair);
    Ok(hex::encode(xonly.serialize()))
}

/// Expand a 32-byte x-only pubkey hex into the 33-byte compressed form
/// expected by ECDH (even-parity prefix, per BIP-340 lift_x)
pub fn xonly_hex_to_compressed(pubkey_hex: &str) -> Result<[u8; 33], EventError> {
    let bytes = hex::decode(pubkey_hex).map_err(|e| EventError::InvalidKey(e.to_string()))?;
    let pk_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EventError::InvalidKey("pubkey must be 32 bytes".to_string()))?;

    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&pk_bytes);
    Ok(compressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> EventTemplate {
        EventTemplate {
            created_at: 1_700_000_000,
            kind: 23194,
            tags: vec![vec!["p".to_string(), "ab".repeat(32)]],
            content: "payload".to_string(),
        }
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let sk = [7u8; 32];
        let event = finalize_event(&template(), &sk).expect("signing should succeed");

        assert_eq!(event.id.len(), 64);
        assert_eq!(event.pubkey.len(), 64);
        assert_eq!(event.sig.len(), 128);
        verify_event(&event).expect("verification should succeed");
    }

    #[test]
    fn test_tampered_content_fails_verification() {
        let sk = [7u8; 32];
        let mut event = finalize_event(&template(), &sk).unwrap();
        event.content = "tampered".to_string();

        match verify_event(&event) {
            Err(EventError::InvalidId(_)) => {}
            other => panic!("expected InvalidId, got {:?}", other),
        }
    }

    #[test]
    fn test_forged_signature_fails_verification() {
        let sk = [7u8; 32];
        let other_sk = [9u8; 32];
        let event = finalize_event(&template(), &sk).unwrap();
        let forged = finalize_event(&template(), &other_sk).unwrap();

        let mut spliced = event.clone();
        spliced.sig = forged.sig;
        assert!(verify_event(&spliced).is_err());
    }

    #[test]
    fn test_canonical_serialization_shape() {
        let serialized = serialize_event("deadbeef", &template()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&serialized).unwrap();
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 6);
        assert_eq!(arr[0], 0);
        assert_eq!(arr[1], "deadbeef");
        assert_eq!(arr[3], 23194);
    }

    #[test]
    fn test_event_wire_serde() {
        let sk = generate_secret_key();
        let event = finalize_event(&template(), &sk).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_xonly_hex_to_compressed() {
        let sk = generate_secret_key();
        let pubkey = get_public_key_hex(&sk).unwrap();
        let compressed = xonly_hex_to_compressed(&pubkey).unwrap();
        assert_eq!(compressed[0], 0x02);
        assert_eq!(hex::encode(&compressed[1..]), pubkey);

        assert!(xonly_hex_to_compressed("not-hex").is_err());
        assert!(xonly_hex_to_compressed("abcd").is_err());
    }
}
