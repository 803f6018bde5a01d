//! NIP-04: Encrypted payload envelope
//!
//! Encrypts request/response payloads between the service identity key and a
//! per-app key using:
//! - ECDH for shared secret derivation (raw X coordinate, not hashed)
//! - AES-256-CBC with a fresh random IV per message
//! - Base64 encoding with format: `<encrypted>?iv=<iv_base64>`
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/04.md>

use aes::Aes256;
use base64::Engine;
use bitcoin::secp256k1::{ecdh, PublicKey, SecretKey};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use rand::RngCore;
use thiserror::Error;

/// Errors that can occur while sealing or opening an envelope
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("base64 decode error: {0}")]
    Base64Decode(String),

    #[error("padding error: {0}")]
    Padding(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

/// ECDH shared key: the unhashed X coordinate of the shared point.
///
/// NIP-04 peers key AES off the raw coordinate, so the hashing variant of
/// secp256k1 ECDH cannot be used here.
fn shared_key(privkey: &[u8; 32], peer_pubkey: &[u8]) -> Result<[u8; 32], CryptoError> {
    let secret_key =
        SecretKey::from_slice(privkey).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let public_key =
        PublicKey::from_slice(peer_pubkey).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let point = ecdh::shared_secret_point(&public_key, &secret_key);
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    Ok(key)
}

/// Encrypt a payload to a peer
///
/// # Arguments
/// * `privkey` - Our private key (32 bytes)
/// * `peer_pubkey` - The peer's public key (33 bytes compressed or 65 bytes uncompressed)
/// * `plaintext` - The payload to encrypt
///
/// # Returns
/// Encrypted content in format: `<base64_encrypted>?iv=<base64_iv>`
pub fn encrypt(
    privkey: &[u8; 32],
    peer_pubkey: &[u8],
    plaintext: &str,
) -> Result<String, CryptoError> {
    let key = shared_key(privkey, peer_pubkey)?;

    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new(&key.into(), &iv.into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let encrypted_b64 = base64::engine::general_purpose::STANDARD.encode(&ciphertext);
    let iv_b64 = base64::engine::general_purpose::STANDARD.encode(iv);

    Ok(format!("{}?iv={}", encrypted_b64, iv_b64))
}

/// Decrypt a payload from a peer
///
/// # Arguments
/// * `privkey` - Our private key (32 bytes)
/// * `peer_pubkey` - The peer's public key (33 bytes compressed or 65 bytes uncompressed)
/// * `content` - Encrypted content in format: `<base64_encrypted>?iv=<base64_iv>`
pub fn decrypt(
    privkey: &[u8; 32],
    peer_pubkey: &[u8],
    content: &str,
) -> Result<String, CryptoError> {
    let parts: Vec<&str> = content.split("?iv=").collect();
    if parts.len() != 2 {
        return Err(CryptoError::InvalidFormat(
            "expected format: <encrypted>?iv=<iv>".to_string(),
        ));
    }

    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(parts[0])
        .map_err(|e| CryptoError::Base64Decode(e.to_string()))?;
    let iv = base64::engine::general_purpose::STANDARD
        .decode(parts[1])
        .map_err(|e| CryptoError::Base64Decode(e.to_string()))?;

    let iv: [u8; 16] = iv
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("IV must be 16 bytes".to_string()))?;

    let key = shared_key(privkey, peer_pubkey)?;

    let cipher = Aes256CbcDec::new(&key.into(), &iv.into());
    let plaintext_bytes = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|e| CryptoError::Padding(e.to_string()))?;

    String::from_utf8(plaintext_bytes)
        .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn keypair(byte: u8) -> ([u8; 32], Vec<u8>) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk.secret_bytes(), pk.serialize().to_vec())
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (service_sk, service_pk) = keypair(1);
        let (app_sk, app_pk) = keypair(2);

        let message = "{\"method\":\"get_balance\",\"params\":{}}";
        let encrypted = encrypt(&service_sk, &app_pk, message).expect("encryption should succeed");
        assert!(encrypted.contains("?iv="));

        let decrypted = decrypt(&app_sk, &service_pk, &encrypted).expect("decryption should succeed");
        assert_eq!(decrypted, message);
    }

    #[test]
    fn test_roundtrip_large_payload() {
        let (service_sk, service_pk) = keypair(1);
        let (app_sk, app_pk) = keypair(2);

        // 64 KiB payload spanning many AES blocks
        let message = "x".repeat(64 * 1024);
        let encrypted = encrypt(&service_sk, &app_pk, &message).unwrap();
        let decrypted = decrypt(&app_sk, &service_pk, &encrypted).unwrap();
        assert_eq!(decrypted, message);
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let (service_sk, service_pk) = keypair(1);
        let (app_sk, app_pk) = keypair(2);

        let encrypted = encrypt(&service_sk, &app_pk, "").unwrap();
        let decrypted = decrypt(&app_sk, &service_pk, &encrypted).unwrap();
        assert_eq!(decrypted, "");
    }

    #[test]
    fn test_decrypt_missing_iv_marker() {
        let (sk, _) = keypair(2);
        let peer = [3u8; 33];
        let result = decrypt(&sk, &peer, "no-marker-here");
        assert!(matches!(result, Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_decrypt_bad_base64() {
        let (service_sk, _) = keypair(1);
        let (_, app_pk) = keypair(2);
        let result = decrypt(&service_sk, &app_pk, "!!notbase64!!?iv=!!also!!");
        assert!(matches!(result, Err(CryptoError::Base64Decode(_))));
    }

    #[test]
    fn test_decrypt_short_iv() {
        let (service_sk, _) = keypair(1);
        let (_, app_pk) = keypair(2);
        // "dGVzdA==" is 4 bytes, not the 16 the cipher needs
        let result = decrypt(&service_sk, &app_pk, "dGVzdA==?iv=dGVzdA==");
        assert!(matches!(result, Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_decrypt_garbage_ciphertext_fails_padding() {
        let (service_sk, _) = keypair(1);
        let (_, app_pk) = keypair(2);
        let ct = base64::engine::general_purpose::STANDARD.encode([0u8; 32]);
        let iv = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        let result = decrypt(&service_sk, &app_pk, &format!("{}?iv={}", ct, iv));
        assert!(matches!(result, Err(CryptoError::Padding(_))));
    }

    #[test]
    fn test_bad_key_length() {
        let (service_sk, _) = keypair(1);
        let result = encrypt(&service_sk, &[0u8; 10], "hello");
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let (service_sk, service_pk) = keypair(1);
        let (app_sk, app_pk) = keypair(2);
        assert_eq!(
            shared_key(&service_sk, &app_pk).unwrap(),
            shared_key(&app_sk, &service_pk).unwrap()
        );
    }
}
