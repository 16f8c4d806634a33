//! Encryption Service (spec §2 item 3): pure `Encrypt`/`Decrypt`/`Hash`
//! operations over credential strings.
//!
//! Grounded on `mockforge-core::encryption::algorithms`, trimmed to the
//! single AES-256-GCM path this core actually needs and extended with the
//! deterministic `hash` fingerprint spec §3 calls `key_hash` — a domain
//! this spec explicitly keeps "pure" (§2): no key rotation, no multi-tenant
//! key management, those are out of scope here.

mod errors;

pub use errors::{EncryptionError, EncryptionResult};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Credential encryption/decryption/hashing, keyed by a single master key.
///
/// `hash` is deterministic (HMAC-free BLAKE3 keyed hash) so that two
/// identical plaintext keys always produce the same `key_hash`, enabling
/// the `(group_id, key_hash)` uniqueness constraint in spec §3 to dedupe
/// without ever decrypting stored ciphertext.
#[derive(Clone)]
pub struct EncryptionService {
    cipher_key: [u8; KEY_LEN],
    hash_key: [u8; KEY_LEN],
}

impl EncryptionService {
    /// Builds a service from a 32-byte master key. The same key derives
    /// both the cipher key and (via a fixed context string) a distinct
    /// hashing key, so a leaked hash can never be used to reconstruct
    /// ciphertext material.
    pub fn new(master_key: &[u8; KEY_LEN]) -> Self {
        let hash_key = *blake3::derive_key("aiproxy-core key-hash v1", master_key)
            .as_slice()
            .first_chunk::<KEY_LEN>()
            .expect("derive_key always returns 32 bytes");
        Self {
            cipher_key: *master_key,
            hash_key,
        }
    }

    /// Generates a random master key, suitable for tests or first-run bootstrap.
    pub fn generate() -> (Self, [u8; KEY_LEN]) {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        (Self::new(&key), key)
    }

    /// Encrypts `plaintext`, returning a base64-encoded `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &str) -> EncryptionResult<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.cipher_key)
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| EncryptionError::EncryptFailed(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts the `nonce || ciphertext` blob produced by [`Self::encrypt`].
    pub fn decrypt(&self, blob: &[u8]) -> EncryptionResult<String> {
        if blob.len() < NONCE_LEN {
            return Err(EncryptionError::InvalidEncoding(
                "ciphertext shorter than nonce".into(),
            ));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.cipher_key)
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| EncryptionError::DecryptFailed(e.to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| EncryptionError::InvalidEncoding(e.to_string()))
    }

    /// Deterministic fingerprint of `plaintext` used as `key_hash` for
    /// dedup (spec §3: "`key_hash` is deterministic from plaintext").
    pub fn hash(&self, plaintext: &str) -> String {
        let digest = blake3::keyed_hash(&self.hash_key, plaintext.as_bytes());
        general_purpose::URL_SAFE_NO_PAD.encode(digest.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::generate().0
    }

    #[test]
    fn round_trips_plaintext() {
        let svc = service();
        let blob = svc.encrypt("sk-test-credential").unwrap();
        assert_eq!(svc.decrypt(&blob).unwrap(), "sk-test-credential");
    }

    #[test]
    fn hash_is_deterministic() {
        let svc = service();
        assert_eq!(svc.hash("sk-abc"), svc.hash("sk-abc"));
        assert_ne!(svc.hash("sk-abc"), svc.hash("sk-def"));
    }

    #[test]
    fn encrypt_is_nondeterministic_but_decryptable() {
        let svc = service();
        let a = svc.encrypt("sk-abc").unwrap();
        let b = svc.encrypt("sk-abc").unwrap();
        assert_ne!(a, b, "random nonce should make ciphertexts differ");
        assert_eq!(svc.decrypt(&a).unwrap(), "sk-abc");
        assert_eq!(svc.decrypt(&b).unwrap(), "sk-abc");
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let svc = service();
        assert!(svc.decrypt(&[1, 2, 3]).is_err());
    }
}
