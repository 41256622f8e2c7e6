//! CryptoService - High-level encryption API
//!
//! Owns the identity key pairs of this process (loaded through a [`KeyStore`])
//! and exposes encryption for a recipient's published JWK and decryption with
//! an own identity's private key.
//!
//! ## Example
//!
//! ```rust,ignore
//! let service = CryptoService::new(Arc::new(MemoryKeyStore::new()));
//! let public_jwk = service.ensure_keypair("alice").await?;
//!
//! let packet = service.encrypt_for(b"Hello!", &bob_jwk)?;
//! let plaintext = service.decrypt_as("alice", &inbound_packet).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::hybrid::{self, EncryptedPacket};
use crate::crypto::keys::{KeyPair, PublicKeyJwk};
use crate::crypto::keystore::KeyStore;

/// High-level encryption service
///
/// Thread-safe wrapper around all cryptographic operations.
pub struct CryptoService {
    /// Persistent key storage
    store: Arc<dyn KeyStore>,
    /// Loaded key pairs (user_id -> key pair)
    key_pairs: RwLock<HashMap<String, KeyPair>>,
}

impl CryptoService {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            key_pairs: RwLock::new(HashMap::new()),
        }
    }

    /// Make sure `user_id` has a key pair and return its public JWK
    ///
    /// An existing pair is loaded from the store and never regenerated.
    pub async fn ensure_keypair(&self, user_id: &str) -> CryptoResult<PublicKeyJwk> {
        if let Some(existing) = self.key_pairs.read().await.get(user_id) {
            return Ok(existing.public_jwk());
        }

        let key_pair = match self.store.load(user_id).await? {
            Some(key_pair) => {
                tracing::info!("Loaded existing key pair for {}", user_id);
                key_pair
            }
            None => {
                tracing::info!("Generating new key pair for {}", user_id);
                let key_pair = KeyPair::generate();
                self.store.save(user_id, &key_pair).await?;
                key_pair
            }
        };

        let public = key_pair.public_jwk();
        self.key_pairs
            .write()
            .await
            .insert(user_id.to_string(), key_pair);
        Ok(public)
    }

    /// Encrypt `content` for the owner of `recipient`
    pub fn encrypt_for(&self, content: &[u8], recipient: &PublicKeyJwk) -> CryptoResult<EncryptedPacket> {
        let public = recipient.to_public_key()?;
        hybrid::encrypt(content, &public)
    }

    /// Decrypt a packet addressed to `user_id`
    pub async fn decrypt_as(&self, user_id: &str, packet: &EncryptedPacket) -> CryptoResult<Vec<u8>> {
        let key_pairs = self.key_pairs.read().await;
        let key_pair = key_pairs
            .get(user_id)
            .ok_or_else(|| CryptoError::KeyNotFound(user_id.to_string()))?;
        hybrid::decrypt(packet, key_pair)
    }

    /// Public JWK of a loaded identity
    pub async fn public_jwk(&self, user_id: &str) -> Option<PublicKeyJwk> {
        self.key_pairs.read().await.get(user_id).map(KeyPair::public_jwk)
    }

    /// Get key fingerprint of a loaded identity for verification
    pub async fn fingerprint(&self, user_id: &str) -> Option<String> {
        self.key_pairs.read().await.get(user_id).map(KeyPair::fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keystore::MemoryKeyStore;

    #[tokio::test]
    async fn test_ensure_keypair_is_stable() {
        let store = Arc::new(MemoryKeyStore::new());
        let service = CryptoService::new(store.clone());

        let first = service.ensure_keypair("alice").await.unwrap();
        let second = service.ensure_keypair("alice").await.unwrap();
        assert_eq!(first, second);

        // A fresh service over the same store must not regenerate
        let restarted = CryptoService::new(store);
        assert_eq!(restarted.ensure_keypair("alice").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_encrypt_for_and_decrypt_as() {
        let service = CryptoService::new(Arc::new(MemoryKeyStore::new()));
        let bob_jwk = service.ensure_keypair("bob").await.unwrap();

        let packet = service.encrypt_for(b"hi bob", &bob_jwk).unwrap();
        assert_eq!(service.decrypt_as("bob", &packet).await.unwrap(), b"hi bob");
    }

    #[tokio::test]
    async fn test_decrypt_without_identity() {
        let service = CryptoService::new(Arc::new(MemoryKeyStore::new()));
        let packet = hybrid::encrypt(b"x", &KeyPair::generate().public).unwrap();
        assert!(matches!(
            service.decrypt_as("nobody", &packet).await,
            Err(CryptoError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fingerprint_matches_public_key() {
        let service = CryptoService::new(Arc::new(MemoryKeyStore::new()));
        assert!(service.fingerprint("carol").await.is_none());
        service.ensure_keypair("carol").await.unwrap();
        let fingerprint = service.fingerprint("carol").await.unwrap();
        assert_eq!(fingerprint.len(), 16);
        assert!(service.public_jwk("carol").await.is_some());
    }
}
