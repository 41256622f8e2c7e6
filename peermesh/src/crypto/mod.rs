//! Hybrid encryption module
//!
//! Confidentiality and integrity for arbitrary payloads (text or image
//! data-URIs) using a one-time symmetric key per message, wrapped for the
//! recipient's long-term public key.
//!
//! ## Components
//!
//! - **keys**: X25519 identity key pairs and their JWK form
//! - **hybrid**: per-message encrypt/decrypt and payload hash cross-checks
//! - **keystore**: `KeyStore` capability (in-memory and SQLite)
//! - **service**: High-level CryptoService facade
//!
//! ## Usage
//!
//! ```rust,ignore
//! use peermesh::crypto::{CryptoService, MemoryKeyStore};
//!
//! let service = CryptoService::new(Arc::new(MemoryKeyStore::new()));
//! let my_jwk = service.ensure_keypair("alice").await?;
//!
//! let packet = service.encrypt_for(b"hello", &bob_jwk)?;
//! let plaintext = service.decrypt_as("alice", &packet_from_bob).await?;
//! ```

pub mod errors;
pub mod hybrid;
pub mod keys;
pub mod keystore;
pub mod service;

// Re-export commonly used types
pub use errors::{CryptoError, CryptoResult};
pub use hybrid::{decrypt, encrypt, sha256_hex, verify_payload_hash, EncryptedPacket};
pub use keys::{KeyPair, PrivateKeyJwk, PublicKeyJwk};
pub use keystore::{KeyStore, MemoryKeyStore, SqliteKeyStore};
pub use service::CryptoService;
