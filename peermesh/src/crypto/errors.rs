//! Cryptographic error types
//!
//! This module defines all error types for the hybrid encryption layer.

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Failed to parse, import or use a key
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// Authentication tag did not verify; the packet was corrupted or forged
    #[error("Integrity check failed: {0}")]
    IntegrityError(String),

    /// Out-of-band payload hash does not match the ciphertext
    #[error("Payload tampered: claimed hash {claimed}, computed {computed}")]
    Tampered { claimed: String, computed: String },

    /// Packet fields are not valid base64 or have the wrong length
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Content exceeds the wire size limit
    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// No key pair known for this identity
    #[error("No key pair found for identity: {0}")]
    KeyNotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<aes_gcm::Error> for CryptoError {
    fn from(_: aes_gcm::Error) -> Self {
        CryptoError::EncryptionError("AES-GCM operation failed".to_string())
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoError::MalformedPacket(format!("invalid base64: {}", e))
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        CryptoError::SerializationError(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
