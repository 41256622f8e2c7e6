//! Error types for the peer mesh

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::transport::TransportError;

/// Mesh-wide error type
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Public key lookup failed: {0}")]
    LookupFailure(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mesh controller is not running")]
    Closed,
}

/// Result type alias for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

// Events carry errors to the UI as plain strings
impl serde::Serialize for MeshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_display_string() {
        let err = MeshError::LookupFailure("bob".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Public key lookup failed: bob\"");
    }

    #[test]
    fn test_crypto_conversion() {
        let err: MeshError = CryptoError::KeyNotFound("alice".to_string()).into();
        assert!(matches!(err, MeshError::Crypto(CryptoError::KeyNotFound(_))));
    }
}
