//! Identity key pairs and their JSON Web Key representation
//!
//! Every identity owns exactly one X25519 key pair. The public half travels
//! through the signaling relay as an OKP JSON Web Key; the private half is only
//! ever handed to a [`KeyStore`](crate::crypto::KeyStore).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::errors::{CryptoError, CryptoResult};

const JWK_KEY_TYPE: &str = "OKP";
const JWK_CURVE: &str = "X25519";

/// Long-term X25519 key pair for one identity
///
/// Used for:
/// - Unwrapping the per-message symmetric key of inbound packets
/// - Publishing the public key for discovery via the relay
/// - Key fingerprint generation for verification
#[derive(Clone)]
pub struct KeyPair {
    /// Public key (safe to share)
    pub public: PublicKey,
    /// Secret key (never leaves the process except through a key store)
    secret: StaticSecret,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { public, secret }
    }

    /// Restore from the secret scalar bytes
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> CryptoResult<Self> {
        let mut secret_arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Secret key must be 32 bytes".to_string()))?;
        let secret = StaticSecret::from(secret_arr);
        secret_arr.zeroize();
        let public = PublicKey::from(&secret);
        Ok(Self { public, secret })
    }

    /// Restore from a private JWK, checking that its public half matches
    pub fn from_private_jwk(jwk: &PrivateKeyJwk) -> CryptoResult<Self> {
        check_jwk_header(&jwk.kty, &jwk.crv)?;
        let mut secret_bytes = URL_SAFE_NO_PAD
            .decode(&jwk.d)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid JWK 'd': {}", e)))?;
        let key_pair = Self::from_secret_bytes(&secret_bytes);
        secret_bytes.zeroize();
        let key_pair = key_pair?;

        let declared = PublicKeyJwk {
            kty: jwk.kty.clone(),
            crv: jwk.crv.clone(),
            x: jwk.x.clone(),
        }
        .to_public_key()?;
        if declared.as_bytes() != key_pair.public.as_bytes() {
            return Err(CryptoError::InvalidKey(
                "JWK public component does not match private key".to_string(),
            ));
        }

        Ok(key_pair)
    }

    /// Export the public key as a portable JWK
    pub fn public_jwk(&self) -> PublicKeyJwk {
        PublicKeyJwk::from_public_key(&self.public)
    }

    /// Export the full key pair as a JWK (for key stores only)
    pub fn private_jwk(&self) -> PrivateKeyJwk {
        PrivateKeyJwk {
            kty: JWK_KEY_TYPE.to_string(),
            crv: JWK_CURVE.to_string(),
            x: URL_SAFE_NO_PAD.encode(self.public.as_bytes()),
            d: URL_SAFE_NO_PAD.encode(self.secret.as_bytes()),
        }
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Compute a fingerprint for key verification
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Short hex fingerprint (first 8 bytes of SHA-256) of a public key
pub fn fingerprint_of(public: &PublicKey) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(public.as_bytes());
    hex::encode(&hash[..8])
}

/// Public key in JSON Web Key form (RFC 8037 OKP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyJwk {
    pub kty: String,
    pub crv: String,
    /// base64url (unpadded) public key bytes
    pub x: String,
}

impl PublicKeyJwk {
    /// Wrap a raw public key
    pub fn from_public_key(public: &PublicKey) -> Self {
        Self {
            kty: JWK_KEY_TYPE.to_string(),
            crv: JWK_CURVE.to_string(),
            x: URL_SAFE_NO_PAD.encode(public.as_bytes()),
        }
    }

    /// Import into a usable public key
    pub fn to_public_key(&self) -> CryptoResult<PublicKey> {
        check_jwk_header(&self.kty, &self.crv)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.x)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid JWK 'x': {}", e)))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Public key must be 32 bytes".to_string()))?;
        Ok(PublicKey::from(arr))
    }
}

/// Private key in JSON Web Key form. Wiped from memory on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKeyJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub d: String,
}

impl std::fmt::Debug for PrivateKeyJwk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyJwk")
            .field("kty", &self.kty)
            .field("crv", &self.crv)
            .field("x", &self.x)
            .finish_non_exhaustive()
    }
}

fn check_jwk_header(kty: &str, crv: &str) -> CryptoResult<()> {
    if kty != JWK_KEY_TYPE || crv != JWK_CURVE {
        return Err(CryptoError::InvalidKey(format!(
            "Unsupported JWK (kty={}, crv={})",
            kty, crv
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key = KeyPair::generate();
        assert_eq!(key.public_key_bytes().len(), 32);
        assert_eq!(key.secret().to_bytes().len(), 32);
    }

    #[test]
    fn test_public_jwk_round_trip() {
        let key = KeyPair::generate();
        let jwk = key.public_jwk();
        assert_eq!(jwk.kty, "OKP");
        assert_eq!(jwk.crv, "X25519");

        let json = serde_json::to_string(&jwk).unwrap();
        let parsed: PublicKeyJwk = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.to_public_key().unwrap().as_bytes(), key.public.as_bytes());
    }

    #[test]
    fn test_private_jwk_restores_same_pair() {
        let key = KeyPair::generate();
        let restored = KeyPair::from_private_jwk(&key.private_jwk()).unwrap();
        assert_eq!(restored.public_key_bytes(), key.public_key_bytes());
    }

    #[test]
    fn test_private_jwk_with_foreign_public_rejected() {
        let key = KeyPair::generate();
        let other = KeyPair::generate();
        let mut jwk = key.private_jwk();
        jwk.x = other.public_jwk().x;
        assert!(matches!(
            KeyPair::from_private_jwk(&jwk),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_rejects_other_curves() {
        let mut jwk = KeyPair::generate().public_jwk();
        jwk.crv = "P-256".to_string();
        assert!(jwk.to_public_key().is_err());

        let short = PublicKeyJwk {
            kty: "OKP".to_string(),
            crv: "X25519".to_string(),
            x: URL_SAFE_NO_PAD.encode([7u8; 16]),
        };
        assert!(short.to_public_key().is_err());
    }

    #[test]
    fn test_fingerprint() {
        let key = KeyPair::generate();
        let fingerprint = key.fingerprint();
        assert_eq!(fingerprint.len(), 16); // 8 bytes as hex = 16 chars
        assert_eq!(fingerprint, fingerprint_of(&key.public));
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = KeyPair::generate();
        let jwk = key.private_jwk();
        let rendered = format!("{:?} {:?}", key, jwk);
        assert!(!rendered.contains(&jwk.d));
    }
}
