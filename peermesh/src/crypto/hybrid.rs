//! Hybrid encryption engine
//!
//! Each message is sealed with a fresh AES-256-GCM key and nonce. That content
//! key is then wrapped for the recipient:
//!
//! 1. Generate an ephemeral X25519 key pair
//! 2. ECDH with the recipient's public key
//! 3. HKDF-SHA256 over the shared secret, bound to both public keys
//! 4. AES-256-GCM encrypt the content key under the derived key
//!
//! `encryptedKey` on the wire is `ephemeral_public(32) || nonce(12) || wrapped(48)`.
//! Decryption is the integrity check: any flipped bit in the ciphertext, the
//! IV or the wrapped key fails authentication.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::KeyPair;

/// Symmetric content key length (AES-256)
pub const CONTENT_KEY_LEN: usize = 32;
/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length
const TAG_LEN: usize = 16;
/// Length of the decoded `encryptedKey` field
pub const WRAPPED_KEY_LEN: usize = 32 + NONCE_LEN + CONTENT_KEY_LEN + TAG_LEN;

const WRAP_SALT: &[u8] = b"PeerMesh-KeyWrap-v1";

/// Encrypted payload for one recipient. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPacket {
    /// base64 AES-GCM ciphertext with appended tag
    pub ciphertext: String,
    /// base64 96-bit nonce
    pub iv: String,
    /// base64 wrapped content key
    pub encrypted_key: String,
}

impl EncryptedPacket {
    /// Decoded ciphertext bytes
    pub fn ciphertext_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(STANDARD.decode(&self.ciphertext)?)
    }
}

/// Encrypt `content` for the holder of `recipient`'s private key
///
/// A new content key and nonce are drawn for every call; the content key is
/// wiped when this function returns.
pub fn encrypt(content: &[u8], recipient: &PublicKey) -> CryptoResult<EncryptedPacket> {
    let mut content_key = Zeroizing::new([0u8; CONTENT_KEY_LEN]);
    OsRng.fill_bytes(content_key.as_mut());
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(content_key.as_ref()));
    let ciphertext = cipher.encrypt(Nonce::from_slice(&iv), content)?;
    let encrypted_key = wrap_key(&content_key, recipient)?;

    Ok(EncryptedPacket {
        ciphertext: STANDARD.encode(ciphertext),
        iv: STANDARD.encode(iv),
        encrypted_key: STANDARD.encode(encrypted_key),
    })
}

/// Decrypt a packet addressed to `own`
pub fn decrypt(packet: &EncryptedPacket, own: &KeyPair) -> CryptoResult<Vec<u8>> {
    let ciphertext = STANDARD.decode(&packet.ciphertext)?;
    let iv = STANDARD.decode(&packet.iv)?;
    let encrypted_key = STANDARD.decode(&packet.encrypted_key)?;

    if iv.len() != NONCE_LEN {
        return Err(CryptoError::MalformedPacket(format!(
            "iv must be {} bytes, got {}",
            NONCE_LEN,
            iv.len()
        )));
    }

    let content_key = unwrap_key(&encrypted_key, own)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(content_key.as_ref()));
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| CryptoError::IntegrityError("content authentication failed".to_string()))
}

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Cross-check out-of-band hashes against the packet's ciphertext
///
/// Every claimed hash must equal the SHA-256 of the decoded ciphertext. Callers
/// run this before attempting decryption.
pub fn verify_payload_hash(packet: &EncryptedPacket, claimed: &[&str]) -> CryptoResult<()> {
    let computed = sha256_hex(&packet.ciphertext_bytes()?);
    for hash in claimed {
        if !hash.eq_ignore_ascii_case(&computed) {
            return Err(CryptoError::Tampered {
                claimed: hash.to_string(),
                computed,
            });
        }
    }
    Ok(())
}

fn derive_wrap_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> CryptoResult<Zeroizing<[u8; 32]>> {
    let mut info = [0u8; 64];
    info[..32].copy_from_slice(ephemeral_public);
    info[32..].copy_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(WRAP_SALT), shared_secret);
    let mut output = Zeroizing::new([0u8; 32]);
    hkdf.expand(&info, output.as_mut())
        .map_err(|e| CryptoError::EncryptionError(format!("HKDF expansion failed: {}", e)))?;
    Ok(output)
}

fn wrap_key(content_key: &[u8; CONTENT_KEY_LEN], recipient: &PublicKey) -> CryptoResult<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "recipient public key is a low-order point".to_string(),
        ));
    }

    let kek = derive_wrap_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_ref()));
    let wrapped = cipher.encrypt(Nonce::from_slice(&nonce), content_key.as_slice())?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&wrapped);
    Ok(out)
}

fn unwrap_key(encrypted_key: &[u8], own: &KeyPair) -> CryptoResult<Zeroizing<[u8; CONTENT_KEY_LEN]>> {
    if encrypted_key.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::MalformedPacket(format!(
            "encryptedKey must be {} bytes, got {}",
            WRAPPED_KEY_LEN,
            encrypted_key.len()
        )));
    }

    let (ephemeral_bytes, rest) = encrypted_key.split_at(32);
    let (nonce, wrapped) = rest.split_at(NONCE_LEN);
    let ephemeral_arr: [u8; 32] = ephemeral_bytes
        .try_into()
        .map_err(|_| CryptoError::MalformedPacket("bad ephemeral key".to_string()))?;
    let ephemeral_public = PublicKey::from(ephemeral_arr);

    let shared = own.secret().diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::IntegrityError(
            "ephemeral key is a low-order point".to_string(),
        ));
    }

    let kek = derive_wrap_key(shared.as_bytes(), &ephemeral_arr, own.public.as_bytes())?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_ref()));
    let raw = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), wrapped)
            .map_err(|_| CryptoError::IntegrityError("key unwrap failed".to_string()))?,
    );

    let mut content_key = Zeroizing::new([0u8; CONTENT_KEY_LEN]);
    if raw.len() != CONTENT_KEY_LEN {
        return Err(CryptoError::IntegrityError("unwrapped key has wrong length".to_string()));
    }
    content_key.copy_from_slice(&raw);
    Ok(content_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flip_bit(field: &str, byte: usize, bit: u8) -> String {
        let mut bytes = STANDARD.decode(field).unwrap();
        bytes[byte] ^= 1 << bit;
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_round_trip_text() {
        let bob = KeyPair::generate();
        let packet = encrypt(b"hello bob", &bob.public).unwrap();
        assert_eq!(decrypt(&packet, &bob).unwrap(), b"hello bob");
    }

    #[test]
    fn test_round_trip_empty() {
        let bob = KeyPair::generate();
        let packet = encrypt(b"", &bob.public).unwrap();
        assert!(decrypt(&packet, &bob).unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_large_binary() {
        let bob = KeyPair::generate();
        let mut content = vec![0u8; 500 * 1024];
        OsRng.fill_bytes(&mut content);
        let packet = encrypt(&content, &bob.public).unwrap();
        assert_eq!(decrypt(&packet, &bob).unwrap(), content);
    }

    #[test]
    fn test_fresh_key_and_nonce_per_message() {
        let bob = KeyPair::generate();
        let a = encrypt(b"same", &bob.public).unwrap();
        let b = encrypt(b"same", &bob.public).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted_key, b.encrypted_key);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let bob = KeyPair::generate();
        let eve = KeyPair::generate();
        let packet = encrypt(b"for bob only", &bob.public).unwrap();
        assert!(matches!(decrypt(&packet, &eve), Err(CryptoError::IntegrityError(_))));
    }

    #[test]
    fn test_flipped_ciphertext_bit_fails() {
        let bob = KeyPair::generate();
        let packet = encrypt(b"integrity matters", &bob.public).unwrap();
        let len = STANDARD.decode(&packet.ciphertext).unwrap().len();
        for byte in [0, len / 2, len - 1] {
            let mut tampered = packet.clone();
            tampered.ciphertext = flip_bit(&packet.ciphertext, byte, 3);
            assert!(matches!(decrypt(&tampered, &bob), Err(CryptoError::IntegrityError(_))));
        }
    }

    #[test]
    fn test_flipped_iv_bit_fails() {
        let bob = KeyPair::generate();
        let packet = encrypt(b"integrity matters", &bob.public).unwrap();
        for byte in 0..NONCE_LEN {
            let mut tampered = packet.clone();
            tampered.iv = flip_bit(&packet.iv, byte, 0);
            assert!(decrypt(&tampered, &bob).is_err());
        }
    }

    #[test]
    fn test_flipped_encrypted_key_bit_fails() {
        let bob = KeyPair::generate();
        let packet = encrypt(b"integrity matters", &bob.public).unwrap();
        // Includes the top bit of the ephemeral key, which X25519 itself ignores
        for (byte, bit) in [(0, 0), (31, 7), (32, 1), (50, 4), (WRAPPED_KEY_LEN - 1, 6)] {
            let mut tampered = packet.clone();
            tampered.encrypted_key = flip_bit(&packet.encrypted_key, byte, bit);
            let result = decrypt(&tampered, &bob);
            assert!(
                matches!(result, Err(CryptoError::IntegrityError(_))),
                "byte {} bit {} was accepted",
                byte,
                bit
            );
        }
    }

    #[test]
    fn test_malformed_fields() {
        let bob = KeyPair::generate();
        let mut packet = encrypt(b"x", &bob.public).unwrap();
        packet.iv = "not base64!".to_string();
        assert!(matches!(decrypt(&packet, &bob), Err(CryptoError::MalformedPacket(_))));

        let mut packet = encrypt(b"x", &bob.public).unwrap();
        packet.encrypted_key = STANDARD.encode([1u8; 10]);
        assert!(matches!(decrypt(&packet, &bob), Err(CryptoError::MalformedPacket(_))));
    }

    #[test]
    fn test_payload_hash_cross_check() {
        let bob = KeyPair::generate();
        let packet = encrypt(b"relayed", &bob.public).unwrap();
        let good = sha256_hex(&packet.ciphertext_bytes().unwrap());
        assert!(verify_payload_hash(&packet, &[&good, &good.to_uppercase()]).is_ok());

        let bad = sha256_hex(b"something else");
        let err = verify_payload_hash(&packet, &[&good, &bad]).unwrap_err();
        match err {
            CryptoError::Tampered { claimed, computed } => {
                assert_eq!(claimed, bad);
                assert_eq!(computed, good);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_packet_wire_field_names() {
        let bob = KeyPair::generate();
        let packet = encrypt(b"x", &bob.public).unwrap();
        let json = serde_json::to_value(&packet).unwrap();
        assert!(json.get("ciphertext").is_some());
        assert!(json.get("iv").is_some());
        assert!(json.get("encryptedKey").is_some());
    }
}
