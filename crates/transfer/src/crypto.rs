//! Encryption provider capability.
//!
//! The engine never picks a cipher itself. It is handed an
//! [`EncryptionProvider`] at construction and calls it once per chunk, so
//! every chunk is sealed and opened independently.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

/// Key length for the shipped AES-256-GCM provider.
pub const KEY_SIZE: usize = 32;

/// Nonce length prepended to every AES-GCM ciphertext.
pub const NONCE_SIZE: usize = 12;

/// Errors reported by an encryption provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Symmetric key material. `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generates a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(s).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_SIZE] = raw.try_into().map_err(|v: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Encrypts and decrypts independent byte blobs.
///
/// Implementations must fail with an error on a wrong key rather than
/// returning garbage.
pub trait EncryptionProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CryptoError>;
}

/// AES-256-GCM with a random 96-bit nonce prepended to each ciphertext.
///
/// Output layout: `[12 bytes nonce][ciphertext + 16 byte tag]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmProvider;

impl EncryptionProvider for AesGcmProvider {
    fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CryptoError::Decrypt(format!(
                "ciphertext shorter than nonce ({} bytes)",
                ciphertext.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);

        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decrypt("authentication tag mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = EncryptionKey::generate();
        let sealed = AesGcmProvider.encrypt(b"secret payload", &key).unwrap();
        assert_ne!(&sealed[NONCE_SIZE..], b"secret payload");
        let opened = AesGcmProvider.decrypt(&sealed, &key).unwrap();
        assert_eq!(opened, b"secret payload");
    }

    #[test]
    fn same_plaintext_gets_fresh_nonce() {
        let key = EncryptionKey::generate();
        let a = AesGcmProvider.encrypt(b"x", &key).unwrap();
        let b = AesGcmProvider.encrypt(b"x", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_loudly() {
        let sealed = AesGcmProvider
            .encrypt(b"secret", &EncryptionKey::generate())
            .unwrap();
        let result = AesGcmProvider.decrypt(&sealed, &EncryptionKey::generate());
        assert!(matches!(result, Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn truncated_ciphertext_rejected() {
        let key = EncryptionKey::generate();
        assert!(AesGcmProvider.decrypt(&[0u8; 4], &key).is_err());
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = EncryptionKey::generate();
        let sealed = AesGcmProvider.encrypt(b"", &key).unwrap();
        assert_eq!(AesGcmProvider.decrypt(&sealed, &key).unwrap(), b"");
    }

    #[test]
    fn key_from_hex() {
        let key = EncryptionKey::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(key.as_bytes()[0], 0xab);
        assert!(EncryptionKey::from_hex("abcd").is_err());
        assert!(EncryptionKey::from_hex("zz").is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let key = EncryptionKey::from_bytes([7u8; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "EncryptionKey(..)");
    }
}
