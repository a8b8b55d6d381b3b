//! Encryption at rest for the local index.
//!
//! Records are sealed with AES-256-GCM under a symmetric index key before
//! they touch the store, so the database file never contains plaintext.
//! Key policy (where the index key comes from, how per-owner keys are
//! managed) belongs to the embedding application behind [`KeyProvider`];
//! this module only consumes the primitives.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, ParamsBuilder};
use async_trait::async_trait;
use thiserror::Error;

use crate::types::RecordContent;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("Failed to derive encryption key: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid encrypted data format: {0}")]
    InvalidFormat(String),

    #[error("No key available for {0}")]
    KeyMissing(String),
}

/// Opaque 256-bit symmetric key. Held only in memory, never persisted in
/// plaintext; dropped with the engine on logout or lock.
#[derive(Clone)]
pub struct IndexKey([u8; 32]);

impl IndexKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        use aes_gcm::aead::rand_core::RngCore;
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for IndexKey {
    // Key material must not leak into logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IndexKey(..)")
    }
}

/// Derive a key from a low-entropy secret with Argon2id.
pub fn derive_key_from_secret(secret: &[u8], salt: &[u8]) -> Result<IndexKey, CryptoError> {
    let params = ParamsBuilder::new()
        .m_cost(65536) // 64 MiB memory
        .t_cost(3)
        .p_cost(4)
        .build()
        .map_err(|e| CryptoError::KeyDerivation(format!("Failed to build Argon2 params: {}", e)))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output_key = [0u8; 32];
    argon2
        .hash_password_into(secret, salt, &mut output_key)
        .map_err(|e| CryptoError::KeyDerivation(format!("Argon2 key derivation failed: {}", e)))?;

    Ok(IndexKey(output_key))
}

/// AES-256-GCM sealing for record content.
///
/// Blob layout: nonce || ciphertext, nonce freshly random per seal.
pub struct IndexCipher {
    cipher: Aes256Gcm,
}

impl IndexCipher {
    pub fn new(key: &IndexKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use aes_gcm::aead::rand_core::RngCore;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidFormat(format!(
                "Encrypted data too short: {} bytes",
                blob.len()
            )));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher.decrypt(nonce, ciphertext).map_err(|e| {
            CryptoError::Decryption(format!(
                "AES-GCM decryption failed (possibly wrong key or corrupted data): {}",
                e
            ))
        })
    }

    /// Seal a record's searchable content for storage.
    pub fn seal_content(&self, content: &RecordContent) -> Result<Vec<u8>, CryptoError> {
        let plaintext = serde_json::to_vec(content)
            .map_err(|e| CryptoError::Encryption(format!("Content serialization failed: {}", e)))?;
        self.seal(&plaintext)
    }

    /// Open a sealed blob back into record content.
    pub fn open_content(&self, blob: &[u8]) -> Result<RecordContent, CryptoError> {
        let plaintext = self.open(blob)?;
        serde_json::from_slice(&plaintext).map_err(|e| {
            CryptoError::Decryption(format!("Decrypted content is not valid JSON: {}", e))
        })
    }
}

/// External key service. Supplies the index key for local sealing and the
/// per-owner keys needed to read server-side payloads during indexing.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// The symmetric key the local index is sealed under.
    async fn index_key(&self) -> Result<IndexKey, CryptoError>;

    /// Decryption key for a record owner's server-side payloads, or `None`
    /// if the key is (currently) unavailable.
    async fn owner_key(&self, owner: &str) -> Result<Option<IndexKey>, CryptoError>;
}
