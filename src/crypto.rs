// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record sealing with ChaCha20-Poly1305.
//!
//! Blob layout: `[nonce (12 bytes)] + [ciphertext + tag (16 bytes)]`.
//! The record's storage id is bound as associated data, so a blob copied
//! under another record's name fails to open.
//!
//! ```
//! use offline_sync::crypto::{DeviceKey, RecordCipher};
//!
//! let cipher = RecordCipher::new(&DeviceKey::generate());
//! let sealed = cipher.seal("abc123", b"payload").unwrap();
//! assert_eq!(cipher.open("abc123", &sealed).unwrap(), b"payload");
//! assert!(cipher.open("other", &sealed).is_err());
//! ```

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::fmt;

use crate::storage::traits::StorageError;

pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;

/// Per-device symmetric key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceKey([u8; KEY_SIZE]);

impl DeviceKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Fresh key from the system CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceKey(<redacted>)")
    }
}

/// Source of the device key (keychain, keystore, secure enclave).
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Key for this device, creating it on first use.
    async fn load_key(&self) -> Result<DeviceKey, StorageError>;
}

/// In-process key holder for tests and platforms without secure storage.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: Option<DeviceKey>,
}

impl StaticKeyProvider {
    pub fn new(key: DeviceKey) -> Self {
        Self { key: Some(key) }
    }

    /// A provider with a random key.
    #[must_use]
    pub fn random() -> Self {
        Self::new(DeviceKey::generate())
    }

    /// A provider whose key is unavailable (locked keychain).
    #[must_use]
    pub fn unavailable() -> Self {
        Self { key: None }
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn load_key(&self) -> Result<DeviceKey, StorageError> {
        self.key
            .clone()
            .ok_or_else(|| StorageError::EncryptionFailure("device key unavailable".to_string()))
    }
}

/// AEAD cipher bound to one device key.
pub struct RecordCipher {
    cipher: ChaCha20Poly1305,
}

impl RecordCipher {
    pub fn new(key: &DeviceKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt `plaintext` with a random nonce, authenticating `storage_id`.
    pub fn seal(&self, storage_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: storage_id.as_bytes() })
            .map_err(|e| StorageError::EncryptionFailure(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob produced by [`seal`](Self::seal) for the same storage id.
    pub fn open(&self, storage_id: &str, blob: &[u8]) -> Result<Vec<u8>, StorageError> {
        if blob.len() < NONCE_SIZE {
            return Err(StorageError::DecryptionFailure { id: storage_id.to_string() });
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload { msg: ciphertext, aad: storage_id.as_bytes() },
            )
            .map_err(|_| StorageError::DecryptionFailure { id: storage_id.to_string() })
    }
}
