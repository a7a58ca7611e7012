// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! AES-256-GCM sealing shared by the runtime adapters.
//!
//! Sealed blob layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};

use super::{RuntimeError, SecretBuffer};

/// Size of the sealing key in bytes.
pub const SEALING_KEY_SIZE: usize = 32;

/// Size of the AES-GCM nonce prefix.
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag.
pub const TAG_SIZE: usize = 16;

/// Authenticated cipher bound to one sealing key.
pub struct SealingCipher {
    cipher: Aes256Gcm,
}

impl SealingCipher {
    pub fn new(key: &[u8; SEALING_KEY_SIZE]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| RuntimeError::Seal("AES-GCM encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Authenticate and decrypt a blob produced by [`seal`](Self::seal).
    pub fn unseal(&self, sealed: &[u8]) -> Result<SecretBuffer, RuntimeError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(RuntimeError::Unseal(format!(
                "sealed blob too short ({} bytes)",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RuntimeError::Unseal("authentication tag mismatch".to_string()))?;

        Ok(SecretBuffer::new(plaintext))
    }
}
