// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Manager
//!
//! Deterministic P-256 keys derived from a master seed that never leaves the
//! enclave. Callers only ever get a [`KeyHandle`], public keys, addresses and
//! signatures.
//!
//! ## Derivation
//!
//! ```text
//! handle = hex(SHA-256(path)[..16])
//! scalar = hash_to_scalar(master_seed || path)      // see derive.rs
//! ```
//!
//! Re-deriving a known path is a cache hit. Re-initializing replaces the seed
//! and drops every derived key.
//!
//! ## Seed Persistence
//!
//! [`KeyManager::initialize`] creates a fresh seed each time, so derived keys
//! do not survive a restart. [`KeyManager::initialize_sealed`] keeps the seed
//! in the vault instead and restores it on the next start.
//!
//! ## Signatures
//!
//! ECDSA over SHA-256 of the message (RFC 6979 nonces), encoded as fixed-width
//! `r || s` (64 bytes).

pub(crate) mod derive;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::enclave::{EnclaveRuntime, RuntimeError, SecretBuffer};
use crate::error::ErrorKind;
use crate::neo::address_from_public_key;
use crate::vault::{Vault, VaultError};

/// Master seed length in bytes.
pub const MASTER_SEED_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key manager not initialized")]
    NotInitialized,

    #[error("key not found: {0}")]
    NotFound(KeyHandle),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("key derivation failed for handle {0}")]
    Derivation(KeyHandle),

    #[error("enclave runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("seed storage error: {0}")]
    Vault(#[from] VaultError),
}

impl KeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyError::NotInitialized | KeyError::Derivation(_) => ErrorKind::Permanent,
            KeyError::NotFound(_) => ErrorKind::NotFound,
            KeyError::InvalidInput(_) => ErrorKind::InvalidInput,
            KeyError::Runtime(e) => e.kind(),
            KeyError::Vault(e) => e.kind(),
        }
    }
}

/// Opaque reference to an enclave-resident key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyHandle(String);

impl KeyHandle {
    /// `hex(SHA-256(path)[..16])`
    pub fn from_path(path: &str) -> Self {
        let digest = Sha256::digest(path.as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for KeyHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Address format selector for [`KeyManager::get_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Neo,
    Ethereum,
}

impl FromStr for ChainType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "neo" | "neo3" | "n3" => Ok(ChainType::Neo),
            "ethereum" | "eth" | "evm" => Ok(ChainType::Ethereum),
            other => Err(KeyError::InvalidInput(format!("unsupported chain: {other}"))),
        }
    }
}

/// Where the master seed came from in [`KeyManager::initialize_sealed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOrigin {
    Restored,
    Generated,
}

pub struct KeyManager {
    runtime: Arc<dyn EnclaveRuntime>,
    // Lock order: seed, then keys.
    seed: RwLock<Option<SecretBuffer>>,
    keys: RwLock<HashMap<KeyHandle, SigningKey>>,
}

impl KeyManager {
    pub fn new(runtime: Arc<dyn EnclaveRuntime>) -> Self {
        Self {
            runtime,
            seed: RwLock::new(None),
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Generate a fresh master seed. Previously derived keys are dropped.
    pub fn initialize(&self) -> Result<(), KeyError> {
        let seed = self.runtime.generate_random(MASTER_SEED_SIZE)?;
        self.install_seed(seed);
        info!("Key manager initialized with fresh master seed");
        Ok(())
    }

    /// Restore the master seed from `vault`, or generate and store one.
    pub fn initialize_sealed(
        &self,
        vault: &Vault,
        namespace: &str,
        name: &str,
    ) -> Result<SeedOrigin, KeyError> {
        let restored = vault.use_secret(namespace, name, |seed| {
            Ok::<_, VaultError>(SecretBuffer::from_slice(seed))
        });

        match restored {
            Ok(seed) => {
                if seed.len() != MASTER_SEED_SIZE {
                    return Err(KeyError::InvalidInput(format!(
                        "sealed master seed is {} bytes, expected {MASTER_SEED_SIZE}",
                        seed.len()
                    )));
                }
                self.install_seed(seed);
                info!(namespace, name, "Key manager restored sealed master seed");
                Ok(SeedOrigin::Restored)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let seed = self.runtime.generate_random(MASTER_SEED_SIZE)?;
                vault.store(namespace, name, &seed)?;
                self.install_seed(seed);
                info!(namespace, name, "Key manager generated and sealed new master seed");
                Ok(SeedOrigin::Generated)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.read_seed().is_some()
    }

    pub fn key_count(&self) -> usize {
        self.read_keys().len()
    }

    /// Derive (or look up) the key for `path`.
    pub fn derive_key(&self, path: &str) -> Result<KeyHandle, KeyError> {
        let handle = KeyHandle::from_path(path);

        let seed = self.read_seed();
        let seed = seed.as_ref().ok_or(KeyError::NotInitialized)?;

        if self.read_keys().contains_key(&handle) {
            return Ok(handle);
        }

        let scalar = derive::scalar_from_hash(&[seed.as_bytes(), path.as_bytes()])
            .ok_or_else(|| KeyError::Derivation(handle.clone()))?;

        self.write_keys()
            .entry(handle.clone())
            .or_insert_with(|| SigningKey::from(scalar));
        Ok(handle)
    }

    /// Sign `data` (hashed with SHA-256). Returns `r || s`.
    pub fn sign(&self, handle: &KeyHandle, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let keys = self.read_keys();
        let key = keys
            .get(handle)
            .ok_or_else(|| KeyError::NotFound(handle.clone()))?;
        let signature: Signature = key.sign(data);
        Ok(signature.to_bytes().to_vec())
    }

    /// Verify an `r || s` signature over `data` against a SEC1 public key
    /// (compressed or uncompressed). Malformed keys or signatures verify as
    /// `false`.
    pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_sec1_bytes(public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(data, &signature).is_ok()
    }

    /// Uncompressed SEC1 public key (65 bytes).
    pub fn get_public_key(&self, handle: &KeyHandle) -> Result<Vec<u8>, KeyError> {
        self.with_verifying_key(handle, |key| {
            key.to_encoded_point(false).as_bytes().to_vec()
        })
    }

    pub fn get_address(&self, handle: &KeyHandle, chain: ChainType) -> Result<String, KeyError> {
        self.with_verifying_key(handle, |key| match chain {
            ChainType::Neo => {
                let mut compressed = [0u8; 33];
                compressed.copy_from_slice(key.to_encoded_point(true).as_bytes());
                address_from_public_key(&compressed)
            }
            ChainType::Ethereum => {
                let point = key.to_encoded_point(false);
                let digest = Sha256::digest(&point.as_bytes()[1..]);
                format!("0x{}", hex::encode(&digest[12..]))
            }
        })
    }

    /// Scrub the master seed and every derived key.
    pub fn zero(&self) {
        let mut seed = self.write_seed();
        let mut keys = self.write_keys();
        let count = keys.len();
        // SecretBuffer and SigningKey both zero themselves on drop.
        keys.clear();
        *seed = None;
        info!(keys = count, "Key manager zeroed");
    }

    fn install_seed(&self, new_seed: SecretBuffer) {
        let mut seed = self.write_seed();
        let mut keys = self.write_keys();
        keys.clear();
        *seed = Some(new_seed);
    }

    fn with_verifying_key<T>(
        &self,
        handle: &KeyHandle,
        f: impl FnOnce(&VerifyingKey) -> T,
    ) -> Result<T, KeyError> {
        let keys = self.read_keys();
        let key = keys
            .get(handle)
            .ok_or_else(|| KeyError::NotFound(handle.clone()))?;
        Ok(f(key.verifying_key()))
    }

    fn read_seed(&self) -> RwLockReadGuard<'_, Option<SecretBuffer>> {
        self.seed.read().unwrap_or_else(|e| {
            warn!("Master seed lock was poisoned");
            e.into_inner()
        })
    }

    fn write_seed(&self) -> RwLockWriteGuard<'_, Option<SecretBuffer>> {
        self.seed.write().unwrap_or_else(|e| {
            warn!("Master seed lock was poisoned");
            e.into_inner()
        })
    }

    fn read_keys(&self) -> RwLockReadGuard<'_, HashMap<KeyHandle, SigningKey>> {
        self.keys.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_keys(&self) -> RwLockWriteGuard<'_, HashMap<KeyHandle, SigningKey>> {
        self.keys.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.zero();
    }
}
