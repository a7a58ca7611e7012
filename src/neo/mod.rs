// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Neo N3 Signer
//!
//! Wallets whose private keys live only in enclave memory. Callers hold a
//! [`WalletHandle`] and get back public keys, script hashes, addresses and
//! signatures.
//!
//! ## Wallet Sources
//!
//! | Operation | Private key | Handle |
//! |-----------|-------------|--------|
//! | `create_wallet(path)` | Runtime randomness | `hex(SHA-256(path)[..16])` |
//! | `derive_wallet(path)` | `hash_to_scalar(path)` | `hex(SHA-256(path)[..16])` |
//! | `import_wif(wif)` | Decoded WIF | `hex(SHA-256(address)[..16])` |
//!
//! Creating or deriving a path that already has a wallet returns the existing
//! handle.
//!
//! `derive_wallet` depends only on the path text, so anyone who knows the path
//! can recompute the key. Use [`KeyManager`](crate::keys::KeyManager) for
//! seed-bound derivation.
//!
//! ## Signatures
//!
//! `r || s`, 64 bytes. `sign_transaction` signs a 32-byte digest as-is;
//! `sign_data` hashes with SHA-256 first.

mod address;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::FieldBytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::enclave::{EnclaveRuntime, RuntimeError};
use crate::error::ErrorKind;
use crate::keys::derive::{scalar_from_bytes, scalar_from_hash};

pub use address::{
    address_from_public_key, address_from_script_hash, decode_wif, encode_wif, script_hash,
    verification_script, ADDRESS_VERSION,
};

/// Size of a transaction digest accepted by `sign_transaction`.
pub const TX_DIGEST_SIZE: usize = 32;

/// Random candidates tried before giving up on key generation.
const MAX_KEYGEN_ATTEMPTS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("wallet not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("enclave runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl SignerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignerError::NotFound(_) => ErrorKind::NotFound,
            SignerError::InvalidInput(_) => ErrorKind::InvalidInput,
            SignerError::KeyGeneration(_) => ErrorKind::Permanent,
            SignerError::Runtime(e) => e.kind(),
        }
    }
}

/// Opaque reference to an enclave-resident Neo wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletHandle(String);

impl WalletHandle {
    fn from_label(label: &str) -> Self {
        let digest = Sha256::digest(label.as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WalletHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WalletHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

struct Wallet {
    private_key: SigningKey,
    public_key: [u8; 33],
    script_hash: [u8; 20],
    address: String,
}

impl Wallet {
    fn new(private_key: SigningKey) -> Self {
        let mut public_key = [0u8; 33];
        public_key.copy_from_slice(private_key.verifying_key().to_encoded_point(true).as_bytes());
        let script_hash = script_hash(&verification_script(&public_key));
        let address = address_from_script_hash(&script_hash);
        Self {
            private_key,
            public_key,
            script_hash,
            address,
        }
    }
}

pub struct NeoSigner {
    runtime: Arc<dyn EnclaveRuntime>,
    wallets: RwLock<HashMap<WalletHandle, Wallet>>,
}

impl NeoSigner {
    pub fn new(runtime: Arc<dyn EnclaveRuntime>) -> Self {
        Self {
            runtime,
            wallets: RwLock::new(HashMap::new()),
        }
    }

    /// New wallet with a random private key, registered under `path`.
    pub fn create_wallet(&self, path: &str) -> Result<WalletHandle, SignerError> {
        let handle = WalletHandle::from_label(path);
        let mut wallets = self.write_wallets();
        if wallets.contains_key(&handle) {
            return Ok(handle);
        }

        let wallet = Wallet::new(self.random_key()?);
        info!(handle = %handle, address = %wallet.address, "Created Neo wallet");
        wallets.insert(handle.clone(), wallet);
        Ok(handle)
    }

    /// Wallet derived from the path text alone (`SHA-256(path)`).
    ///
    /// The master seed is not involved, so anyone who knows the path can
    /// reproduce the key. Seed-bound keys come from
    /// [`KeyManager::derive_key`](crate::keys::KeyManager::derive_key).
    pub fn derive_wallet(&self, seed_path: &str) -> Result<WalletHandle, SignerError> {
        let handle = WalletHandle::from_label(seed_path);
        let mut wallets = self.write_wallets();
        if wallets.contains_key(&handle) {
            return Ok(handle);
        }

        let scalar = scalar_from_hash(&[seed_path.as_bytes()])
            .ok_or_else(|| SignerError::KeyGeneration("no valid scalar for path".to_string()))?;
        let wallet = Wallet::new(SigningKey::from(scalar));
        info!(handle = %handle, address = %wallet.address, "Derived Neo wallet");
        wallets.insert(handle.clone(), wallet);
        Ok(handle)
    }

    /// Import a compressed-key WIF. The decoded bytes are zeroed before
    /// returning, on success or failure.
    pub fn import_wif(&self, wif: &str) -> Result<WalletHandle, SignerError> {
        let raw = decode_wif(wif)?;
        let scalar = scalar_from_bytes(FieldBytes::from_slice(raw.as_slice())).ok_or_else(|| {
            SignerError::InvalidInput("WIF key is outside the curve order".to_string())
        })?;
        drop(raw);

        let wallet = Wallet::new(SigningKey::from(scalar));
        let handle = WalletHandle::from_label(&wallet.address);
        info!(handle = %handle, address = %wallet.address, "Imported Neo wallet");
        self.write_wallets().insert(handle.clone(), wallet);
        Ok(handle)
    }

    pub fn get_address(&self, handle: &WalletHandle) -> Result<String, SignerError> {
        self.with_wallet(handle, |w| w.address.clone())
    }

    /// Compressed public key (33 bytes).
    pub fn get_public_key(&self, handle: &WalletHandle) -> Result<Vec<u8>, SignerError> {
        self.with_wallet(handle, |w| w.public_key.to_vec())
    }

    /// Verification script hash (20 bytes, as hashed; not byte-reversed).
    pub fn get_script_hash(&self, handle: &WalletHandle) -> Result<Vec<u8>, SignerError> {
        self.with_wallet(handle, |w| w.script_hash.to_vec())
    }

    /// Sign a 32-byte transaction digest without rehashing.
    pub fn sign_transaction(
        &self,
        handle: &WalletHandle,
        tx_digest: &[u8],
    ) -> Result<Vec<u8>, SignerError> {
        if tx_digest.len() != TX_DIGEST_SIZE {
            return Err(SignerError::InvalidInput(format!(
                "transaction digest is {} bytes, expected {TX_DIGEST_SIZE}",
                tx_digest.len()
            )));
        }

        let wallets = self.read_wallets();
        let wallet = lookup(&wallets, handle)?;
        let signature: Signature = wallet
            .private_key
            .sign_prehash(tx_digest)
            .map_err(|e| SignerError::InvalidInput(e.to_string()))?;
        debug!(handle = %handle, "Signed transaction digest");
        Ok(signature.to_bytes().to_vec())
    }

    /// Sign SHA-256(`data`).
    pub fn sign_data(&self, handle: &WalletHandle, data: &[u8]) -> Result<Vec<u8>, SignerError> {
        let wallets = self.read_wallets();
        let wallet = lookup(&wallets, handle)?;
        let signature: Signature = wallet.private_key.sign(data);
        Ok(signature.to_bytes().to_vec())
    }

    /// Verify a `sign_data` signature. Accepts 33-byte compressed and 65-byte
    /// uncompressed public keys.
    pub fn verify_signature(
        public_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, SignerError> {
        let (key, signature) = parse_verification_inputs(public_key, signature)?;
        Ok(key.verify(data, &signature).is_ok())
    }

    /// Verify a `sign_transaction` signature over a 32-byte digest.
    pub fn verify_transaction(
        public_key: &[u8],
        tx_digest: &[u8],
        signature: &[u8],
    ) -> Result<bool, SignerError> {
        if tx_digest.len() != TX_DIGEST_SIZE {
            return Err(SignerError::InvalidInput(format!(
                "transaction digest is {} bytes, expected {TX_DIGEST_SIZE}",
                tx_digest.len()
            )));
        }
        let (key, signature) = parse_verification_inputs(public_key, signature)?;
        Ok(key.verify_prehash(tx_digest, &signature).is_ok())
    }

    /// Remove a wallet and scrub its key.
    pub fn delete_wallet(&self, handle: &WalletHandle) -> Result<(), SignerError> {
        match self.write_wallets().remove(handle) {
            Some(wallet) => {
                info!(handle = %handle, address = %wallet.address, "Deleted Neo wallet");
                Ok(())
            }
            None => Err(SignerError::NotFound(handle.to_string())),
        }
    }

    /// Handles of every loaded wallet, sorted.
    pub fn list_wallets(&self) -> Vec<WalletHandle> {
        let mut handles: Vec<WalletHandle> = self.read_wallets().keys().cloned().collect();
        handles.sort();
        handles
    }

    /// Scrub every wallet key.
    pub fn zero(&self) {
        let mut wallets = self.write_wallets();
        let count = wallets.len();
        wallets.clear();
        info!(wallets = count, "Neo signer zeroed");
    }

    fn random_key(&self) -> Result<SigningKey, SignerError> {
        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            let candidate = self.runtime.generate_random(32)?;
            if let Some(scalar) = scalar_from_bytes(FieldBytes::from_slice(&candidate)) {
                return Ok(SigningKey::from(scalar));
            }
        }
        Err(SignerError::KeyGeneration(
            "runtime randomness never produced a valid scalar".to_string(),
        ))
    }

    fn with_wallet<T>(
        &self,
        handle: &WalletHandle,
        f: impl FnOnce(&Wallet) -> T,
    ) -> Result<T, SignerError> {
        let wallets = self.read_wallets();
        Ok(f(lookup(&wallets, handle)?))
    }

    fn read_wallets(&self) -> RwLockReadGuard<'_, HashMap<WalletHandle, Wallet>> {
        self.wallets.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_wallets(&self) -> RwLockWriteGuard<'_, HashMap<WalletHandle, Wallet>> {
        self.wallets.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for NeoSigner {
    fn drop(&mut self) {
        self.zero();
    }
}

fn lookup<'a>(
    wallets: &'a HashMap<WalletHandle, Wallet>,
    handle: &WalletHandle,
) -> Result<&'a Wallet, SignerError> {
    wallets
        .get(handle)
        .ok_or_else(|| SignerError::NotFound(handle.to_string()))
}

fn parse_verification_inputs(
    public_key: &[u8],
    signature: &[u8],
) -> Result<(VerifyingKey, Signature), SignerError> {
    if public_key.len() != 33 && public_key.len() != 65 {
        return Err(SignerError::InvalidInput(format!(
            "public key is {} bytes, expected 33 or 65",
            public_key.len()
        )));
    }
    if signature.len() != 64 {
        return Err(SignerError::InvalidInput(format!(
            "signature is {} bytes, expected 64",
            signature.len()
        )));
    }
    // Compressed keys are decompressed from the curve equation, with the
    // 0x02/0x03 prefix selecting the y parity.
    let key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| SignerError::InvalidInput("public key is not on P-256".to_string()))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| SignerError::InvalidInput("signature scalars out of range".to_string()))?;
    Ok((key, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::SimulatedRuntime;

    fn signer() -> NeoSigner {
        NeoSigner::new(Arc::new(SimulatedRuntime::ephemeral().unwrap()))
    }

    #[test]
    fn create_wallet_produces_n3_address() {
        let s = signer();
        let h = s.create_wallet("wallet/1").unwrap();

        let address = s.get_address(&h).unwrap();
        assert_eq!(address.len(), 34);
        assert!(address.starts_with('N'));
        assert_eq!(s.get_public_key(&h).unwrap().len(), 33);
        assert_eq!(s.get_script_hash(&h).unwrap().len(), 20);
    }

    #[test]
    fn create_wallet_twice_returns_existing() {
        let s = signer();
        let a = s.create_wallet("wallet/1").unwrap();
        let address = s.get_address(&a).unwrap();
        let b = s.create_wallet("wallet/1").unwrap();

        assert_eq!(a, b);
        assert_eq!(s.get_address(&b).unwrap(), address);
        assert_eq!(s.list_wallets().len(), 1);
    }

    #[test]
    fn create_wallet_is_random_per_signer() {
        let a = signer();
        let b = signer();
        let ha = a.create_wallet("same").unwrap();
        let hb = b.create_wallet("same").unwrap();
        assert_eq!(ha, hb);
        assert_ne!(a.get_address(&ha).unwrap(), b.get_address(&hb).unwrap());
    }

    #[test]
    fn derive_wallet_depends_only_on_path() {
        let a = signer();
        let b = signer();
        let ha = a.derive_wallet("m/44/888/0/0").unwrap();
        let hb = b.derive_wallet("m/44/888/0/0").unwrap();
        assert_eq!(a.get_address(&ha).unwrap(), b.get_address(&hb).unwrap());

        let hc = a.derive_wallet("m/44/888/0/1").unwrap();
        assert_ne!(a.get_address(&ha).unwrap(), a.get_address(&hc).unwrap());
    }

    #[test]
    fn wif_round_trip_preserves_identity() {
        let key = [0x3c; 32];
        let reference = Wallet::new(SigningKey::from_slice(&key).unwrap());

        let s = signer();
        let wif = encode_wif(&key);
        let h = s.import_wif(&wif).unwrap();

        assert_eq!(s.get_address(&h).unwrap(), reference.address);
        assert_eq!(s.get_public_key(&h).unwrap(), reference.public_key.to_vec());
        assert_eq!(h, WalletHandle::from_label(&reference.address));
    }

    #[test]
    fn imported_wif_matches_published_wallet() {
        let s = signer();
        let h = s
            .import_wif("L1QqQJnpBwbsPGAuutuzPTac8piqvbR1HRjrY5qHup48TBCBFe4g")
            .unwrap();

        assert_eq!(s.get_address(&h).unwrap(), "NPTmAHDxo6Pkyic8Nvu3kwyXoYJCvcCB6i");
        assert_eq!(
            hex::encode(s.get_public_key(&h).unwrap()),
            "02028a99826edc0c97d18e22b6932373d908d323aa7f92656a77ec26e8861699ef"
        );
        assert_eq!(
            hex::encode(s.get_script_hash(&h).unwrap()),
            "26eba6592ddfb6b04426048cd5891ff0e3fecba7"
        );
    }

    #[test]
    fn corrupted_wif_creates_no_wallet() {
        let s = signer();
        let wif = encode_wif(&[0x3c; 32]);
        let mut chars: Vec<char> = wif.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '2' { '3' } else { '2' };
        let corrupted: String = chars.into_iter().collect();

        let err = s.import_wif(&corrupted).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(s.list_wallets().is_empty());
    }

    #[test]
    fn wif_key_out_of_range_is_rejected() {
        let s = signer();
        let wif = encode_wif(&[0xff; 32]);
        assert!(matches!(s.import_wif(&wif), Err(SignerError::InvalidInput(_))));
        assert!(s.list_wallets().is_empty());
    }

    #[test]
    fn sign_transaction_requires_32_bytes() {
        let s = signer();
        let h = s.create_wallet("w").unwrap();
        let err = s.sign_transaction(&h, &[0u8; 31]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn sign_transaction_verifies_as_prehash() {
        let s = signer();
        let h = s.create_wallet("w").unwrap();
        let digest = Sha256::digest(b"tx bytes");
        let signature = s.sign_transaction(&h, &digest).unwrap();
        let public_key = s.get_public_key(&h).unwrap();

        assert_eq!(signature.len(), 64);
        assert!(NeoSigner::verify_transaction(&public_key, &digest, &signature).unwrap());
        // sign_data(m) and sign_transaction(SHA-256(m)) verify interchangeably.
        assert!(NeoSigner::verify_signature(&public_key, b"tx bytes", &signature).unwrap());
    }

    #[test]
    fn sign_data_round_trip_with_both_key_encodings() {
        let s = signer();
        let h = s.derive_wallet("m/1").unwrap();
        let signature = s.sign_data(&h, b"hello").unwrap();
        let compressed = s.get_public_key(&h).unwrap();
        let uncompressed = VerifyingKey::from_sec1_bytes(&compressed)
            .unwrap()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();

        assert!(NeoSigner::verify_signature(&compressed, b"hello", &signature).unwrap());
        assert!(NeoSigner::verify_signature(&uncompressed, b"hello", &signature).unwrap());
        assert!(!NeoSigner::verify_signature(&compressed, b"hellp", &signature).unwrap());

        let mut tampered = signature.clone();
        tampered[40] ^= 0x80;
        assert!(!NeoSigner::verify_signature(&compressed, b"hello", &tampered).unwrap());
    }

    #[test]
    fn verify_rejects_bad_lengths() {
        assert!(matches!(
            NeoSigner::verify_signature(&[2u8; 20], b"x", &[0u8; 64]),
            Err(SignerError::InvalidInput(_))
        ));
        let s = signer();
        let h = s.create_wallet("w").unwrap();
        let pk = s.get_public_key(&h).unwrap();
        assert!(matches!(
            NeoSigner::verify_signature(&pk, b"x", &[0u8; 63]),
            Err(SignerError::InvalidInput(_))
        ));
    }

    #[test]
    fn delete_and_list() {
        let s = signer();
        let a = s.create_wallet("a").unwrap();
        let b = s.create_wallet("b").unwrap();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(s.list_wallets(), expected);

        s.delete_wallet(&a).unwrap();
        assert_eq!(s.list_wallets(), vec![b]);
        assert_eq!(s.delete_wallet(&a).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(matches!(s.sign_data(&a, b"x"), Err(SignerError::NotFound(_))));
    }

    #[test]
    fn zero_removes_all_wallets() {
        let s = signer();
        let h = s.create_wallet("a").unwrap();
        s.derive_wallet("b").unwrap();
        s.zero();
        assert!(s.list_wallets().is_empty());
        assert!(s.get_address(&h).is_err());
    }
}
