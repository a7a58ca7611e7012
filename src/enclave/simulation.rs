// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Simulated runtime for development and tests.
//!
//! Measurements are derived from the executable path and hostname so they are
//! stable across restarts on the same machine. Quotes are self-describing
//! blobs authenticated with the sealing key:
//!
//! ```text
//! "SIM_QUOTE_V1" | unique_id[32] | signer_id[32] | product_id u16 LE |
//! security_version u16 LE | report_data[64] | timestamp i64 LE | hmac[32]
//! ```

use std::path::PathBuf;

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::{
    pad_report_data, AttestationInfo, EnclaveMode, EnclaveRuntime, RuntimeError, SealingCipher,
    SecretBuffer, REPORT_DATA_SIZE, SEALING_KEY_SIZE,
};
use crate::storage::write_private_file;

/// Magic prefix of a simulated quote.
pub const SIM_QUOTE_HEADER: &[u8; 12] = b"SIM_QUOTE_V1";

const MAC_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    /// Where to load/persist the sealing key. `None` keeps it in memory only.
    pub sealing_key_path: Option<PathBuf>,
    pub product_id: u16,
    pub security_version: u16,
}

pub struct SimulatedRuntime {
    cipher: SealingCipher,
    mac_key: Zeroizing<[u8; SEALING_KEY_SIZE]>,
    unique_id: [u8; 32],
    signer_id: [u8; 32],
    product_id: u16,
    security_version: u16,
}

impl SimulatedRuntime {
    pub fn new(config: SimulationConfig) -> Result<Self, RuntimeError> {
        let key = load_or_generate_key(config.sealing_key_path.as_ref())?;
        let (unique_id, signer_id) = simulated_identity();

        info!(
            unique_id = %hex::encode(unique_id),
            signer_id = %hex::encode(signer_id),
            persisted_key = config.sealing_key_path.is_some(),
            "Simulated enclave runtime initialized"
        );

        Ok(Self {
            cipher: SealingCipher::new(&key),
            mac_key: key,
            unique_id,
            signer_id,
            product_id: config.product_id,
            security_version: config.security_version,
        })
    }

    /// Runtime with an in-memory sealing key.
    pub fn ephemeral() -> Result<Self, RuntimeError> {
        Self::new(SimulationConfig::default())
    }

    /// Check the MAC of a quote produced by this runtime and return its
    /// embedded report data.
    pub fn verify_quote(&self, quote: &[u8]) -> Option<[u8; REPORT_DATA_SIZE]> {
        let body_len = quote.len().checked_sub(MAC_SIZE)?;
        if body_len != quote_body_len() || !quote.starts_with(SIM_QUOTE_HEADER) {
            return None;
        }
        let (body, tag) = quote.split_at(body_len);
        let mut mac = HmacSha256::new_from_slice(self.mac_key.as_slice()).ok()?;
        mac.update(body);
        mac.verify_slice(tag).ok()?;

        let offset = SIM_QUOTE_HEADER.len() + 32 + 32 + 2 + 2;
        let mut data = [0u8; REPORT_DATA_SIZE];
        data.copy_from_slice(&body[offset..offset + REPORT_DATA_SIZE]);
        Some(data)
    }
}

impl EnclaveRuntime for SimulatedRuntime {
    fn mode(&self) -> EnclaveMode {
        EnclaveMode::Simulation
    }

    fn generate_random(&self, len: usize) -> Result<SecretBuffer, RuntimeError> {
        os_random(len)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        self.cipher.seal(plaintext)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<SecretBuffer, RuntimeError> {
        self.cipher.unseal(sealed)
    }

    fn generate_quote(&self, report_data: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let report_data = pad_report_data(report_data)?;

        let mut quote = Vec::with_capacity(quote_body_len() + MAC_SIZE);
        quote.extend_from_slice(SIM_QUOTE_HEADER);
        quote.extend_from_slice(&self.unique_id);
        quote.extend_from_slice(&self.signer_id);
        quote.extend_from_slice(&self.product_id.to_le_bytes());
        quote.extend_from_slice(&self.security_version.to_le_bytes());
        quote.extend_from_slice(&report_data);
        quote.extend_from_slice(&chrono::Utc::now().timestamp().to_le_bytes());

        let mut mac = HmacSha256::new_from_slice(self.mac_key.as_slice())
            .map_err(|e| RuntimeError::Attestation(e.to_string()))?;
        mac.update(&quote);
        quote.extend_from_slice(&mac.finalize().into_bytes());
        Ok(quote)
    }

    fn attestation_info(&self) -> Result<AttestationInfo, RuntimeError> {
        Ok(AttestationInfo {
            unique_id: hex::encode(self.unique_id),
            signer_id: hex::encode(self.signer_id),
            product_id: self.product_id,
            security_version: self.security_version,
            simulation_mode: true,
        })
    }
}

fn quote_body_len() -> usize {
    SIM_QUOTE_HEADER.len() + 32 + 32 + 2 + 2 + REPORT_DATA_SIZE + 8
}

/// Fill a buffer from the OS CSPRNG.
pub(crate) fn os_random(len: usize) -> Result<SecretBuffer, RuntimeError> {
    let mut buf = SecretBuffer::zeroed(len);
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| RuntimeError::Random(e.to_string()))?;
    Ok(buf)
}

fn load_or_generate_key(
    path: Option<&PathBuf>,
) -> Result<Zeroizing<[u8; SEALING_KEY_SIZE]>, RuntimeError> {
    let mut key = Zeroizing::new([0u8; SEALING_KEY_SIZE]);

    if let Some(path) = path {
        if let Ok(bytes) = std::fs::read(path) {
            let bytes = Zeroizing::new(bytes);
            if bytes.len() != SEALING_KEY_SIZE {
                return Err(RuntimeError::NotReady(format!(
                    "sealing key at {} is {} bytes, expected {SEALING_KEY_SIZE}",
                    path.display(),
                    bytes.len()
                )));
            }
            key.copy_from_slice(&bytes);
            return Ok(key);
        }
    }

    OsRng
        .try_fill_bytes(key.as_mut_slice())
        .map_err(|e| RuntimeError::Random(e.to_string()))?;

    if let Some(path) = path {
        // Secrets sealed under a lost key are unrecoverable, but the process
        // can still run with an in-memory key.
        if let Err(e) = write_private_file(path, key.as_slice()) {
            warn!(path = %path.display(), error = %e, "Failed to persist simulation sealing key");
        }
    }

    Ok(key)
}

fn simulated_identity() -> ([u8; 32], [u8; 32]) {
    let exe = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let arch = std::env::consts::ARCH;

    let unique = Sha256::digest(format!("{exe}:{host}:{arch}:unique").as_bytes());
    let signer = Sha256::digest(format!("{exe}:{host}:{arch}:signer").as_bytes());
    (unique.into(), signer.into())
}
