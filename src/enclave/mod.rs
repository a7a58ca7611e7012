// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Hardware Runtime Adapter
//!
//! Thin capability surface over the TEE runtime. Everything above this module
//! (vault, key manager, activation) only sees [`EnclaveRuntime`].
//!
//! ## Runtimes
//!
//! | Runtime | When | Sealing key | Quote |
//! |---------|------|-------------|-------|
//! | [`GramineRuntime`] | Inside an SGX enclave under Gramine | Derived from `/dev/attestation/keys/_sgx_mrsigner` | DCAP quote from `/dev/attestation/quote` |
//! | [`SimulatedRuntime`] | Development and tests | Random, optionally persisted to a file | `SIM_QUOTE_V1` blob authenticated with HMAC-SHA256 |
//!
//! Both runtimes seal with AES-256-GCM ([`SealingCipher`]); only the origin of
//! the key differs.
//!
//! ## Plaintext Handling
//!
//! Every API that hands out plaintext returns a [`SecretBuffer`], which scrubs
//! itself on drop. Random bytes are treated as secret for the same reason: they
//! usually become seeds or private keys.

mod buffer;
mod gramine;
mod sealing;
mod simulation;

use std::io;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

pub use buffer::SecretBuffer;
pub use gramine::{GramineRuntime, DEFAULT_ATTESTATION_DIR};
pub use sealing::{SealingCipher, NONCE_SIZE, SEALING_KEY_SIZE, TAG_SIZE};
pub use simulation::{SimulatedRuntime, SimulationConfig, SIM_QUOTE_HEADER};

#[cfg(test)]
pub(crate) use buffer::scrub_probe;

/// Size of the user report data embedded in an attestation report.
pub const REPORT_DATA_SIZE: usize = 64;

/// Which runtime backs the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnclaveMode {
    Simulation,
    Hardware,
}

/// Measurement metadata reported alongside a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationInfo {
    /// MRENCLAVE (hex).
    pub unique_id: String,
    /// MRSIGNER (hex).
    pub signer_id: String,
    pub product_id: u16,
    pub security_version: u16,
    pub simulation_mode: bool,
}

/// Errors raised by a hardware runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("enclave runtime not ready: {0}")]
    NotReady(String),

    #[error("seal failed: {0}")]
    Seal(String),

    #[error("unseal failed: {0}")]
    Unseal(String),

    #[error("secure random generation failed: {0}")]
    Random(String),

    #[error("attestation failed: {0}")]
    Attestation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("attestation device I/O: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::NotReady(_)
            | RuntimeError::Seal(_)
            | RuntimeError::Unseal(_)
            | RuntimeError::Random(_) => ErrorKind::SealingFailure,
            RuntimeError::Attestation(_) | RuntimeError::Io(_) => ErrorKind::Transient,
            RuntimeError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}

/// Capabilities the trust core needs from the TEE.
pub trait EnclaveRuntime: Send + Sync {
    fn mode(&self) -> EnclaveMode;

    /// `len` bytes from the runtime's secure randomness source.
    fn generate_random(&self, len: usize) -> Result<SecretBuffer, RuntimeError>;

    /// Encrypt `plaintext` with the enclave-bound sealing key.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, RuntimeError>;

    /// Decrypt a blob produced by [`seal`](Self::seal).
    fn unseal(&self, sealed: &[u8]) -> Result<SecretBuffer, RuntimeError>;

    /// Produce an attestation quote binding `report_data` (at most
    /// [`REPORT_DATA_SIZE`] bytes, zero-padded) to the enclave identity.
    fn generate_quote(&self, report_data: &[u8]) -> Result<Vec<u8>, RuntimeError>;

    fn attestation_info(&self) -> Result<AttestationInfo, RuntimeError>;
}

/// Zero-pad `data` to a full report data block.
pub(crate) fn pad_report_data(data: &[u8]) -> Result<[u8; REPORT_DATA_SIZE], RuntimeError> {
    if data.len() > REPORT_DATA_SIZE {
        return Err(RuntimeError::InvalidInput(format!(
            "report data is {} bytes, maximum is {REPORT_DATA_SIZE}",
            data.len()
        )));
    }
    let mut block = [0u8; REPORT_DATA_SIZE];
    block[..data.len()].copy_from_slice(data);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_data_is_zero_padded() {
        let block = pad_report_data(b"neo-oracle:1234").unwrap();
        assert_eq!(&block[..15], b"neo-oracle:1234");
        assert!(block[15..].iter().all(|b| *b == 0));
    }

    #[test]
    fn oversized_report_data_is_invalid_input() {
        let err = pad_report_data(&[1u8; REPORT_DATA_SIZE + 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn seal_failures_map_to_sealing_failure() {
        assert_eq!(RuntimeError::Seal("x".into()).kind(), ErrorKind::SealingFailure);
        assert_eq!(RuntimeError::Unseal("x".into()).kind(), ErrorKind::SealingFailure);
        assert_eq!(RuntimeError::Attestation("x".into()).kind(), ErrorKind::Transient);
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&EnclaveMode::Simulation).unwrap(),
            r#""simulation""#
        );
    }
}
