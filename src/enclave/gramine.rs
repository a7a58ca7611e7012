// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Gramine runtime over the `/dev/attestation` pseudo-filesystem.
//!
//! ## Attestation Files
//!
//! | File | Access | Purpose |
//! |------|--------|---------|
//! | `my_target_info` | read | Own target info, fed back to get a local report |
//! | `target_info` | write | Target for the next `report` read |
//! | `user_report_data` | write | 64 bytes bound into the next report/quote |
//! | `report` | read | SGX report (432 bytes) |
//! | `quote` | read | DCAP quote over the last `user_report_data` |
//! | `keys/_sgx_mrsigner` | read | 16-byte MRSIGNER sealing key |
//!
//! Writes to `user_report_data` followed by reads of `report`/`quote` are not
//! atomic, so every attestation round trip holds one mutex.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::simulation::os_random;
use super::{
    pad_report_data, AttestationInfo, EnclaveMode, EnclaveRuntime, RuntimeError, SealingCipher,
    SecretBuffer, SEALING_KEY_SIZE,
};

/// Mount point of Gramine's attestation interface.
pub const DEFAULT_ATTESTATION_DIR: &str = "/dev/attestation";

const SEALING_KEY_LABEL: &[u8] = b"service-layer/sealing/v1";

// SGX report body offsets.
const REPORT_SIZE: usize = 432;
const MR_ENCLAVE: std::ops::Range<usize> = 64..96;
const MR_SIGNER: std::ops::Range<usize> = 128..160;
const ISV_PROD_ID: usize = 256;
const ISV_SVN: usize = 258;

pub struct GramineRuntime {
    dir: PathBuf,
    cipher: SealingCipher,
    io_lock: Mutex<()>,
}

impl GramineRuntime {
    /// Whether `dir` looks like a Gramine attestation mount.
    pub fn is_available(dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        dir.join("quote").exists() && dir.join("user_report_data").exists()
    }

    pub fn new(dir: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let dir = dir.as_ref().to_path_buf();
        if !Self::is_available(&dir) {
            return Err(RuntimeError::NotReady(format!(
                "{} is not a Gramine attestation interface",
                dir.display()
            )));
        }

        let mrsigner_key = Zeroizing::new(fs::read(dir.join("keys").join("_sgx_mrsigner"))?);
        if mrsigner_key.is_empty() {
            return Err(RuntimeError::NotReady("empty MRSIGNER key".to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(SEALING_KEY_LABEL);
        hasher.update(mrsigner_key.as_slice());
        let mut key = Zeroizing::new([0u8; SEALING_KEY_SIZE]);
        key.copy_from_slice(&hasher.finalize());

        info!(dir = %dir.display(), "Gramine enclave runtime initialized");

        Ok(Self {
            dir,
            cipher: SealingCipher::new(&key),
            io_lock: Mutex::new(()),
        })
    }

    fn read_report(&self) -> Result<Vec<u8>, RuntimeError> {
        let _guard = self
            .io_lock
            .lock()
            .map_err(|_| RuntimeError::Attestation("attestation lock poisoned".to_string()))?;

        let target_info = fs::read(self.dir.join("my_target_info"))?;
        fs::write(self.dir.join("target_info"), &target_info)?;
        fs::write(self.dir.join("user_report_data"), [0u8; super::REPORT_DATA_SIZE])?;
        let report = fs::read(self.dir.join("report"))?;

        if report.len() < REPORT_SIZE {
            return Err(RuntimeError::Attestation(format!(
                "report is {} bytes, expected {REPORT_SIZE}",
                report.len()
            )));
        }
        Ok(report)
    }
}

impl EnclaveRuntime for GramineRuntime {
    fn mode(&self) -> EnclaveMode {
        EnclaveMode::Hardware
    }

    fn generate_random(&self, len: usize) -> Result<SecretBuffer, RuntimeError> {
        // Gramine services getrandom from RDRAND inside the enclave.
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

        let _guard = self
            .io_lock
            .lock()
            .map_err(|_| RuntimeError::Attestation("attestation lock poisoned".to_string()))?;

        fs::write(self.dir.join("user_report_data"), report_data)?;
        let quote = fs::read(self.dir.join("quote"))?;
        if quote.is_empty() {
            return Err(RuntimeError::Attestation("empty quote".to_string()));
        }

        debug!(quote_len = quote.len(), "Generated DCAP quote");
        Ok(quote)
    }

    fn attestation_info(&self) -> Result<AttestationInfo, RuntimeError> {
        let report = self.read_report()?;
        Ok(AttestationInfo {
            unique_id: hex::encode(&report[MR_ENCLAVE]),
            signer_id: hex::encode(&report[MR_SIGNER]),
            product_id: u16::from_le_bytes([report[ISV_PROD_ID], report[ISV_PROD_ID + 1]]),
            security_version: u16::from_le_bytes([report[ISV_SVN], report[ISV_SVN + 1]]),
            simulation_mode: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Lay out a fake attestation directory with a synthetic report.
    fn fake_attestation_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("keys")).unwrap();
        fs::write(root.join("keys").join("_sgx_mrsigner"), [0x42u8; 16]).unwrap();
        fs::write(root.join("my_target_info"), [0x11u8; 512]).unwrap();
        fs::write(root.join("user_report_data"), [0u8; 64]).unwrap();
        fs::write(root.join("quote"), b"dcap-quote-bytes").unwrap();

        let mut report = vec![0u8; REPORT_SIZE];
        report[MR_ENCLAVE].fill(0xaa);
        report[MR_SIGNER].fill(0xbb);
        report[ISV_PROD_ID..ISV_PROD_ID + 2].copy_from_slice(&9u16.to_le_bytes());
        report[ISV_SVN..ISV_SVN + 2].copy_from_slice(&4u16.to_le_bytes());
        fs::write(root.join("report"), report).unwrap();
        dir
    }

    #[test]
    fn missing_interface_is_not_ready() {
        let dir = TempDir::new().unwrap();
        assert!(!GramineRuntime::is_available(dir.path()));
        assert!(matches!(
            GramineRuntime::new(dir.path()),
            Err(RuntimeError::NotReady(_))
        ));
    }

    #[test]
    fn parses_measurements_from_report() {
        let dir = fake_attestation_dir();
        let rt = GramineRuntime::new(dir.path()).unwrap();
        let info = rt.attestation_info().unwrap();

        assert_eq!(info.unique_id, "aa".repeat(32));
        assert_eq!(info.signer_id, "bb".repeat(32));
        assert_eq!(info.product_id, 9);
        assert_eq!(info.security_version, 4);
        assert!(!info.simulation_mode);
        assert_eq!(rt.mode(), EnclaveMode::Hardware);

        let target = fs::read(dir.path().join("target_info")).unwrap();
        assert_eq!(target, vec![0x11u8; 512]);
    }

    #[test]
    fn quote_writes_padded_report_data() {
        let dir = fake_attestation_dir();
        let rt = GramineRuntime::new(dir.path()).unwrap();
        let quote = rt.generate_quote(b"svc:1").unwrap();

        assert_eq!(quote, b"dcap-quote-bytes");
        let written = fs::read(dir.path().join("user_report_data")).unwrap();
        assert_eq!(written.len(), 64);
        assert_eq!(&written[..5], b"svc:1");
    }

    #[test]
    fn sealing_key_is_bound_to_mrsigner() {
        let dir = fake_attestation_dir();
        let sealed = GramineRuntime::new(dir.path()).unwrap().seal(b"v").unwrap();

        let same = GramineRuntime::new(dir.path()).unwrap();
        assert_eq!(same.unseal(&sealed).unwrap().as_bytes(), b"v");

        fs::write(dir.path().join("keys").join("_sgx_mrsigner"), [0x43u8; 16]).unwrap();
        let other = GramineRuntime::new(dir.path()).unwrap();
        assert!(other.unseal(&sealed).is_err());
    }

    #[test]
    fn short_report_is_rejected() {
        let dir = fake_attestation_dir();
        fs::write(dir.path().join("report"), [0u8; 10]).unwrap();
        let rt = GramineRuntime::new(dir.path()).unwrap();
        assert!(matches!(
            rt.attestation_info(),
            Err(RuntimeError::Attestation(_))
        ));
    }
}
