// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Sealed Blob Storage
//!
//! Backing store for the vault. Only ciphertext produced by the enclave
//! runtime's `seal` ever reaches this layer; plaintext never does.
//!
//! ## Storage Layout
//!
//! ```text
//! /data/
//!   secrets/
//!     {namespace}/
//!       {name}.sealed    # nonce || AES-256-GCM ciphertext
//! ```
//!
//! Files are written `0600` and directories `0700`. Writes go to a temp file
//! and are renamed into place, so a crash never leaves a truncated blob.
//!
//! When `/data` is mounted as a Gramine encrypted filesystem the blobs are
//! encrypted twice; that is harmless and keeps the simulated runtime honest.

pub mod paths;
pub mod sealed_fs;

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::error::ErrorKind;

pub use paths::{validate_component, StoragePaths, DATA_ROOT};
pub use sealed_fs::FileSealedStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid {what} {value:?}: {reason}")]
    InvalidName {
        what: &'static str,
        value: String,
        reason: &'static str,
    },

    /// Gramine reports tampered encrypted files as I/O errors.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("storage I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        let msg = e.to_string();
        if msg.contains("Authentication") || msg.contains("integrity") || msg.contains("tamper") {
            StoreError::IntegrityViolation(msg)
        } else {
            StoreError::Io(e)
        }
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidName { .. } => ErrorKind::InvalidInput,
            StoreError::IntegrityViolation(_) => ErrorKind::SealingFailure,
            StoreError::Io(_) => ErrorKind::Transient,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for sealed blobs keyed by `(namespace, name)`.
pub trait SealedStore: Send + Sync {
    /// `Ok(None)` when nothing is stored under the key.
    fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Vec<u8>>>;

    fn put(&self, namespace: &str, name: &str, sealed: &[u8]) -> StoreResult<()>;

    /// Returns whether a blob was removed.
    fn delete(&self, namespace: &str, name: &str) -> StoreResult<bool>;

    /// Names stored in `namespace`, sorted.
    fn list(&self, namespace: &str) -> StoreResult<Vec<String>>;

    fn exists(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        Ok(self.get(namespace, name)?.is_some())
    }
}

/// Write `data` to `path` readable only by the owner, via temp file + rename.
///
/// The temp file is freshly created `0600` next to `path` under a unique
/// name, so the result is owner-only even when replacing a looser file.
/// Missing parent directories are created `0700`.
pub fn write_private_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            create_private_dir(parent)?;
            parent
        }
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

    let mut prefix = std::ffi::OsString::from(".");
    prefix.push(file_name);
    prefix.push(".");
    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}
