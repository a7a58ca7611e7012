// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path layout for sealed secret storage.

use std::path::{Path, PathBuf};

use super::StoreError;

/// Base directory for persistent storage inside the enclave.
/// Should be mounted as `type = "encrypted"` in the Gramine manifest.
pub const DATA_ROOT: &str = "/data";

/// File extension of a sealed blob.
pub const SEALED_EXTENSION: &str = "sealed";

#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DATA_ROOT)
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory containing every namespace.
    pub fn secrets_dir(&self) -> PathBuf {
        self.root.join("secrets")
    }

    pub fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StoreError> {
        validate_component("namespace", namespace)?;
        Ok(self.secrets_dir().join(namespace))
    }

    /// `{root}/secrets/{namespace}/{name}.sealed`
    pub fn sealed_blob(&self, namespace: &str, name: &str) -> Result<PathBuf, StoreError> {
        validate_component("name", name)?;
        Ok(self
            .namespace_dir(namespace)?
            .join(format!("{name}.{SEALED_EXTENSION}")))
    }
}

/// Reject components that could escape their directory.
pub fn validate_component(what: &'static str, value: &str) -> Result<(), StoreError> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value.contains('/') || value.contains('\\') {
        Some("must not contain path separators")
    } else if value == "." || value.contains("..") {
        Some("must not contain '..'")
    } else if value.contains('\0') {
        Some("must not contain NUL")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidName {
            what,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
