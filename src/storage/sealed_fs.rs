// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! File-backed [`SealedStore`].

use std::fs::{self, File};
use std::io::{self, Read};

use tracing::debug;

use super::paths::SEALED_EXTENSION;
use super::{write_private_file, SealedStore, StoragePaths, StoreResult};

#[derive(Debug, Clone)]
pub struct FileSealedStore {
    paths: StoragePaths,
}

impl FileSealedStore {
    /// Open the store, creating `{root}/secrets` if needed.
    pub fn open(paths: StoragePaths) -> StoreResult<Self> {
        super::create_private_dir(&paths.secrets_dir())?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }
}

impl SealedStore for FileSealedStore {
    fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.paths.sealed_blob(namespace, name)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    fn put(&self, namespace: &str, name: &str, sealed: &[u8]) -> StoreResult<()> {
        let path = self.paths.sealed_blob(namespace, name)?;
        write_private_file(&path, sealed)?;
        debug!(namespace, name, bytes = sealed.len(), "Persisted sealed blob");
        Ok(())
    }

    fn delete(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        let path = self.paths.sealed_blob(namespace, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, namespace: &str) -> StoreResult<Vec<String>> {
        let dir = self.paths.namespace_dir(namespace)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == SEALED_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Uses `File::open()` instead of `Path::exists()` because Gramine's
    /// encrypted filesystem can fail `stat()` on encrypted files while
    /// `open()` works.
    fn exists(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        let path = self.paths.sealed_blob(namespace, name)?;
        Ok(File::open(path).is_ok())
    }
}
