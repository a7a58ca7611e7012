// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Secure Vault
//!
//! Secrets are kept sealed. Plaintext exists only inside the scope passed to
//! [`Vault::use_secret`], [`Vault::use_multiple`] or
//! [`Vault::use_secret_async`], in a [`SecretBuffer`] that is zeroed when the
//! scope exits, however it exits.
//!
//! ## Locking
//!
//! | Operation | Lock |
//! |-----------|------|
//! | `use_*` (cache hit), `list`, `exists` | shared |
//! | `use_*` (cache miss: load, unseal, insert) | exclusive, population only |
//! | `store`, `delete` | exclusive |
//!
//! The unseal-use-zero cycle itself runs outside the lock; each caller gets its
//! own plaintext copy.
//!
//! ## Failure Behavior
//!
//! - A failed `store` leaves the previous sealed value in place.
//! - A failed unseal on a cache miss leaves the cache untouched.
//! - Scope errors are returned as-is; plaintext is zeroed before they reach
//!   the caller.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::enclave::{EnclaveRuntime, RuntimeError, SecretBuffer};
use crate::error::ErrorKind;
use crate::storage::{validate_component, SealedStore, StoreError};

/// Boxed future returned by an async vault scope.
pub type ScopeFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("secret not found: {namespace}/{name}")]
    NotFound { namespace: String, name: String },

    #[error("failed to seal secret: {0}")]
    Seal(#[source] RuntimeError),

    #[error("failed to unseal secret {namespace}/{name}: {source}")]
    Unseal {
        namespace: String,
        name: String,
        #[source]
        source: RuntimeError,
    },

    #[error("sealed store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::NotFound { .. } => ErrorKind::NotFound,
            VaultError::Seal(_) | VaultError::Unseal { .. } => ErrorKind::SealingFailure,
            VaultError::Store(e) => e.kind(),
            VaultError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}

/// Reference to a secret for [`Vault::use_multiple`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
    /// Key in the scope's map. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl SecretRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn effective_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

type SecretKey = (String, String);

pub struct Vault {
    runtime: Arc<dyn EnclaveRuntime>,
    store: Option<Arc<dyn SealedStore>>,
    /// Sealed blobs only.
    cache: RwLock<HashMap<SecretKey, Vec<u8>>>,
}

impl Vault {
    /// Cache-only vault; secrets are lost on restart.
    pub fn new(runtime: Arc<dyn EnclaveRuntime>) -> Self {
        Self {
            runtime,
            store: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Vault persisting sealed blobs to `store`.
    pub fn with_store(runtime: Arc<dyn EnclaveRuntime>, store: Arc<dyn SealedStore>) -> Self {
        Self {
            runtime,
            store: Some(store),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Seal `plaintext` and persist it under `(namespace, name)`.
    pub fn store(&self, namespace: &str, name: &str, plaintext: &[u8]) -> Result<(), VaultError> {
        validate_key(namespace, name)?;

        let sealed = self.runtime.seal(plaintext).map_err(|e| {
            warn!(namespace, name, error = %e, "Failed to seal secret");
            VaultError::Seal(e)
        })?;

        let mut cache = self.write_cache();
        if let Some(store) = &self.store {
            store.put(namespace, name, &sealed)?;
        }
        cache.insert((namespace.to_string(), name.to_string()), sealed);

        debug!(namespace, name, "Stored secret");
        Ok(())
    }

    /// Run `scope` with the plaintext of `(namespace, name)`.
    ///
    /// The plaintext buffer is zeroed before this returns, including when
    /// `scope` errors or panics.
    pub fn use_secret<T, E, F>(&self, namespace: &str, name: &str, scope: F) -> Result<T, E>
    where
        F: FnOnce(&[u8]) -> Result<T, E>,
        E: From<VaultError>,
    {
        let plaintext = self.unseal_secret(namespace, name)?;
        scope(&plaintext)
    }

    /// Async variant of [`use_secret`](Self::use_secret).
    ///
    /// The plaintext is owned by the returned future, so it is also zeroed if
    /// the caller drops the future before it completes.
    pub async fn use_secret_async<T, E, F>(
        &self,
        namespace: &str,
        name: &str,
        scope: F,
    ) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a [u8]) -> ScopeFuture<'a, Result<T, E>>,
        E: From<VaultError>,
    {
        let plaintext = self.unseal_secret(namespace, name)?;
        scope(&plaintext).await
    }

    /// Resolve every reference, then run `scope` once with `alias -> plaintext`.
    ///
    /// Buffers resolved before a later failure are zeroed as well.
    pub fn use_multiple<T, E, F>(&self, refs: &[SecretRef], scope: F) -> Result<T, E>
    where
        F: FnOnce(&HashMap<&str, &[u8]>) -> Result<T, E>,
        E: From<VaultError>,
    {
        let mut seen = HashSet::with_capacity(refs.len());
        for r in refs {
            if !seen.insert(r.effective_alias()) {
                return Err(VaultError::InvalidInput(format!(
                    "duplicate secret alias {:?}",
                    r.effective_alias()
                ))
                .into());
            }
        }

        let mut buffers: Vec<(&str, SecretBuffer)> = Vec::with_capacity(refs.len());
        for r in refs {
            buffers.push((r.effective_alias(), self.unseal_secret(&r.namespace, &r.name)?));
        }

        let view: HashMap<&str, &[u8]> = buffers
            .iter()
            .map(|(alias, buf)| (*alias, buf.as_bytes()))
            .collect();
        scope(&view)
    }

    /// Remove a secret. Returns whether it existed.
    pub fn delete(&self, namespace: &str, name: &str) -> Result<bool, VaultError> {
        validate_key(namespace, name)?;

        let mut cache = self.write_cache();
        let persisted = match &self.store {
            Some(store) => store.delete(namespace, name)?,
            None => false,
        };
        let cached = cache
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some();

        if persisted || cached {
            debug!(namespace, name, "Deleted secret");
        }
        Ok(persisted || cached)
    }

    /// Sorted secret names in `namespace`.
    pub fn list(&self, namespace: &str) -> Result<Vec<String>, VaultError> {
        validate_component("namespace", namespace)?;

        let cache = self.read_cache();
        if let Some(store) = &self.store {
            return Ok(store.list(namespace)?);
        }

        let mut names: Vec<String> = cache
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, namespace: &str, name: &str) -> Result<bool, VaultError> {
        validate_key(namespace, name)?;

        let cache = self.read_cache();
        if cache.contains_key(&(namespace.to_string(), name.to_string())) {
            return Ok(true);
        }
        match &self.store {
            Some(store) => Ok(store.exists(namespace, name)?),
            None => Ok(false),
        }
    }

    fn unseal_secret(&self, namespace: &str, name: &str) -> Result<SecretBuffer, VaultError> {
        validate_key(namespace, name)?;
        let key = (namespace.to_string(), name.to_string());

        {
            let cache = self.read_cache();
            if let Some(sealed) = cache.get(&key) {
                return self.unseal_blob(namespace, name, sealed);
            }
        }

        let Some(store) = &self.store else {
            return Err(not_found(namespace, name));
        };

        let mut cache = self.write_cache();
        // Another caller may have populated the entry while we waited.
        if let Some(sealed) = cache.get(&key) {
            return self.unseal_blob(namespace, name, sealed);
        }

        let sealed = store
            .get(namespace, name)?
            .ok_or_else(|| not_found(namespace, name))?;
        let plaintext = self.unseal_blob(namespace, name, &sealed)?;
        cache.insert(key, sealed);
        Ok(plaintext)
    }

    fn unseal_blob(
        &self,
        namespace: &str,
        name: &str,
        sealed: &[u8],
    ) -> Result<SecretBuffer, VaultError> {
        self.runtime.unseal(sealed).map_err(|source| {
            warn!(namespace, name, error = %source, "Failed to unseal secret");
            VaultError::Unseal {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            }
        })
    }

    // A panicking scope never holds a cache lock, so poisoning can only come
    // from a panic inside this module; the map is still consistent then.
    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<SecretKey, Vec<u8>>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<SecretKey, Vec<u8>>> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_key(namespace: &str, name: &str) -> Result<(), VaultError> {
    validate_component("namespace", namespace)?;
    validate_component("name", name)?;
    Ok(())
}

fn not_found(namespace: &str, name: &str) -> VaultError {
    VaultError::NotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}
