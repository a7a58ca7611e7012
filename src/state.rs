// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Activation state shared between the activation client and its readers.
//!
//! The state moves from not-activated to activated exactly once. Only the
//! activation client writes it, under the write lock; everything else reads.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::tls::CertBundle;

pub type SharedActivationState = Arc<RwLock<ActivationState>>;

#[derive(Default)]
pub struct ActivationState {
    pub activated: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub attempt_count: u64,
    pub secrets: HashMap<String, Zeroizing<Vec<u8>>>,
    pub env: HashMap<String, String>,
    pub files: HashMap<PathBuf, Vec<u8>>,
    pub tls_material: Option<CertBundle>,
}

impl ActivationState {
    pub fn shared() -> SharedActivationState {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Names of the secrets delivered at activation, sorted.
    pub fn secret_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.secrets.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationState")
            .field("activated", &self.activated)
            .field("activated_at", &self.activated_at)
            .field("attempt_count", &self.attempt_count)
            .field("secrets", &self.secret_names())
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("tls_material", &self.tls_material)
            .finish()
    }
}
