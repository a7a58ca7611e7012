// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Trust Bootstrap
//!
//! Establishes the instance's identity with the coordinator and receives its
//! secrets, environment, files and mutual-TLS material.
//!
//! ## Phases
//!
//! ```text
//! NotActivated ──activate()──▶ Activating ──▶ Activated
//!       ▲                          │
//!       └── exhausted / cancelled ─┤
//!                                  └── permanent error ──▶ Failed
//! ```
//!
//! `Activated` and `Failed` are terminal. Retry exhaustion, cancellation and
//! an exceeded deadline return to `NotActivated`, so the owner may try again.
//!
//! ## Attempt
//!
//! 1. Quote over `instance_type ":" instance_id` from the enclave runtime
//! 2. `POST /activate` with the quote and measurements
//! 3. On success: build mutual TLS, import secrets into the vault namespace
//!    `coordinator`, commit [`ActivationState`], write files (0600), export
//!    env, switch the coordinator client to mutual TLS
//!
//! Transient failures back off per [`RetryPolicy`]. Cancellation and the
//! deadline are checked before every attempt, raced against every attempt,
//! and raced against every backoff sleep.

mod coordinator;
mod heartbeat;
mod retry;

pub use coordinator::{
    coordinator_url, ActivationBundle, ActivationRequest, ActivationResponse, Coordinator,
    CoordinatorError, HeartbeatRequest, HttpCoordinator,
};
pub use heartbeat::HeartbeatStats;
pub use retry::{
    RetryPolicy, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES,
    DEFAULT_MULTIPLIER,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::enclave::{EnclaveRuntime, RuntimeError, REPORT_DATA_SIZE};
use crate::error::ErrorKind;
use crate::state::{ActivationState, SharedActivationState};
use crate::storage::write_private_file;
use crate::tls::{CertBundle, MutualTlsConfig, TlsError};
use crate::vault::{Vault, VaultError};
use heartbeat::HeartbeatLoop;

/// Vault namespace receiving the coordinator's secrets.
pub const COORDINATOR_NAMESPACE: &str = "coordinator";

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("instance already activated")]
    AlreadyActivated,

    #[error("activation already in progress")]
    InProgress,

    #[error("activation previously failed permanently")]
    PreviouslyFailed,

    #[error("instance is not activated")]
    NotActivated,

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid heartbeat interval")]
    InvalidInterval,

    #[error("activation cancelled")]
    Cancelled,

    #[error("activation deadline exceeded")]
    DeadlineExceeded,

    #[error("activation attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    #[error("activation failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: Box<ActivationError>,
    },

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("invalid TLS material: {0}")]
    Tls(#[from] TlsError),

    #[error("importing coordinator secrets: {0}")]
    Vault(#[from] VaultError),
}

impl ActivationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActivationError::AttemptTimeout(_) | ActivationError::Exhausted { .. } => {
                ErrorKind::Transient
            }
            ActivationError::AlreadyActivated
            | ActivationError::InProgress
            | ActivationError::PreviouslyFailed
            | ActivationError::NotActivated
            | ActivationError::Cancelled
            | ActivationError::DeadlineExceeded => ErrorKind::Permanent,
            ActivationError::InvalidIdentity(_) | ActivationError::InvalidInterval => {
                ErrorKind::InvalidInput
            }
            ActivationError::Coordinator(e) => e.kind(),
            ActivationError::Runtime(e) => e.kind(),
            ActivationError::Tls(e) => e.kind(),
            ActivationError::Vault(e) => e.kind(),
        }
    }

    /// Whether the phase should stay `Failed` after this error.
    fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ActivationError::Exhausted { .. }
                | ActivationError::Cancelled
                | ActivationError::DeadlineExceeded
        )
    }
}

/// Who this instance is. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnclaveIdentity {
    pub instance_type: String,
    pub instance_id: Uuid,
    pub coordinator_address: String,
}

impl EnclaveIdentity {
    /// The report data (`instance_type ":" instance_id`) must fit the
    /// 64-byte quote field.
    pub fn new(
        instance_type: impl Into<String>,
        instance_id: Uuid,
        coordinator_address: impl Into<String>,
    ) -> Result<Self, ActivationError> {
        let identity = Self {
            instance_type: instance_type.into(),
            instance_id,
            coordinator_address: coordinator_address.into(),
        };
        if identity.instance_type.trim().is_empty() {
            return Err(ActivationError::InvalidIdentity(
                "instance type must not be empty".to_string(),
            ));
        }
        if identity.report_data().len() > REPORT_DATA_SIZE {
            return Err(ActivationError::InvalidIdentity(format!(
                "instance type too long for {REPORT_DATA_SIZE}-byte report data"
            )));
        }
        Ok(identity)
    }

    pub fn report_data(&self) -> Vec<u8> {
        format!("{}:{}", self.instance_type, self.instance_id).into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPhase {
    NotActivated,
    Activating,
    Activated,
    Failed,
}

/// Operational snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub phase: ActivationPhase,
    pub instance_type: String,
    pub instance_id: Uuid,
    pub activated: bool,
    pub activated_at: Option<DateTime<Utc>>,
    /// Seconds since activation.
    pub uptime_secs: Option<u64>,
    pub activation_attempts: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_failed: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub simulation_mode: bool,
}

struct RunningHeartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Sets the final phase when an activation run ends, including when the
/// `activate` future is dropped mid-flight.
struct PhaseGuard<'a> {
    phase: &'a Mutex<ActivationPhase>,
    outcome: ActivationPhase,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = self.outcome;
    }
}

pub struct ActivationClient {
    identity: EnclaveIdentity,
    runtime: Arc<dyn EnclaveRuntime>,
    coordinator: Arc<dyn Coordinator>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    state: SharedActivationState,
    vault: Option<Arc<Vault>>,
    phase: Mutex<ActivationPhase>,
    tls: RwLock<Option<MutualTlsConfig>>,
    heartbeat: Mutex<Option<RunningHeartbeat>>,
    stats: Arc<HeartbeatStats>,
}

impl ActivationClient {
    pub fn new(
        identity: EnclaveIdentity,
        runtime: Arc<dyn EnclaveRuntime>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        Self {
            identity,
            runtime,
            coordinator,
            policy: RetryPolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            state: ActivationState::shared(),
            vault: None,
            phase: Mutex::new(ActivationPhase::NotActivated),
            tls: RwLock::new(None),
            heartbeat: Mutex::new(None),
            stats: Arc::new(HeartbeatStats::default()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Secrets received at activation are also stored in `vault`.
    pub fn with_vault(mut self, vault: Arc<Vault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn identity(&self) -> &EnclaveIdentity {
        &self.identity
    }

    pub fn state(&self) -> SharedActivationState {
        self.state.clone()
    }

    pub fn phase(&self) -> ActivationPhase {
        *self.lock_phase()
    }

    pub fn is_activated(&self) -> bool {
        self.phase() == ActivationPhase::Activated
    }

    /// Mutual-TLS configuration built from the activation bundle.
    pub fn tls_config(&self) -> Option<MutualTlsConfig> {
        self.tls.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn heartbeat_stats(&self) -> Arc<HeartbeatStats> {
        self.stats.clone()
    }

    pub async fn activate(&self, shutdown: &CancellationToken) -> Result<(), ActivationError> {
        let mut guard = {
            let mut phase = self.lock_phase();
            match *phase {
                ActivationPhase::Activated => return Err(ActivationError::AlreadyActivated),
                ActivationPhase::Activating => return Err(ActivationError::InProgress),
                ActivationPhase::Failed => return Err(ActivationError::PreviouslyFailed),
                ActivationPhase::NotActivated => *phase = ActivationPhase::Activating,
            }
            PhaseGuard {
                phase: &self.phase,
                outcome: ActivationPhase::NotActivated,
            }
        };

        let result = self.run(shutdown).await;
        guard.outcome = match &result {
            Ok(()) => ActivationPhase::Activated,
            Err(e) if e.is_terminal() => ActivationPhase::Failed,
            Err(_) => ActivationPhase::NotActivated,
        };
        if let Err(e) = &result {
            error!(
                instance_id = %self.identity.instance_id,
                error = %e,
                "Activation failed"
            );
        }
        result
    }

    async fn run(&self, shutdown: &CancellationToken) -> Result<(), ActivationError> {
        let deadline = self.policy.deadline.map(|d| Instant::now() + d);
        let max_attempts = self.policy.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if shutdown.is_cancelled() {
                return Err(ActivationError::Cancelled);
            }
            let budget = match deadline {
                Some(at) => {
                    let remaining = at.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ActivationError::DeadlineExceeded);
                    }
                    self.attempt_timeout.min(remaining)
                }
                None => self.attempt_timeout,
            };

            self.state.write().await.attempt_count += 1;
            info!(
                instance_id = %self.identity.instance_id,
                attempt,
                max_attempts,
                "Activation attempt"
            );

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ActivationError::Cancelled),
                result = tokio::time::timeout(budget, self.attempt()) => match result {
                    Ok(outcome) => outcome,
                    Err(_) if deadline.is_some_and(|at| Instant::now() >= at) => {
                        return Err(ActivationError::DeadlineExceeded);
                    }
                    Err(_) => Err(ActivationError::AttemptTimeout(budget)),
                },
            };

            let err = match outcome {
                Ok(bundle) => return self.commit(bundle).await,
                Err(e) => e,
            };

            if !err.kind().is_retryable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                return Err(ActivationError::Exhausted {
                    attempts: attempt,
                    last_error: Box::new(err),
                });
            }

            let delay = self.policy.backoff(attempt);
            if deadline.is_some_and(|at| Instant::now() + delay >= at) {
                return Err(ActivationError::DeadlineExceeded);
            }
            warn!(
                instance_id = %self.identity.instance_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Activation attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ActivationError::Cancelled),
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }

    async fn attempt(&self) -> Result<ActivationBundle, ActivationError> {
        let quote = self.runtime.generate_quote(&self.identity.report_data())?;
        let info = self.runtime.attestation_info()?;

        let request = ActivationRequest {
            instance_type: self.identity.instance_type.clone(),
            instance_id: self.identity.instance_id,
            quote: Base64::encode_string(&quote),
            unique_id: info.unique_id,
            signer_id: info.signer_id,
            product_id: info.product_id,
            security_version: info.security_version,
            simulation_mode: info.simulation_mode,
        };
        Ok(self.coordinator.activate(&request).await?)
    }

    async fn commit(&self, bundle: ActivationBundle) -> Result<(), ActivationError> {
        // Everything that can fail runs before the state is touched.
        let tls = bundle
            .tls
            .as_ref()
            .map(CertBundle::to_mutual_tls)
            .transpose()?;

        if let Some(vault) = &self.vault {
            seal_secrets(vault, &bundle.secrets)?;
        }

        let mut state = self.state.write().await;

        for (path, content) in &bundle.files {
            if let Err(e) = write_private_file(path, content) {
                warn!(path = %path.display(), error = %e, "Failed to write activation file");
            }
        }

        for (key, value) in &bundle.env {
            if is_valid_env(key, value) {
                std::env::set_var(key, value);
            } else {
                warn!(key = %key.escape_debug(), "Skipping invalid environment entry");
            }
        }

        state.activated = true;
        state.activated_at = Some(Utc::now());
        state.secrets = bundle.secrets;
        state.env = bundle.env;
        state.files = bundle.files;
        state.tls_material = bundle.tls;

        info!(
            instance_id = %self.identity.instance_id,
            attempts = state.attempt_count,
            secrets = state.secrets.len(),
            files = state.files.len(),
            "Instance activated"
        );
        drop(state);

        if let Some(tls) = tls {
            if let Err(e) = self.coordinator.install_tls(&tls) {
                warn!(error = %e, "Coordinator client kept its pre-activation TLS config");
            }
            *self.tls.write().unwrap_or_else(|e| e.into_inner()) = Some(tls);
        }
        Ok(())
    }

    /// Start the heartbeat loop. Returns `false` if it is already running.
    pub fn start_heartbeat(
        &self,
        interval: Duration,
        shutdown: &CancellationToken,
    ) -> Result<bool, ActivationError> {
        if interval.is_zero() {
            return Err(ActivationError::InvalidInterval);
        }
        if !self.is_activated() {
            return Err(ActivationError::NotActivated);
        }

        let mut running = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Ok(false);
        }

        let token = shutdown.child_token();
        let heartbeat = HeartbeatLoop {
            coordinator: self.coordinator.clone(),
            identity: self.identity.clone(),
            interval,
            stats: self.stats.clone(),
        };
        let handle = tokio::spawn(heartbeat.run(token.clone()));
        *running = Some(RunningHeartbeat { token, handle });
        Ok(true)
    }

    /// Stop the heartbeat loop and wait for it to exit. No-op when stopped.
    pub async fn stop_heartbeat(&self) {
        let running = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(running) = running {
            running.token.cancel();
            if let Err(e) = running.handle.await {
                warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub async fn health(&self) -> Health {
        let phase = self.phase();
        let state = self.state.read().await;
        let uptime_secs = state
            .activated_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64);

        Health {
            status: match phase {
                ActivationPhase::Activated => "healthy",
                ActivationPhase::Activating => "activating",
                ActivationPhase::NotActivated => "not_activated",
                ActivationPhase::Failed => "failed",
            },
            phase,
            instance_type: self.identity.instance_type.clone(),
            instance_id: self.identity.instance_id,
            activated: state.activated,
            activated_at: state.activated_at,
            uptime_secs,
            activation_attempts: state.attempt_count,
            heartbeats_sent: self.stats.sent(),
            heartbeats_failed: self.stats.failed(),
            last_heartbeat: self.stats.last_success(),
            simulation_mode: self.runtime.mode() == crate::enclave::EnclaveMode::Simulation,
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, ActivationPhase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Seal every coordinator secret or none of them. Entries written before a
/// failure are removed again.
fn seal_secrets(
    vault: &Vault,
    secrets: &HashMap<String, Zeroizing<Vec<u8>>>,
) -> Result<(), VaultError> {
    let mut sealed: Vec<&str> = Vec::with_capacity(secrets.len());
    for (name, value) in secrets {
        if let Err(e) = vault.store(COORDINATOR_NAMESPACE, name, value) {
            for done in sealed {
                if let Err(cleanup) = vault.delete(COORDINATOR_NAMESPACE, done) {
                    warn!(name = done, error = %cleanup, "Failed to roll back coordinator secret");
                }
            }
            return Err(e);
        }
        sealed.push(name);
    }
    Ok(())
}

fn is_valid_env(key: &str, value: &str) -> bool {
    !key.is_empty() && !key.contains(['=', '\0']) && !value.contains('\0')
}
