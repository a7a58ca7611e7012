// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Coordinator Heartbeat
//!
//! Background task that pings the coordinator every `interval` once the
//! instance is activated. Failures are counted and logged; they never touch
//! the activation state.
//!
//! ## Shutdown
//!
//! Uses a `tokio_util::sync::CancellationToken`. Each started loop gets a
//! child of the caller's token, so both process shutdown and
//! `stop_heartbeat` end it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::{Coordinator, HeartbeatRequest};
use super::EnclaveIdentity;

#[derive(Debug, Default)]
pub struct HeartbeatStats {
    sent: AtomicU64,
    failed: AtomicU64,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl HeartbeatStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_success(&self, at: DateTime<Utc>) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(at);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct HeartbeatLoop {
    pub(crate) coordinator: Arc<dyn Coordinator>,
    pub(crate) identity: EnclaveIdentity,
    pub(crate) interval: Duration,
    pub(crate) stats: Arc<HeartbeatStats>,
}

impl HeartbeatLoop {
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        info!(
            instance_id = %self.identity.instance_id,
            interval_ms = self.interval.as_millis() as u64,
            "Heartbeat starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => break,
            }

            // An in-flight beat is abandoned on shutdown.
            tokio::select! {
                _ = self.beat() => {},
                _ = shutdown.cancelled() => break,
            }
        }

        info!(instance_id = %self.identity.instance_id, "Heartbeat stopped");
    }

    async fn beat(&self) {
        let now = Utc::now();
        let request = HeartbeatRequest {
            instance_id: self.identity.instance_id,
            instance_type: self.identity.instance_type.clone(),
            timestamp: now.timestamp(),
        };

        match self.coordinator.heartbeat(&request).await {
            Ok(()) => {
                self.stats.record_success(now);
                debug!(instance_id = %self.identity.instance_id, "Heartbeat sent");
            }
            Err(e) => {
                self.stats.record_failure();
                warn!(
                    instance_id = %self.identity.instance_id,
                    failed = self.stats.failed(),
                    error = %e,
                    "Heartbeat failed"
                );
            }
        }
    }
}
