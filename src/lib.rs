// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Service Layer TEE Core - Enclave Trust and Secret Management
//!
//! This crate is the trust core of an Intel SGX (Gramine) service instance:
//! it activates the instance with the remote coordinator, keeps secrets
//! sealed at rest, and signs with keys that never leave the enclave.
//!
//! ## Modules
//!
//! - `enclave` - Hardware runtime adapter (Gramine, simulation), sealing
//! - `storage` - Backing store for sealed blobs
//! - `vault` - Scoped access to sealed secrets
//! - `keys` - Seed-derived P-256 keys
//! - `neo` - Neo N3 wallets and signing
//! - `activation` - Coordinator activation, retry, heartbeat
//! - `tls` - Mutual TLS from the activation bundle, certificate pinning
//! - `network` - Outbound HTTP/RPC with vaulted credentials
//! - `state` - Activation state
//! - `config` - Environment configuration
//! - `logging` - tracing setup

pub mod activation;
pub mod config;
pub mod enclave;
pub mod error;
pub mod keys;
pub mod logging;
pub mod neo;
pub mod network;
pub mod state;
pub mod storage;
pub mod tls;
pub mod vault;

pub use error::ErrorKind;
