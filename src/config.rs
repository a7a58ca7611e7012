// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded from the environment once at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TEE_INSTANCE_TYPE` | Service type reported to the coordinator | Required |
//! | `TEE_INSTANCE_ID` | Instance UUID | Random v4 |
//! | `COORDINATOR_ADDR` | Coordinator URL or `host:port` (gets `https://`) | `localhost:4433` |
//! | `COORDINATOR_CA_FILE` | PEM roots trusted before activation | Mozilla roots |
//! | `COORDINATOR_TIMEOUT_SECS` | Per-request coordinator timeout | `30` |
//! | `SIMULATION_MODE` | `true` selects the simulated enclave runtime | `false` |
//! | `ATTESTATION_DIR` | Gramine attestation pseudo-filesystem | `/dev/attestation` |
//! | `SEALING_KEY_PATH` | Simulation sealing key file | Ephemeral key |
//! | `DATA_DIR` | Root of the sealed secret store | `/data` |
//! | `HEARTBEAT_INTERVAL_SECS` | Heartbeat period, `0` disables | `30` |
//! | `ACTIVATION_MAX_RETRIES` | Retries after the first attempt | `5` |
//! | `ACTIVATION_INITIAL_BACKOFF_MS` | First backoff delay | `500` |
//! | `ACTIVATION_MAX_BACKOFF_MS` | Backoff cap | `30000` |
//! | `ACTIVATION_BACKOFF_MULTIPLIER` | Backoff growth factor | `2.0` |
//! | `ALLOWED_HOSTS` | Comma list of outbound hosts; empty allows all | empty |
//! | `PINNED_CERTS` | Comma list of `host=<hex sha256 of leaf DER>` | empty |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::activation::RetryPolicy;
use crate::enclave::DEFAULT_ATTESTATION_DIR;
use crate::logging::LogFormat;
use crate::network::NetworkConfig;
use crate::storage::DATA_ROOT;

pub const INSTANCE_TYPE_ENV: &str = "TEE_INSTANCE_TYPE";
pub const INSTANCE_ID_ENV: &str = "TEE_INSTANCE_ID";
pub const COORDINATOR_ADDR_ENV: &str = "COORDINATOR_ADDR";
pub const COORDINATOR_CA_FILE_ENV: &str = "COORDINATOR_CA_FILE";
pub const COORDINATOR_TIMEOUT_ENV: &str = "COORDINATOR_TIMEOUT_SECS";
pub const SIMULATION_MODE_ENV: &str = "SIMULATION_MODE";
pub const ATTESTATION_DIR_ENV: &str = "ATTESTATION_DIR";
pub const SEALING_KEY_PATH_ENV: &str = "SEALING_KEY_PATH";

/// Environment variable name for the sealed secret store root.
///
/// Mounted as Gramine's encrypted filesystem in the manifest, so sealed
/// blobs get a second layer of protection at rest.
///
/// # Default
/// `/data`
pub const DATA_DIR_ENV: &str = "DATA_DIR";

pub const HEARTBEAT_INTERVAL_ENV: &str = "HEARTBEAT_INTERVAL_SECS";
pub const MAX_RETRIES_ENV: &str = "ACTIVATION_MAX_RETRIES";
pub const INITIAL_BACKOFF_ENV: &str = "ACTIVATION_INITIAL_BACKOFF_MS";
pub const MAX_BACKOFF_ENV: &str = "ACTIVATION_MAX_BACKOFF_MS";
pub const BACKOFF_MULTIPLIER_ENV: &str = "ACTIVATION_BACKOFF_MULTIPLIER";
pub const ALLOWED_HOSTS_ENV: &str = "ALLOWED_HOSTS";
pub const PINNED_CERTS_ENV: &str = "PINNED_CERTS";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_COORDINATOR_ADDR: &str = "localhost:4433";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_COORDINATOR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub instance_type: String,
    pub instance_id: Uuid,
    pub coordinator_addr: String,
    pub coordinator_ca_file: Option<PathBuf>,
    pub coordinator_timeout: Duration,
    pub simulation_mode: bool,
    pub attestation_dir: PathBuf,
    pub sealing_key_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    /// `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    pub retry: RetryPolicy,
    /// Read by services that build a [`SecureHttpClient`](crate::network::SecureHttpClient).
    pub network: NetworkConfig,
    pub log_format: LogFormat,
}

impl TrustConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let instance_type = get(INSTANCE_TYPE_ENV).ok_or(ConfigError::Missing(INSTANCE_TYPE_ENV))?;
        let instance_id = match get(INSTANCE_ID_ENV) {
            Some(raw) => parse(INSTANCE_ID_ENV, &raw)?,
            None => Uuid::new_v4(),
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: parse_or(&get, MAX_RETRIES_ENV, defaults.max_retries)?,
            initial_backoff: Duration::from_millis(parse_or(
                &get,
                INITIAL_BACKOFF_ENV,
                defaults.initial_backoff.as_millis() as u64,
            )?),
            max_backoff: Duration::from_millis(parse_or(
                &get,
                MAX_BACKOFF_ENV,
                defaults.max_backoff.as_millis() as u64,
            )?),
            multiplier: parse_or(&get, BACKOFF_MULTIPLIER_ENV, defaults.multiplier)?,
            deadline: None,
        };
        if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                var: BACKOFF_MULTIPLIER_ENV,
                reason: "must be a finite number >= 1.0".to_string(),
            });
        }

        let heartbeat_secs: u64 = parse_or(
            &get,
            HEARTBEAT_INTERVAL_ENV,
            DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
        )?;
        let timeout_secs: u64 = parse_or(
            &get,
            COORDINATOR_TIMEOUT_ENV,
            DEFAULT_COORDINATOR_TIMEOUT.as_secs(),
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                var: COORDINATOR_TIMEOUT_ENV,
                reason: "must be positive".to_string(),
            });
        }

        let network = NetworkConfig {
            allowed_hosts: get(ALLOWED_HOSTS_ENV)
                .map(|raw| split_list(&raw).map(|h| h.to_ascii_lowercase()).collect())
                .unwrap_or_default(),
            pinned_certs: match get(PINNED_CERTS_ENV) {
                Some(raw) => parse_pins(&raw)?,
                None => HashMap::new(),
            },
            ..Default::default()
        };

        Ok(Self {
            instance_type,
            instance_id,
            coordinator_addr: get(COORDINATOR_ADDR_ENV)
                .unwrap_or_else(|| DEFAULT_COORDINATOR_ADDR.to_string()),
            coordinator_ca_file: get(COORDINATOR_CA_FILE_ENV).map(PathBuf::from),
            coordinator_timeout: Duration::from_secs(timeout_secs),
            simulation_mode: match get(SIMULATION_MODE_ENV) {
                Some(raw) => parse_bool(SIMULATION_MODE_ENV, &raw)?,
                None => false,
            },
            attestation_dir: get(ATTESTATION_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ATTESTATION_DIR)),
            sealing_key_path: get(SEALING_KEY_PATH_ENV).map(PathBuf::from),
            data_dir: get(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DATA_ROOT)),
            heartbeat_interval: (heartbeat_secs > 0).then(|| Duration::from_secs(heartbeat_secs)),
            retry,
            network,
            log_format: get(LOG_FORMAT_ENV)
                .map(|raw| LogFormat::from_env_value(&raw))
                .unwrap_or_default(),
        })
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => parse(var, &raw),
        None => Ok(default),
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            var,
            reason: format!("expected true or false, got {other:?}"),
        }),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_pins(raw: &str) -> Result<HashMap<String, [u8; 32]>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var: PINNED_CERTS_ENV,
        reason,
    };

    split_list(raw)
        .map(|entry| {
            let (host, fingerprint) = entry
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected host=sha256, got {entry:?}")))?;
            let host = host.trim().to_ascii_lowercase();
            if host.is_empty() {
                return Err(invalid("empty host".to_string()));
            }
            let mut pin = [0u8; 32];
            hex::decode_to_slice(fingerprint.trim(), &mut pin)
                .map_err(|e| invalid(format!("pin for {host}: {e}")))?;
            Ok((host, pin))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<TrustConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TrustConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[(INSTANCE_TYPE_ENV, "oracle")]).unwrap();
        assert_eq!(config.instance_type, "oracle");
        assert_eq!(config.coordinator_addr, DEFAULT_COORDINATOR_ADDR);
        assert_eq!(config.coordinator_timeout, Duration::from_secs(30));
        assert!(!config.simulation_mode);
        assert_eq!(config.attestation_dir, PathBuf::from("/dev/attestation"));
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(500));
        assert!(config.network.allowed_hosts.is_empty());
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn instance_type_is_required() {
        assert!(matches!(
            load(&[]),
            Err(ConfigError::Missing(INSTANCE_TYPE_ENV))
        ));
        assert!(matches!(
            load(&[(INSTANCE_TYPE_ENV, "  ")]),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let id = Uuid::new_v4();
        let pin = "ab".repeat(32);
        let pins = format!("RPC.example.com={pin}");
        let config = load(&[
            (INSTANCE_TYPE_ENV, "vrf"),
            (INSTANCE_ID_ENV, &id.to_string()),
            (SIMULATION_MODE_ENV, "TRUE"),
            (HEARTBEAT_INTERVAL_ENV, "0"),
            (MAX_RETRIES_ENV, "2"),
            (BACKOFF_MULTIPLIER_ENV, "1.5"),
            (ALLOWED_HOSTS_ENV, "api.example.com, RPC.example.com,"),
            (PINNED_CERTS_ENV, &pins),
            (LOG_FORMAT_ENV, "json"),
        ])
        .unwrap();

        assert_eq!(config.instance_id, id);
        assert!(config.simulation_mode);
        assert!(config.heartbeat_interval.is_none());
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.multiplier, 1.5);
        assert_eq!(
            config.network.allowed_hosts,
            vec!["api.example.com", "rpc.example.com"]
        );
        assert_eq!(config.network.pinned_certs["rpc.example.com"], [0xab; 32]);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let cases = [
            (INSTANCE_ID_ENV, "not-a-uuid"),
            (SIMULATION_MODE_ENV, "maybe"),
            (MAX_RETRIES_ENV, "-1"),
            (BACKOFF_MULTIPLIER_ENV, "0.5"),
            (COORDINATOR_TIMEOUT_ENV, "0"),
            (PINNED_CERTS_ENV, "host=zz"),
            (PINNED_CERTS_ENV, "no-separator"),
        ];
        for (var, value) in cases {
            match load(&[(INSTANCE_TYPE_ENV, "oracle"), (var, value)]) {
                Err(ConfigError::Invalid { var: got, .. }) => assert_eq!(got, var),
                other => panic!("{var}={value}: unexpected {other:?}"),
            }
        }
    }
}
