// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use service_layer_tee::activation::{ActivationClient, EnclaveIdentity, HttpCoordinator};
use service_layer_tee::config::TrustConfig;
use service_layer_tee::enclave::{
    EnclaveRuntime, GramineRuntime, SimulatedRuntime, SimulationConfig,
};
use service_layer_tee::keys::KeyManager;
use service_layer_tee::logging;
use service_layer_tee::neo::NeoSigner;
use service_layer_tee::storage::{FileSealedStore, StoragePaths};
use service_layer_tee::tls::{parse_root_store, webpki_root_store};
use service_layer_tee::vault::Vault;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Vault location of the sealed master seed.
const SEED_NAMESPACE: &str = "keys";
const SEED_NAME: &str = "master_seed";

#[tokio::main]
async fn main() -> ExitCode {
    // Install the ring crypto provider for rustls (must be done before any TLS operations)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = match TrustConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(config.log_format) {
        eprintln!("Failed to initialise logging: {e}");
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: TrustConfig) -> Result<(), Box<dyn Error>> {
    let runtime: Arc<dyn EnclaveRuntime> = if config.simulation_mode {
        warn!("Running with the SIMULATED enclave runtime");
        Arc::new(SimulatedRuntime::new(SimulationConfig {
            sealing_key_path: config.sealing_key_path.clone(),
            ..Default::default()
        })?)
    } else {
        Arc::new(GramineRuntime::new(&config.attestation_dir)?)
    };
    info!(mode = ?runtime.mode(), "Enclave runtime ready");

    let store = FileSealedStore::open(StoragePaths::new(&config.data_dir))?;
    let vault = Arc::new(Vault::with_store(runtime.clone(), Arc::new(store)));

    let keys = KeyManager::new(runtime.clone());
    let origin = keys.initialize_sealed(&vault, SEED_NAMESPACE, SEED_NAME)?;
    info!(origin = ?origin, "Key manager initialised");

    let signer = NeoSigner::new(runtime.clone());

    let coordinator_roots = match &config.coordinator_ca_file {
        Some(path) => parse_root_store(&std::fs::read(path)?, "coordinator CA")?,
        None => webpki_root_store(),
    };
    let coordinator = HttpCoordinator::new(
        &config.coordinator_addr,
        coordinator_roots,
        config.coordinator_timeout,
    )?;

    let identity = EnclaveIdentity::new(
        config.instance_type.clone(),
        config.instance_id,
        config.coordinator_addr.clone(),
    )?;
    info!(
        instance_type = %identity.instance_type,
        instance_id = %identity.instance_id,
        coordinator = %coordinator.base_url(),
        "Starting activation"
    );

    let activation = ActivationClient::new(identity, runtime.clone(), Arc::new(coordinator))
        .with_policy(config.retry.clone())
        .with_attempt_timeout(config.coordinator_timeout)
        .with_vault(vault.clone());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    // Activation failure is fatal to the instance.
    activation.activate(&shutdown).await?;

    if let Some(interval) = config.heartbeat_interval {
        activation.start_heartbeat(interval, &shutdown)?;
    }

    shutdown.cancelled().await;

    activation.stop_heartbeat().await;
    keys.zero();
    signer.zero();
    info!("Shutdown complete");
    Ok(())
}
