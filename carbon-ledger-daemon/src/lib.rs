pub mod cli;
pub mod config;

use anyhow::{Context, Result};
use carbon_ledger_connector::rpc::JsonRpcChainReader;
use carbon_ledger_connector::storage::sled_store::SledMirrorStore;
use carbon_ledger_connector::workers::Synchronizer;
use clap::Parser;
use cli::{Cli, Commands};
use config::{load_config, DaemonConfig};
use std::sync::Arc;
use tokio::signal;

/// The main entry point for the daemon logic: CLI parsing, configuration,
/// and synchronizer startup.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let Commands::Run(run_cmd) = cli.command;
    let config = load_config_from_cli(run_cmd)?;
    carbon_ledger_logger::init(&config.daemon.log)?;
    tracing::info!(
        network = %config.mirror.chain.network,
        contract = %config.mirror.chain.contract_address,
        "configuration loaded"
    );
    run_synchronizer(config).await
}

fn load_config_from_cli(run_cmd: cli::RunCmd) -> Result<DaemonConfig> {
    if let Some(config_path) = run_cmd.config {
        println!("Loading configuration from '{}'", &config_path);
        load_config(&config_path)
    } else {
        println!("No config file provided, using default settings.");
        Ok(DaemonConfig::default())
    }
}

/// Wires the store and chain reader into a synchronizer and runs it until
/// shutdown or a stall.
async fn run_synchronizer(config: DaemonConfig) -> Result<()> {
    let db = sled::open(&config.daemon.db_path)
        .context(format!("Failed to open database at '{}'", config.daemon.db_path))?;
    let store = SledMirrorStore::new(&db).context("Failed to open mirror trees")?;
    let chain = JsonRpcChainReader::new(&config.mirror).context("Failed to build chain reader")?;

    let (synchronizer, handle) = Synchronizer::new(
        Arc::new(config.mirror),
        Arc::new(chain),
        Arc::new(store),
    );
    let mut runner = tokio::spawn(synchronizer.run());

    tokio::select! {
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                    handle.stop().await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to listen for shutdown signal.");
                }
            }
            match runner.await {
                Ok(Ok(())) => tracing::info!("Shutdown complete."),
                Ok(Err(error)) => return Err(error).context("Synchronizer failed during shutdown"),
                Err(join_error) => return Err(join_error).context("Synchronizer task panicked"),
            }
        }
        result = &mut runner => {
            match result {
                Ok(Ok(())) => tracing::info!("Synchronizer exited."),
                // The mirror is stalled; surface the typed error and let
                // the operator's supervisor decide restart policy.
                Ok(Err(error)) => return Err(error).context("Synchronizer stalled"),
                Err(join_error) => return Err(join_error).context("Synchronizer task panicked"),
            }
        }
    }

    Ok(())
}
