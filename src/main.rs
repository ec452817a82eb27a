//! Process entry point: load configuration, wire the engine's components together, recover any
//! live instances from the previous run, then block serving control-plane calls until shutdown.
//!
//! The control surface itself (HTTP/WebSocket) lives outside this crate; this binary wires up the
//! Scheduler and leaves it addressable for that external presenter to drive.

use alloy::network::EthereumWallet;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use clp_engine::chain::client::AlloyChainClient;
use clp_engine::config::EngineConfig;
use clp_engine::event_bus::EventBus;
use clp_engine::force_exit::ForceExitManager;
use clp_engine::gas_oracle::{GasOracle, GasPriceSource};
use clp_engine::pnl::PnLTracker;
use clp_engine::scheduler::Scheduler;
use clp_engine::store::Store;
use clp_engine::swap_router::AggregatorSwapRouter;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = EngineConfig::load().context("loading engine configuration")?;
    info!(rpc_count = config.rpc_ladder.len(), chain_id = config.chain_id, "engine configuration loaded");

    let signer: PrivateKeySigner = config.private_key.parse().context("parsing PRIVATE_KEY")?;
    let wallet = EthereumWallet::from(signer);

    let mut providers = Vec::with_capacity(config.rpc_ladder.len());
    for url in &config.rpc_ladder {
        let parsed = url.parse().with_context(|| format!("invalid RPC url: {url}"))?;
        providers.push(ProviderBuilder::new().wallet(wallet.clone()).connect_http(parsed));
    }
    let primary_provider = providers[0].clone();

    let chain = Arc::new(AlloyChainClient::new(providers.clone(), config.position_manager, config.signer));
    let swap_router = Arc::new(AggregatorSwapRouter::new(config.aggregator_base_url.clone(), None, primary_provider.clone()));
    let gas_oracle: Arc<dyn GasPriceSource> = Arc::new(GasOracle::new(
        providers,
        config.gas_floor_gwei,
        config.gas_ceiling_gwei,
        config.priority_fee_gwei,
    ));
    let event_bus = Arc::new(EventBus::new(1024, config.snapshot_retention));
    let store = Arc::new(Store::new(config.store_dir.clone()).context("initializing instance store")?);
    let force_exit = Arc::new(ForceExitManager::new(chain.clone(), swap_router.clone(), event_bus.clone(), config.wrapped_native_token));

    let pnl_tracker = PnLTracker::new();
    let _pnl_tasks = pnl_tracker.spawn(event_bus.clone());

    let scheduler = Arc::new(Scheduler::new(
        store,
        chain,
        force_exit,
        swap_router.clone(),
        gas_oracle,
        event_bus,
        config.recognized_quotes.clone(),
        config.default_base_currency,
        config.signer,
        config.monitor_cadence,
        config.recovery_attempt_bound,
    ));

    if let Err(e) = scheduler.recover().await {
        warn!(error = %e, "startup recovery sweep failed");
    } else {
        info!("startup recovery sweep complete");
    }

    info!("engine running; awaiting shutdown signal");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");

    for instance in scheduler.list().await {
        if instance.status.is_live() {
            if let Err(e) = scheduler.stop(instance.id).await {
                warn!(instance_id = %instance.id, error = %e, "failed to stop instance during shutdown");
            }
        }
    }

    Ok(())
}
