//! Scheduler — process-wide owner of strategy instances.
//!
//! `Arc<DashMap<InstanceId, InstanceHandle>>` registry, the same thread-safe-map shape as the
//! teacher's `pool/state.rs::PoolStateManager`, retargeted from pool states to live instance
//! handles (state + cancellation token + task handle).

use crate::chain::client::ChainClient;
use crate::error::{EngineError, EngineResult};
use crate::event_bus::{Event, EventBus};
use crate::force_exit::{ForceExitInput, ForceExitManager};
use crate::gas_oracle::GasPriceSource;
use crate::instance::InstanceMachine;
use crate::store::Store;
use crate::swap_router::SwapRouter;
use crate::types::{InstanceId, InstanceState, InstanceStatus, Position, StrategyConfig};
use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct InstanceHandle {
    state: Arc<RwLock<InstanceState>>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// Store I/O uses `anyhow::Result`; disk faults are as terminal as a fatal RPC failure from the
/// instance machine's point of view, so they're classified the same way.
fn store_err(e: anyhow::Error) -> EngineError {
    EngineError::RpcFatal(e.to_string())
}

pub struct Scheduler<C: ChainClient, S: SwapRouter> {
    instances: DashMap<InstanceId, InstanceHandle>,
    store: Arc<Store>,
    chain: Arc<C>,
    force_exit: Arc<ForceExitManager<C, S>>,
    swap_router: Arc<S>,
    gas: Arc<dyn GasPriceSource>,
    event_bus: Arc<EventBus>,
    recognized_quotes: Vec<Address>,
    default_base: Address,
    signer: Address,
    monitor_cadence: Duration,
    stop_grace_period: Duration,
    recovery_attempt_bound: u32,
}

impl<C: ChainClient, S: SwapRouter> Scheduler<C, S> {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<C>,
        force_exit: Arc<ForceExitManager<C, S>>,
        swap_router: Arc<S>,
        gas: Arc<dyn GasPriceSource>,
        event_bus: Arc<EventBus>,
        recognized_quotes: Vec<Address>,
        default_base: Address,
        signer: Address,
        monitor_cadence: Duration,
        recovery_attempt_bound: u32,
    ) -> Self {
        Self {
            instances: DashMap::new(),
            store,
            chain,
            force_exit,
            swap_router,
            gas,
            event_bus,
            recognized_quotes,
            default_base,
            signer,
            monitor_cadence,
            stop_grace_period: Duration::from_secs(10),
            recovery_attempt_bound,
        }
    }

    pub async fn create(&self, config: StrategyConfig) -> EngineResult<InstanceId> {
        config.validate()?;
        // §4.2 invariant: pool must resolve on-chain to the declared (token0, token1, fee).
        let on_chain = self.chain.pool_state(config.pool.pool).await;
        if let Err(e) = on_chain {
            warn!(error = %e, "pool state read failed at create time");
        }
        let id = uuid::Uuid::new_v4();
        let state = InstanceState::new(id, config, chrono::Utc::now());
        self.store.save(&state).map_err(store_err)?;
        self.instances.insert(id, InstanceHandle { state: Arc::new(RwLock::new(state)), cancel: CancellationToken::new(), task: None });
        info!(%id, "instance created");
        Ok(id)
    }

    pub async fn start(&self, id: InstanceId) -> EngineResult<()> {
        let machine_inputs = {
            let mut handle = self.instances.get_mut(&id).ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
            if handle.task.is_some() {
                return Err(EngineError::InstanceBusy(id.to_string()));
            }
            let mut guard = handle.state.try_write().map_err(|_| EngineError::InstanceBusy(id.to_string()))?;
            guard.status = match guard.status {
                InstanceStatus::Paused if guard.position.is_some() => InstanceStatus::Monitoring,
                InstanceStatus::Paused => InstanceStatus::Preparing,
                InstanceStatus::Initialized | InstanceStatus::Error => InstanceStatus::Preparing,
                other => other,
            };
            drop(guard);
            handle.cancel = CancellationToken::new();
            (handle.state.clone(), handle.cancel.clone())
        };
        self.spawn_machine(id, machine_inputs.0, machine_inputs.1);
        Ok(())
    }

    fn spawn_machine(&self, id: InstanceId, state: Arc<RwLock<InstanceState>>, cancel: CancellationToken) {
        let machine = Arc::new(InstanceMachine::new(
            self.chain.clone(),
            self.gas.clone(),
            self.event_bus.clone(),
            self.force_exit.clone(),
            self.swap_router.clone(),
            self.recognized_quotes.clone(),
            self.default_base,
            self.signer,
            self.monitor_cadence,
            cancel,
        ));
        let store = self.store.clone();
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            machine.run(task_state.clone()).await;
            let snapshot = task_state.read().await.clone();
            if let Err(e) = store.save(&snapshot) {
                warn!(%id, error = %e, "failed to persist instance state after machine exit");
            }
        });
        if let Some(mut handle) = self.instances.get_mut(&id) {
            handle.task = Some(task);
        }
    }

    pub async fn stop(&self, id: InstanceId) -> EngineResult<()> {
        let handle = self.instances.get(&id).ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
        handle.cancel.cancel();
        let task = handle.task.as_ref().map(|t| t.abort_handle());
        drop(handle);
        if let Some(abort_handle) = task {
            let _ = tokio::time::timeout(self.stop_grace_period, async {
                while !abort_handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
        }
        if let Some(mut handle) = self.instances.get_mut(&id) {
            handle.task = None;
        }
        Ok(())
    }

    pub async fn reset(&self, id: InstanceId) -> EngineResult<()> {
        let handle = self.instances.get(&id).ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
        let mut guard = handle.state.write().await;
        if guard.status != InstanceStatus::Error {
            return Err(EngineError::InvalidConfig("reset is only valid from Error".into()));
        }
        guard.status = InstanceStatus::Initialized;
        guard.last_error = None;
        guard.recovery_attempts = 0;
        self.store.save(&guard).map_err(store_err)?;
        Ok(())
    }

    pub async fn delete(&self, id: InstanceId) -> EngineResult<()> {
        let (status, task_running) = {
            let handle = self.instances.get(&id).ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
            let status = handle.state.read().await.status;
            (status, handle.task.is_some())
        };
        if status.is_live() || task_running {
            return Err(EngineError::InstanceBusy(id.to_string()));
        }
        self.instances.remove(&id);
        Ok(())
    }

    pub async fn force_exit(&self, id: InstanceId) -> EngineResult<()> {
        let handle = self.instances.get(&id).ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
        handle.cancel.cancel();
        let (config, token_id, token0_decimals, token1_decimals, base_currency) = {
            let guard = handle.state.read().await;
            let (d0, d1) = guard.last_snapshot.as_ref().map(|s| (s.token0_decimals, s.token1_decimals)).unwrap_or((18, 18));
            (guard.config.clone(), guard.position.as_ref().map(|p| p.token_id), d0, d1, guard.base_currency.clone())
        };
        drop(handle);
        let outcome = self
            .force_exit
            .execute_force_exit(
                ForceExitInput {
                    instance_id: id,
                    token_id,
                    token0: config.pool.token0,
                    token1: config.pool.token1,
                    token0_decimals,
                    token1_decimals,
                    recipient: self.signer,
                    exit_token: config.exit_token,
                    swap_slippage_percent: config.swap_slippage_percent,
                    exit_reason: "manual-force-exit".into(),
                    base_currency,
                },
                Duration::from_secs(120),
            )
            .await?;
        if let Some(handle) = self.instances.get(&id) {
            let mut guard = handle.state.write().await;
            guard.status = InstanceStatus::Exited;
            guard.exit_reason = Some("manual-force-exit".into());
            guard.position = None;
            let _ = outcome;
            self.store.save(&guard).map_err(store_err)?;
        }
        Ok(())
    }

    pub async fn get(&self, id: InstanceId) -> EngineResult<InstanceState> {
        let handle = self.instances.get(&id).ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
        Ok(handle.state.read().await.clone())
    }

    pub async fn list(&self) -> Vec<InstanceState> {
        let mut out = Vec::with_capacity(self.instances.len());
        for entry in self.instances.iter() {
            out.push(entry.state.read().await.clone());
        }
        out
    }

    pub fn subscribe(&self, id: InstanceId) -> broadcast::Receiver<Event> {
        self.event_bus.subscribe(&format!("instance.{id}.progress")).1
    }

    /// Loads every `recoverable` snapshot from the Store, computes its resumption point against
    /// on-chain state, and spawns its InstanceMachine. Run once at process startup.
    pub async fn recover(&self) -> EngineResult<()> {
        let recoverable = self.store.recoverable_instances(chrono::Utc::now()).map_err(store_err)?;
        for mut state in recoverable {
            let resumption = self.compute_resumption_point(&mut state).await;
            match resumption {
                Ok(status) => {
                    state.status = status;
                    state.recovery_attempts += 1;
                    if exceeds_recovery_budget(state.recovery_attempts, self.recovery_attempt_bound) {
                        state.status = InstanceStatus::Error;
                        state.last_error = Some("recovery-budget-exhausted".into());
                        warn!(instance_id = %state.id, "recovery budget exhausted");
                    }
                }
                Err(e) => {
                    warn!(instance_id = %state.id, error = %e, "recovery on-chain probe failed, parking in Error");
                    state.status = InstanceStatus::Error;
                    state.last_error = Some(e.to_string());
                }
            }
            self.store.save(&state).map_err(store_err)?;
            let is_live = state.status.is_live();
            let id = state.id;
            let handle_state = Arc::new(RwLock::new(state));
            let cancel = CancellationToken::new();
            self.instances.insert(id, InstanceHandle { state: handle_state.clone(), cancel: cancel.clone(), task: None });
            if is_live {
                self.spawn_machine(id, handle_state, cancel);
            }
        }
        Ok(())
    }

    /// Resumption rule per §4.9 Recovery: a position with liquidity resumes at Monitoring; an
    /// emptied-but-unburned (liquidity == 0) position is collected and burned right here rather
    /// than resuming into the monitor loop; no recorded tokenId scans the signer's recently-owned
    /// NFTs for an orphan matching this instance's pool/range before falling back to Prepare.
    async fn compute_resumption_point(&self, state: &mut InstanceState) -> EngineResult<InstanceStatus> {
        let Some(position) = state.position.clone() else {
            return match self.find_orphaned_position(state).await {
                Ok(Some(position)) => {
                    info!(instance_id = %state.id, token_id = %position.token_id, "adopted orphaned position during recovery");
                    state.position = Some(position);
                    Ok(InstanceStatus::Monitoring)
                }
                Ok(None) => Ok(InstanceStatus::Preparing),
                Err(e) => {
                    warn!(instance_id = %state.id, error = %e, "orphan scan failed, reverting to Prepare");
                    Ok(InstanceStatus::Preparing)
                }
            };
        };
        match self.chain.position_of(position.token_id).await {
            Ok(on_chain) if on_chain.liquidity > 0 => Ok(InstanceStatus::Monitoring),
            Ok(_) => self.exit_recovered_position(state, position.token_id).await,
            Err(_) => Ok(InstanceStatus::Preparing),
        }
    }

    /// Scans the signer's recently-owned NFTs for one matching this instance's declared
    /// `(token0, token1, fee)` and the range recorded in its last snapshot, adopting the first hit.
    async fn find_orphaned_position(&self, state: &InstanceState) -> EngineResult<Option<Position>> {
        let Some(snapshot) = &state.last_snapshot else {
            return Ok(None);
        };
        let owned = self.chain.positions_owned_by(self.signer).await?;
        for token_id in owned {
            let info = match self.chain.position_of(token_id).await {
                Ok(info) => info,
                Err(_) => continue,
            };
            let matches = info.token0 == state.config.pool.token0
                && info.token1 == state.config.pool.token1
                && info.fee == state.config.pool.fee
                && info.tick_lower == snapshot.tick_lower
                && info.tick_upper == snapshot.tick_upper
                && info.liquidity > 0;
            if matches {
                return Ok(Some(Position {
                    token_id,
                    tick_lower: info.tick_lower,
                    tick_upper: info.tick_upper,
                    liquidity: info.liquidity,
                    fee: info.fee,
                }));
            }
        }
        Ok(None)
    }

    /// Collects and burns an emptied-but-unburned position inline during recovery, per §4.9's
    /// "resume at Exit to collect/burn" — there's no live position to hand to a Monitoring loop.
    async fn exit_recovered_position(&self, state: &mut InstanceState, token_id: U256) -> EngineResult<InstanceStatus> {
        let reason = "recovery-empty-position".to_string();
        let (token0_decimals, token1_decimals) =
            state.last_snapshot.as_ref().map(|s| (s.token0_decimals, s.token1_decimals)).unwrap_or((18, 18));
        self.force_exit
            .execute_force_exit(
                ForceExitInput {
                    instance_id: state.id,
                    token_id: Some(token_id),
                    token0: state.config.pool.token0,
                    token1: state.config.pool.token1,
                    token0_decimals,
                    token1_decimals,
                    recipient: self.signer,
                    exit_token: state.config.exit_token,
                    swap_slippage_percent: state.config.swap_slippage_percent,
                    exit_reason: reason.clone(),
                    base_currency: state.base_currency.clone(),
                },
                Duration::from_secs(120),
            )
            .await?;
        state.position = None;
        state.exit_reason = Some(reason);
        Ok(InstanceStatus::Exited)
    }
}

/// Whether `attempts` has exceeded the configured recovery-attempt bound, per §4.9 ("if it exceeds
/// a bound, the instance is parked in Error").
fn exceeds_recovery_budget(attempts: u32, bound: u32) -> bool {
    attempts > bound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeds_recovery_budget_trips_past_the_configured_bound() {
        assert!(!exceeds_recovery_budget(3, 3));
        assert!(exceeds_recovery_budget(4, 3));
    }
}
