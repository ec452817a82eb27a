//! InstanceMachine — the prepare → balance → mint → monitor → exit pipeline for one strategy.
//!
//! Sequential submission shape grounded on `arbitrage/executor.rs` (gas check → approve → swap →
//! swap → profit, one step strictly after the previous); the Stage 4 steady-cadence poll loop with
//! a cancellation-aware reconnect shape grounded on `mempool/monitor.rs`'s `tokio::select!` +
//! `interval` loop; out-of-range-since bookkeeping grounded on `arbitrage/cooldown.rs`'s
//! `CooldownEntry` escalating-timeout idiom, simplified to a single timestamp since this tracks
//! one band rather than many routes.

use crate::chain::client::{ChainClient, MintParams as ChainMintParams};
use crate::error::{EngineError, EngineResult};
use crate::event_bus::EventBus;
use crate::force_exit::{ForceExitInput, ForceExitManager};
use crate::gas_oracle::GasPriceSource;
use crate::swap_router::SwapRouter;
use crate::tick_math;
use crate::types::{
    BaseCurrency, InstanceId, InstanceState, InstanceStatus, MarketSnapshot, Position, Progress,
    Scenario, TxKind, TxRecord,
};
use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Epsilon below which a balance shortfall is ignored rather than triggering a swap, per §4.9
/// Stage 2 ("exceeds current balance by more than a small epsilon").
const BALANCE_EPSILON: U256 = U256::from_limbs([1_000, 0, 0, 0]);

pub struct InstanceMachine<C: ChainClient, S: SwapRouter> {
    chain: Arc<C>,
    gas: Arc<dyn GasPriceSource>,
    event_bus: Arc<EventBus>,
    force_exit: Arc<ForceExitManager<C, S>>,
    swap_router: Arc<S>,
    recognized_quotes: Vec<Address>,
    default_base: Address,
    signer: Address,
    monitor_cadence: Duration,
    cancel: CancellationToken,
}

impl<C: ChainClient, S: SwapRouter> InstanceMachine<C, S> {
    pub fn new(
        chain: Arc<C>,
        gas: Arc<dyn GasPriceSource>,
        event_bus: Arc<EventBus>,
        force_exit: Arc<ForceExitManager<C, S>>,
        swap_router: Arc<S>,
        recognized_quotes: Vec<Address>,
        default_base: Address,
        signer: Address,
        monitor_cadence: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { chain, gas, event_bus, force_exit, swap_router, recognized_quotes, default_base, signer, monitor_cadence, cancel }
    }

    /// Drives `state` from its current status through to a terminal status, or until cancelled.
    /// The Scheduler spawns exactly one of these per live instance.
    pub async fn run(self: Arc<Self>, state: Arc<RwLock<InstanceState>>) {
        loop {
            if self.cancel.is_cancelled() {
                self.handle_cancellation(&state).await;
                return;
            }
            let status = state.read().await.status;
            let result = match status {
                InstanceStatus::Initialized | InstanceStatus::Preparing => self.run_prepare(&state).await,
                InstanceStatus::Running => self.run_balance_and_mint(&state).await,
                InstanceStatus::Monitoring => self.run_monitor(&state).await,
                InstanceStatus::Paused | InstanceStatus::Completed | InstanceStatus::Exited | InstanceStatus::Error => {
                    return;
                }
            };
            if let Err(e) = result {
                self.transition_to_error(&state, e).await;
                return;
            }
        }
    }

    async fn handle_cancellation(&self, state: &Arc<RwLock<InstanceState>>) {
        let mut guard = state.write().await;
        if guard.status == InstanceStatus::Monitoring || guard.status == InstanceStatus::Running {
            guard.status = InstanceStatus::Paused;
        }
    }

    async fn transition_to_error(&self, state: &Arc<RwLock<InstanceState>>, error: EngineError) {
        warn!(error = %error, "instance pipeline stage failed, transitioning to Error");
        let mut guard = state.write().await;
        guard.status = InstanceStatus::Error;
        guard.last_error = Some(error.to_string());
        self.event_bus.publish(
            &progress_topic(guard.id),
            serde_json::json!({"instance_id": guard.id, "stage": guard.progress.stage, "description": "error", "error": error.to_string()}),
        );
    }

    fn checkpoint_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ---- Stage 1: Prepare ----

    async fn run_prepare(&self, state: &Arc<RwLock<InstanceState>>) -> EngineResult<()> {
        let config = state.read().await.config.clone();
        config.validate()?;

        let initial = self.read_snapshot(&config.pool, &config).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        if self.checkpoint_cancelled() {
            return Ok(());
        }
        let final_snapshot = self.read_snapshot(&config.pool, &config).await?;

        let base_currency = config.base_currency_override.map(|token| BaseCurrency {
            token,
            scenario: if self.recognized_quotes.contains(&token) { Scenario::SingleBase } else { Scenario::DualNonBase },
        }).unwrap_or_else(|| {
            BaseCurrency::infer(config.pool.token0, config.pool.token1, &self.recognized_quotes, self.default_base)
        });

        let mut guard = state.write().await;
        guard.last_snapshot = Some(final_snapshot);
        guard.base_currency = Some(base_currency);
        guard.status = InstanceStatus::Running;
        guard.progress = Progress { stage: 2, description: "balance & approve".into() };
        let snapshot_id = guard.id;
        drop(guard);
        let _ = initial;
        self.event_bus.publish(&progress_topic(snapshot_id), serde_json::json!({"instance_id": snapshot_id, "stage": 2, "description": "balance & approve"}));
        Ok(())
    }

    async fn read_snapshot(&self, pool: &crate::types::PoolConfig, config: &crate::types::StrategyConfig) -> EngineResult<MarketSnapshot> {
        let pool_state = self.chain.pool_state(pool.pool).await?;
        let token0_meta = self.chain.token_meta(pool.token0).await?;
        let token1_meta = self.chain.token_meta(pool.token1).await?;
        let spacing = pool.tick_spacing()?;
        let (tick_lower, tick_upper) =
            tick_math::percent_band_to_ticks(pool_state.tick, config.lower_percent, config.upper_percent, spacing)?;

        let sqrt_x = pool_state.sqrt_price_x96;
        let sqrt_a = tick_math::sqrt_ratio_at_tick(tick_lower)?;
        let sqrt_b = tick_math::sqrt_ratio_at_tick(tick_upper)?;
        let input_is_token0 = config.input_token == pool.token0;
        let liquidity = if input_is_token0 {
            tick_math::get_liquidity_for_amount0(sqrt_a, sqrt_b, config.input_amount)?
        } else {
            tick_math::get_liquidity_for_amount1(sqrt_a, sqrt_b, config.input_amount)?
        };
        let (amount0, amount1) = tick_math::get_amounts_for_liquidity(sqrt_x, sqrt_a, sqrt_b, liquidity)?;
        Ok(MarketSnapshot {
            tick: pool_state.tick,
            sqrt_price_x96: sqrt_x,
            token0_decimals: token0_meta.decimals,
            token1_decimals: token1_meta.decimals,
            token0_symbol: token0_meta.symbol,
            token1_symbol: token1_meta.symbol,
            tick_lower,
            tick_upper,
            required_amount0: amount0,
            required_amount1: amount1,
            required_liquidity: liquidity,
            observed_at: chrono::Utc::now(),
        })
    }

    // ---- Stage 2 + 3: Balance & approve, then mint ----

    async fn run_balance_and_mint(&self, state: &Arc<RwLock<InstanceState>>) -> EngineResult<()> {
        let (config, snapshot, id, base_currency) = {
            let guard = state.read().await;
            let snapshot = guard.last_snapshot.clone().ok_or_else(|| EngineError::InvalidConfig("missing snapshot".into()))?;
            (guard.config.clone(), snapshot, guard.id, guard.base_currency.clone())
        };
        if let Some(record) = self
            .ensure_side_funded(
                &config,
                config.pool.token0,
                config.pool.token1,
                snapshot.token1_decimals,
                snapshot.required_amount0,
                base_currency.as_ref(),
                id,
            )
            .await?
        {
            let mut guard = state.write().await;
            guard.swap_history.push(record);
        }
        if self.checkpoint_cancelled() {
            return Ok(());
        }
        if let Some(record) = self
            .ensure_side_funded(
                &config,
                config.pool.token1,
                config.pool.token0,
                snapshot.token0_decimals,
                snapshot.required_amount1,
                base_currency.as_ref(),
                id,
            )
            .await?
        {
            let mut guard = state.write().await;
            guard.swap_history.push(record);
        }
        if self.checkpoint_cancelled() {
            return Ok(());
        }

        // Re-read tick right before mint to compute drift-based slippage and gas sizing.
        let pre_mint = self.chain.pool_state(config.pool.pool).await?;
        let delta_tick = (pre_mint.tick - snapshot.tick).abs();
        let slippage = dynamic_slippage(config.mint_slippage_percent, delta_tick);

        let amount0_min = apply_slippage_floor(snapshot.required_amount0, slippage);
        let amount1_min = apply_slippage_floor(snapshot.required_amount1, slippage);

        let gas = self.gas.current().await?;
        let gas_limit_multiplier: f64 = if delta_tick <= 5 { 1.5 } else { 1.6 };
        let max_fee_per_gas = gas.max_fee_per_gas * U256::from(110u32) / U256::from(100u32);

        let recipient = self.signer;
        let mint_result = self
            .chain
            .mint(ChainMintParams {
                token0: config.pool.token0,
                token1: config.pool.token1,
                fee: config.pool.fee,
                tick_lower: snapshot.tick_lower,
                tick_upper: snapshot.tick_upper,
                amount0_desired: snapshot.required_amount0,
                amount1_desired: snapshot.required_amount1,
                amount0_min,
                amount1_min,
                recipient,
                deadline: U256::from(chrono::Utc::now().timestamp() as u64 + 600),
                gas_limit_multiplier,
                max_fee_per_gas,
                max_priority_fee_per_gas: gas.max_priority_fee_per_gas,
            })
            .await?;

        let mut guard = state.write().await;
        guard.position = Some(Position {
            token_id: mint_result.token_id,
            tick_lower: snapshot.tick_lower,
            tick_upper: snapshot.tick_upper,
            liquidity: mint_result.liquidity,
            fee: config.pool.fee,
        });
        guard.tx_history.push(TxRecord {
            kind: TxKind::Mint,
            params: serde_json::json!({"tick_lower": snapshot.tick_lower, "tick_upper": snapshot.tick_upper}),
            hash: mint_result.receipt.hash.clone(),
            block: mint_result.receipt.block,
            gas_used: mint_result.receipt.gas_used,
            effective_gas_price: mint_result.receipt.effective_gas_price,
            parsed: serde_json::json!({
                "token_id": mint_result.token_id.to_string(),
                "liquidity": mint_result.liquidity,
                "amount0": mint_result.amount0.to_string(),
                "amount1": mint_result.amount1.to_string(),
            }),
            timestamp: chrono::Utc::now(),
        });
        guard.status = InstanceStatus::Monitoring;
        guard.progress = Progress { stage: 4, description: "monitoring".into() };
        let swap_history = guard.swap_history.clone();
        drop(guard);
        self.event_bus.publish(&progress_topic(id), serde_json::json!({"instance_id": id, "stage": 4, "description": "monitoring"}));

        // §4.7: scenario-1 cost basis is the sum of the base-currency amounts spent on the prior
        // swaps; scenario-2 adds any base directly provided to the LP on top of that.
        let swap_spend: Decimal = swap_history.iter().filter_map(|s| s.base_currency_spent).sum();
        let direct_base = base_currency
            .as_ref()
            .filter(|bc| bc.token == config.input_token)
            .map(|_| {
                let decimals = if config.input_token == config.pool.token0 { snapshot.token0_decimals } else { snapshot.token1_decimals };
                u256_to_decimal(config.input_amount, decimals)
            })
            .unwrap_or_default();
        let base_spent = swap_spend + direct_base;

        self.event_bus.publish(
            "position.created",
            serde_json::json!({
                "instance_id": id,
                "base_currency": base_currency.as_ref().map(|bc| bc.token.to_string()).unwrap_or_default(),
                "scenario": base_currency.as_ref().map(|bc| bc.scenario).unwrap_or(Scenario::DualNonBase),
                "base_spent": base_spent,
                "token_id": mint_result.token_id.to_string(),
            }),
        );
        info!(instance_id = %id, token_id = %mint_result.token_id, "position minted");
        Ok(())
    }

    /// Buys the shortfall (plus swap buffer) for `token` out of `source_token` if the signer's
    /// balance of `token` is insufficient, then approves the position manager if the allowance is
    /// also insufficient. Returns the swap record to append to history, if a swap happened.
    async fn ensure_side_funded(
        &self,
        config: &crate::types::StrategyConfig,
        token: Address,
        source_token: Address,
        source_decimals: u8,
        required: U256,
        base_currency: Option<&BaseCurrency>,
        id: InstanceId,
    ) -> EngineResult<Option<crate::types::SwapRecord>> {
        let owner = self.signer;
        let balance = self.chain.balance_of(token, owner).await?;
        let mut swap_record = None;
        if balance + BALANCE_EPSILON < required {
            let shortfall = required - balance;
            let buffer = shortfall * U256::from((config.swap_buffer_percent * 1000.0) as u64) / U256::from(100_000u64);
            let amount_needed = shortfall + buffer;
            debug!(%token, %amount_needed, instance_id = %id, "acquiring shortfall via swap router");
            let quote = self.swap_router.quote(source_token, token, amount_needed, config.swap_slippage_percent).await?;
            let outcome = self.swap_router.swap(&quote, owner).await?;
            // §4.7 scenario-1 cost basis accrues only the leg spent *out of* the base currency.
            let base_currency_spent = base_currency
                .filter(|bc| bc.token == source_token)
                .map(|_| u256_to_decimal(outcome.amount_in, source_decimals));
            swap_record = Some(crate::types::SwapRecord {
                from_token: source_token,
                to_token: token,
                amount_in: outcome.amount_in,
                amount_out: outcome.amount_out,
                base_currency_spent,
                base_currency_received: None,
                tx_hash: outcome.tx_hash,
                timestamp: chrono::Utc::now(),
            });
        }
        let allowance = self.chain.allowance(token, owner, self.chain.position_manager()).await?;
        if allowance < required {
            self.chain.approve_max(token, self.chain.position_manager()).await?;
        }
        Ok(swap_record)
    }

    // ---- Stage 4: Monitor ----

    async fn run_monitor(&self, state: &Arc<RwLock<InstanceState>>) -> EngineResult<()> {
        let (config, position, id) = {
            let guard = state.read().await;
            let position = guard.position.clone().ok_or_else(|| EngineError::InvalidConfig("monitoring without a position".into()))?;
            (guard.config.clone(), position, guard.id)
        };

        let mut ticker = tokio::time::interval(self.monitor_cadence);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let pool_state = self.chain.pool_state(config.pool.pool).await?;
                    self.event_bus.publish("instance.tick", serde_json::json!({"instance_id": id, "tick": pool_state.tick}));

                    let in_range = pool_state.tick >= position.tick_lower && pool_state.tick < position.tick_upper;
                    let mut guard = state.write().await;
                    if in_range {
                        guard.out_of_range_since = None;
                        continue;
                    }
                    let since = *guard.out_of_range_since.get_or_insert_with(chrono::Utc::now);
                    let elapsed = chrono::Utc::now().signed_duration_since(since);
                    drop(guard);
                    if elapsed >= config.monitor_timeout {
                        return self.graceful_exit(state, &config, position.token_id, "out-of-range-timeout".into()).await;
                    }
                }
            }
        }
    }

    async fn graceful_exit(
        &self,
        state: &Arc<RwLock<InstanceState>>,
        config: &crate::types::StrategyConfig,
        token_id: U256,
        reason: String,
    ) -> EngineResult<()> {
        let (id, base_currency, token0_decimals, token1_decimals) = {
            let guard = state.read().await;
            let (d0, d1) = guard.last_snapshot.as_ref().map(|s| (s.token0_decimals, s.token1_decimals)).unwrap_or((18, 18));
            (guard.id, guard.base_currency.clone(), d0, d1)
        };
        let outcome = self
            .force_exit
            .execute_force_exit(
                ForceExitInput {
                    instance_id: id,
                    token_id: Some(token_id),
                    token0: config.pool.token0,
                    token1: config.pool.token1,
                    token0_decimals,
                    token1_decimals,
                    recipient: self.signer,
                    exit_token: config.exit_token,
                    swap_slippage_percent: config.swap_slippage_percent,
                    exit_reason: reason.clone(),
                    base_currency,
                },
                Duration::from_secs(120),
            )
            .await?;
        let mut guard = state.write().await;
        guard.status = InstanceStatus::Exited;
        guard.exit_reason = Some(reason);
        guard.position = None;
        let _ = outcome;
        Ok(())
    }
}

/// dynamic slippage = base + min(|ΔTick| × 0.001, 2) + (0.25 if ΔTick = 0), clamped to 99.9%.
fn dynamic_slippage(base_percent: f64, delta_tick: i32) -> f64 {
    let drift_component = (delta_tick as f64 * 0.001).min(2.0);
    let zero_drift_bonus = if delta_tick == 0 { 0.25 } else { 0.0 };
    (base_percent + drift_component + zero_drift_bonus).min(99.9)
}

/// §4.9/§6: progress is a per-instance stream; `Scheduler::subscribe(id)` listens on this topic.
fn progress_topic(id: InstanceId) -> String {
    format!("instance.{id}.progress")
}

fn u256_to_decimal(amount: U256, decimals: u8) -> Decimal {
    let scaled: u128 = amount.try_into().unwrap_or(u128::MAX);
    Decimal::from_i128_with_scale(scaled as i128, decimals as u32)
}

fn apply_slippage_floor(amount: U256, slippage_percent: f64) -> U256 {
    if amount.is_zero() {
        return U256::ZERO;
    }
    let keep_bps = ((100.0 - slippage_percent) * 100.0).max(0.0) as u64;
    amount * U256::from(keep_bps) / U256::from(10_000u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_slippage_adds_zero_drift_bonus() {
        let s = dynamic_slippage(1.0, 0);
        assert!((s - 1.25).abs() < 1e-9);
    }

    #[test]
    fn dynamic_slippage_caps_drift_component_at_two_percent() {
        let s = dynamic_slippage(1.0, 100_000);
        assert!((s - 99.9).abs() < 1e-9);
    }

    #[test]
    fn apply_slippage_floor_reduces_amount_proportionally() {
        let floored = apply_slippage_floor(U256::from(1000u64), 1.0);
        assert_eq!(floored, U256::from(990u64));
    }
}
