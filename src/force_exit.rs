//! ForceExitManager — the idempotent "kill" path for a live instance.
//!
//! Composes decreaseLiquidity+collect+burn into one ChainClient multicall, the same batching idea
//! as the teacher's `arbitrage/multicall_quoter.rs` (there read-only Quoter calls, here a
//! write-path position-manager multicall), with a small fixed retry bound on the submit loop
//! grounded on `arbitrage/cooldown.rs`'s escalating-backoff style, simplified to a flat cap since
//! this path isn't escalating a blocklist, it's racing a deadline.

use crate::chain::client::{ChainClient, TxReceipt};
use crate::chain::contracts::INonfungiblePositionManager;
use crate::error::{EngineError, EngineResult};
use crate::event_bus::EventBus;
use crate::swap_router::SwapRouter;
use crate::types::{BaseCurrency, ExitTokenSelector, InstanceId};
use alloy::primitives::{Address, U256};
use alloy::sol_types::SolCall;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Fixed retry bound for the submit-then-reread loop, per §4.8 step 1 ("retry up to a fixed small
/// bound"); matches the recovery-attempt bound used elsewhere in the engine.
const MAX_CLOSE_ATTEMPTS: u32 = 3;

/// Native gas tokens (ETH, BNB, MATIC, ...) are all 18-decimal on the chains this engine targets.
const NATIVE_GAS_DECIMALS: u8 = 18;

/// Slippage tolerance used for valuation-only quotes (amounts/gas priced in base currency but not
/// actually swapped); wide enough that a quote never fails purely on the tolerance check.
const VALUATION_SLIPPAGE_PERCENT: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct ForceExitInput {
    pub instance_id: InstanceId,
    pub token_id: Option<U256>,
    pub token0: Address,
    pub token1: Address,
    pub token0_decimals: u8,
    pub token1_decimals: u8,
    pub recipient: Address,
    pub exit_token: ExitTokenSelector,
    pub swap_slippage_percent: f64,
    pub exit_reason: String,
    /// The instance's base currency, if computed yet; `None` yields a zeroed `base_received`/
    /// `gas_cost_base` rather than a failure (a force-exit issued before Prepare has no basis).
    pub base_currency: Option<BaseCurrency>,
}

#[derive(Debug, Clone)]
pub struct ForceExitOutcome {
    pub amount0: U256,
    pub amount1: U256,
    pub completed_steps: Vec<String>,
    pub already_closed: bool,
    /// §4.7: returned amounts plus any forced-exit swap outputs, valued in base currency.
    pub base_received: Decimal,
    /// Gas spent closing the position (decrease+collect+burn, or burn-only), valued in base
    /// currency, per §4.7's `gasCost_base` term.
    pub gas_cost_base: Decimal,
}

pub struct ForceExitManager<P: ChainClient, S: SwapRouter> {
    chain: Arc<P>,
    swap_router: Arc<S>,
    event_bus: Arc<EventBus>,
    wrapped_native_token: Address,
}

impl<P: ChainClient, S: SwapRouter> ForceExitManager<P, S> {
    pub fn new(chain: Arc<P>, swap_router: Arc<S>, event_bus: Arc<EventBus>, wrapped_native_token: Address) -> Self {
        Self { chain, swap_router, event_bus, wrapped_native_token }
    }

    pub async fn execute_force_exit(&self, input: ForceExitInput, deadline: Duration) -> EngineResult<ForceExitOutcome> {
        let start = Instant::now();
        let mut completed_steps = Vec::new();

        let Some(token_id) = input.token_id else {
            // No position was ever minted; there's nothing to close.
            let outcome = ForceExitOutcome {
                amount0: U256::ZERO,
                amount1: U256::ZERO,
                completed_steps,
                already_closed: true,
                base_received: Decimal::ZERO,
                gas_cost_base: Decimal::ZERO,
            };
            self.publish_closed(&input, &outcome);
            return Ok(outcome);
        };

        let mut attempt = 0;
        let (amount0, amount1, already_closed, gas_native) = loop {
            attempt += 1;
            if start.elapsed() > deadline {
                return Err(EngineError::ForceExitTimedOut {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    completed_steps,
                });
            }

            let position = match self.chain.position_of(token_id).await {
                Ok(position) => position,
                Err(EngineError::RpcTransient(msg)) if attempt < MAX_CLOSE_ATTEMPTS => {
                    warn!(%token_id, attempt, error = %msg, "position read failed, retrying");
                    continue;
                }
                // positions() reverting for a burned tokenId reads as idempotent completion.
                Err(_) => break (U256::ZERO, U256::ZERO, true, U256::ZERO),
            };

            if position.liquidity == 0 {
                match self.chain.burn(token_id).await {
                    Ok(receipt) => {
                        completed_steps.push("burn".to_string());
                        break (U256::ZERO, U256::ZERO, true, gas_cost_native(&receipt));
                    }
                    Err(EngineError::RpcTransient(_)) if attempt < MAX_CLOSE_ATTEMPTS => continue,
                    Err(e) => return Err(e),
                }
            }

            let decrease_call = INonfungiblePositionManager::decreaseLiquidityCall {
                params: INonfungiblePositionManager::DecreaseLiquidityParams {
                    tokenId: token_id,
                    liquidity: position.liquidity,
                    amount0Min: U256::ZERO,
                    amount1Min: U256::ZERO,
                    deadline: U256::from(u64::MAX),
                },
            };
            let collect_call = INonfungiblePositionManager::collectCall {
                params: INonfungiblePositionManager::CollectParams {
                    tokenId: token_id,
                    recipient: input.recipient,
                    amount0Max: u128::MAX,
                    amount1Max: u128::MAX,
                },
            };
            let burn_call = INonfungiblePositionManager::burnCall { tokenId: token_id };
            let calls = vec![
                decrease_call.abi_encode().into(),
                collect_call.abi_encode().into(),
                burn_call.abi_encode().into(),
            ];

            match self.chain.multicall(calls).await {
                Ok((receipt, _)) => {
                    completed_steps.push("decreaseLiquidity".to_string());
                    completed_steps.push("collect".to_string());
                    completed_steps.push("burn".to_string());
                    let (a0, a1) = parse_collect_amounts(&receipt);
                    break (a0, a1, false, gas_cost_native(&receipt));
                }
                Err(EngineError::RpcTransient(msg)) if attempt < MAX_CLOSE_ATTEMPTS => {
                    warn!(%token_id, attempt, error = %msg, "close multicall failed, re-reading position");
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        let (amount0, amount1) = self.maybe_swap_remainder(&input, amount0, amount1).await?;

        let base_decimals = match &input.base_currency {
            Some(base) => Some(self.chain.token_meta(base.token).await?.decimals),
            None => None,
        };
        let base_received = self.value_closed_amounts(&input, amount0, amount1, base_decimals).await?;
        let gas_cost_base = self.value_gas_cost(&input, gas_native, base_decimals).await?;

        let outcome = ForceExitOutcome { amount0, amount1, completed_steps, already_closed, base_received, gas_cost_base };
        self.publish_closed(&input, &outcome);
        info!(instance_id = %input.instance_id, reason = %input.exit_reason, "force exit complete");
        Ok(outcome)
    }

    /// §4.7: "parse returned amounts... add any subsequent forced-exit swap outputs in base
    /// currency". A side already denominated in base currency is converted directly; any other
    /// side is priced against base currency via a valuation-only aggregator quote.
    async fn value_closed_amounts(
        &self,
        input: &ForceExitInput,
        amount0: U256,
        amount1: U256,
        base_decimals: Option<u8>,
    ) -> EngineResult<Decimal> {
        let (Some(base), Some(base_decimals)) = (&input.base_currency, base_decimals) else {
            return Ok(Decimal::ZERO);
        };
        let leg0 = self.value_in_base(input.token0, amount0, input.token0_decimals, base.token, base_decimals).await?;
        let leg1 = self.value_in_base(input.token1, amount1, input.token1_decimals, base.token, base_decimals).await?;
        Ok(leg0 + leg1)
    }

    async fn value_gas_cost(&self, input: &ForceExitInput, gas_native: U256, base_decimals: Option<u8>) -> EngineResult<Decimal> {
        if gas_native.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let (Some(base), Some(base_decimals)) = (&input.base_currency, base_decimals) else {
            return Ok(Decimal::ZERO);
        };
        self.value_in_base(self.wrapped_native_token, gas_native, NATIVE_GAS_DECIMALS, base.token, base_decimals).await
    }

    async fn value_in_base(&self, token: Address, amount: U256, token_decimals: u8, base: Address, base_decimals: u8) -> EngineResult<Decimal> {
        if amount.is_zero() {
            return Ok(Decimal::ZERO);
        }
        if token == base {
            return Ok(u256_to_decimal(amount, token_decimals));
        }
        let quote = self.swap_router.quote(token, base, amount, VALUATION_SLIPPAGE_PERCENT).await?;
        Ok(u256_to_decimal(quote.buy_amount, base_decimals))
    }

    async fn maybe_swap_remainder(&self, input: &ForceExitInput, amount0: U256, amount1: U256) -> EngineResult<(U256, U256)> {
        let (from_token, to_token, from_amount) = match input.exit_token {
            ExitTokenSelector::NoPreference => return Ok((amount0, amount1)),
            ExitTokenSelector::Token0 if !amount1.is_zero() => (input.token1, input.token0, amount1),
            ExitTokenSelector::Token1 if !amount0.is_zero() => (input.token0, input.token1, amount0),
            _ => return Ok((amount0, amount1)),
        };
        let quote = self.swap_router.quote(from_token, to_token, from_amount, input.swap_slippage_percent).await?;
        let outcome = self.swap_router.swap(&quote, input.recipient).await?;
        match input.exit_token {
            ExitTokenSelector::Token0 => Ok((amount0 + outcome.amount_out, U256::ZERO)),
            ExitTokenSelector::Token1 => Ok((U256::ZERO, amount1 + outcome.amount_out)),
            ExitTokenSelector::NoPreference => Ok((amount0, amount1)),
        }
    }

    fn publish_closed(&self, input: &ForceExitInput, outcome: &ForceExitOutcome) {
        self.event_bus.publish(
            "position.closed",
            serde_json::json!({
                "instance_id": input.instance_id,
                "amount0": outcome.amount0.to_string(),
                "amount1": outcome.amount1.to_string(),
                "base_received": outcome.base_received,
                "gas_cost_base": outcome.gas_cost_base,
                "exit_reason": input.exit_reason,
                "already_closed": outcome.already_closed,
            }),
        );
    }
}

fn parse_collect_amounts(receipt: &TxReceipt) -> (U256, U256) {
    use alloy::sol_types::SolEvent;
    for log in &receipt.logs {
        if let Ok(decoded) = INonfungiblePositionManager::Collect::decode_log(&log.inner) {
            return (decoded.amount0, decoded.amount1);
        }
    }
    (U256::ZERO, U256::ZERO)
}

fn gas_cost_native(receipt: &TxReceipt) -> U256 {
    U256::from(receipt.gas_used) * receipt.effective_gas_price
}

fn u256_to_decimal(amount: U256, decimals: u8) -> Decimal {
    let scaled: u128 = amount.try_into().unwrap_or(u128::MAX);
    Decimal::from_i128_with_scale(scaled as i128, decimals as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_close_attempts_is_a_small_fixed_bound() {
        assert_eq!(MAX_CLOSE_ATTEMPTS, 3);
    }

    #[test]
    fn gas_cost_native_multiplies_used_by_effective_price() {
        let receipt = TxReceipt {
            hash: "0x0".into(),
            status: true,
            block: 1,
            gas_used: 21_000,
            effective_gas_price: U256::from(5_000_000_000u64),
            logs: Vec::new(),
        };
        assert_eq!(gas_cost_native(&receipt), U256::from(21_000u64) * U256::from(5_000_000_000u64));
    }

    #[test]
    fn u256_to_decimal_scales_by_decimals() {
        let value = u256_to_decimal(U256::from(1_500_000u64), 6);
        assert_eq!(value, Decimal::new(1_500_000, 6));
    }
}
