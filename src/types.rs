//! Core data model for the liquidity-provisioning strategy engine.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque instance identifier, issued by the Scheduler at `create` time.
pub type InstanceId = Uuid;

/// Pool configuration, immutable per instance.
///
/// Invariant: `pool` resolves on-chain (via `Factory.getPool`) to exactly this
/// `(token0, token1, fee)` triple; the Scheduler checks this once at `create` time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool: Address,
    pub token0: Address,
    pub token1: Address,
    pub fee: u32,
}

impl PoolConfig {
    pub fn tick_spacing(&self) -> crate::error::EngineResult<i32> {
        crate::tick_math::tick_spacing_for_fee(self.fee)
    }
}

/// Which side of the pool an exit should end up holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitTokenSelector {
    Token0,
    Token1,
    /// Leave remainders as-is; no post-exit swap.
    NoPreference,
}

/// Strategy configuration, immutable once the instance is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub pool: PoolConfig,
    /// Must equal `pool.token0` or `pool.token1`.
    pub input_token: Address,
    /// Positive, in the input token's natural units (not wei-scaled beyond the token's decimals).
    pub input_amount: U256,
    /// Signed, typically negative; must be < `upper_percent`.
    pub lower_percent: f64,
    /// Signed, typically positive.
    pub upper_percent: f64,
    /// Swap-aggregator slippage, percent, expected <= 1.0.
    pub swap_slippage_percent: f64,
    /// Liquidity-provision slippage, percent; internally bounded to <= 99.9.
    pub mint_slippage_percent: f64,
    /// Extra percent bought on top of the computed shortfall, to cover quote drift.
    pub swap_buffer_percent: f64,
    /// Time the tick may stay out of range before an automatic force-exit.
    pub monitor_timeout: chrono::Duration,
    pub exit_token: ExitTokenSelector,
    /// Overrides the inferred base currency if set.
    pub base_currency_override: Option<Address>,
}

impl StrategyConfig {
    pub fn validate(&self) -> crate::error::EngineResult<()> {
        use crate::error::EngineError;
        if self.input_token != self.pool.token0 && self.input_token != self.pool.token1 {
            return Err(EngineError::InvalidConfig(
                "input_token must equal pool.token0 or pool.token1".into(),
            ));
        }
        if self.input_amount.is_zero() {
            return Err(EngineError::InvalidConfig("input_amount must be positive".into()));
        }
        if self.lower_percent >= self.upper_percent {
            return Err(EngineError::InvalidConfig(
                "lower_percent must be less than upper_percent".into(),
            ));
        }
        if self.swap_slippage_percent <= 0.0 || self.swap_slippage_percent > 1.0 {
            return Err(EngineError::InvalidConfig("swap_slippage_percent must be in (0, 1]".into()));
        }
        if self.mint_slippage_percent <= 0.0 || self.mint_slippage_percent > 99.9 {
            return Err(EngineError::InvalidConfig("mint_slippage_percent must be in (0, 99.9]".into()));
        }
        Ok(())
    }
}

/// Recomputed at the start of each pipeline stage from a fresh on-chain read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub tick: i32,
    pub sqrt_price_x96: U256,
    pub token0_decimals: u8,
    pub token1_decimals: u8,
    pub token0_symbol: String,
    pub token1_symbol: String,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub required_amount0: U256,
    pub required_amount1: U256,
    pub required_liquidity: u128,
    pub observed_at: DateTime<Utc>,
}

/// Kinds of on-chain operation a `TxRecord` can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Approve,
    Mint,
    Decrease,
    Collect,
    Burn,
    Multicall,
    Swap,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxKind::Approve => write!(f, "approve"),
            TxKind::Mint => write!(f, "mint"),
            TxKind::Decrease => write!(f, "decrease"),
            TxKind::Collect => write!(f, "collect"),
            TxKind::Burn => write!(f, "burn"),
            TxKind::Multicall => write!(f, "multicall"),
            TxKind::Swap => write!(f, "swap"),
        }
    }
}

/// Immutable once written; one entry per on-chain write the machine submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub kind: TxKind,
    pub params: serde_json::Value,
    pub hash: String,
    pub block: u64,
    pub gas_used: u64,
    pub effective_gas_price: U256,
    pub parsed: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// One entry per swap executed through the `SwapRouter`, in base-currency terms for PnL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRecord {
    pub from_token: Address,
    pub to_token: Address,
    pub amount_in: U256,
    pub amount_out: U256,
    pub base_currency_spent: Option<Decimal>,
    pub base_currency_received: Option<Decimal>,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// A minted concentrated-liquidity position, once Stage 3 succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub token_id: U256,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub liquidity: u128,
    pub fee: u32,
}

/// Lifecycle state of one strategy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Initialized,
    Preparing,
    Running,
    Monitoring,
    Paused,
    Completed,
    Exited,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl InstanceStatus {
    /// Instances in one of these statuses have a live InstanceMachine and are the only ones
    /// `forceExit` or Store-startup recovery will touch.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Preparing | InstanceStatus::Running | InstanceStatus::Monitoring
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Exited)
    }
}

/// A pipeline stage plus a free-text description, surfaced on `strategy:progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage: u8,
    pub description: String,
}

/// Recognized quote tokens define the "base currency" an instance reports P&L in. Whether a pool
/// has zero or one side in this set determines scenario-1 vs scenario-2 classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scenario {
    /// Both tokens are non-base; P&L cost basis is reconstructed from two prior swaps.
    DualNonBase,
    /// Exactly one token is the recognized base currency.
    SingleBase,
}

/// The inferred or overridden base currency for an instance, computed once at prepare time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseCurrency {
    pub token: Address,
    pub scenario: Scenario,
}

impl BaseCurrency {
    /// Classifies `(token0, token1)` against `recognized_quotes`. At most one side may be
    /// recognized; if none is, falls back to `default_base` (scenario-1 default, per policy USDT).
    pub fn infer(
        token0: Address,
        token1: Address,
        recognized_quotes: &[Address],
        default_base: Address,
    ) -> Self {
        let token0_is_quote = recognized_quotes.contains(&token0);
        let token1_is_quote = recognized_quotes.contains(&token1);
        match (token0_is_quote, token1_is_quote) {
            (true, false) => BaseCurrency { token: token0, scenario: Scenario::SingleBase },
            (false, true) => BaseCurrency { token: token1, scenario: Scenario::SingleBase },
            // Both-recognized is not expected for a real pool; treat as scenario-1 on token0
            // rather than silently picking a side — a reviewer can tell from the scenario tag.
            _ => BaseCurrency { token: default_base, scenario: Scenario::DualNonBase },
        }
    }
}

/// Mutable, persisted record for one strategy instance.
///
/// Invariants: status transitions respect the InstanceMachine state machine; `position` is
/// `Some` iff status has passed the mint stage and not yet passed the burn; `out_of_range_since`
/// is non-null only while `status == Monitoring` and the last observed tick was outside the band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: InstanceId,
    pub config: StrategyConfig,
    pub status: InstanceStatus,
    pub progress: Progress,
    pub last_snapshot: Option<MarketSnapshot>,
    pub position: Option<Position>,
    pub base_currency: Option<BaseCurrency>,
    pub tx_history: Vec<TxRecord>,
    pub swap_history: Vec<SwapRecord>,
    pub out_of_range_since: Option<DateTime<Utc>>,
    pub last_persist: DateTime<Utc>,
    pub last_error: Option<String>,
    pub exit_reason: Option<String>,
    pub recovery_attempts: u32,
}

impl InstanceState {
    pub fn new(id: InstanceId, config: StrategyConfig, now: DateTime<Utc>) -> Self {
        Self {
            id,
            config,
            status: InstanceStatus::Initialized,
            progress: Progress { stage: 0, description: "initialized".into() },
            last_snapshot: None,
            position: None,
            base_currency: None,
            tx_history: Vec::new(),
            swap_history: Vec::new(),
            out_of_range_since: None,
            last_persist: now,
            last_error: None,
            exit_reason: None,
            recovery_attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    #[test]
    fn base_currency_single_base_when_one_side_recognized() {
        let usdt = addr(1);
        let other = addr(2);
        let quotes = [usdt];
        let base = BaseCurrency::infer(other, usdt, &quotes, usdt);
        assert_eq!(base.token, usdt);
        assert_eq!(base.scenario, Scenario::SingleBase);
    }

    #[test]
    fn base_currency_dual_non_base_falls_back_to_default() {
        let token_a = addr(3);
        let token_b = addr(4);
        let usdt = addr(1);
        let quotes = [usdt];
        let base = BaseCurrency::infer(token_a, token_b, &quotes, usdt);
        assert_eq!(base.token, usdt);
        assert_eq!(base.scenario, Scenario::DualNonBase);
    }

    #[test]
    fn strategy_config_validate_rejects_inverted_band() {
        let pool = PoolConfig { pool: addr(9), token0: addr(1), token1: addr(2), fee: 3000 };
        let cfg = StrategyConfig {
            pool: pool.clone(),
            input_token: pool.token0,
            input_amount: U256::from(100u64),
            lower_percent: 5.0,
            upper_percent: -5.0,
            swap_slippage_percent: 0.5,
            mint_slippage_percent: 1.0,
            swap_buffer_percent: 0.5,
            monitor_timeout: chrono::Duration::minutes(10),
            exit_token: ExitTokenSelector::NoPreference,
            base_currency_override: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn instance_status_live_and_terminal_classification() {
        assert!(InstanceStatus::Monitoring.is_live());
        assert!(!InstanceStatus::Paused.is_live());
        assert!(InstanceStatus::Exited.is_terminal());
        assert!(!InstanceStatus::Error.is_terminal());
    }
}
