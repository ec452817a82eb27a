//! Typed error taxonomy for the strategy engine.
//!
//! Internal pipeline operations return `Result<T, EngineError>`. Call sites outside the typed
//! pipeline (CLI bootstrap, config loading) use `anyhow::Result` with `.context(...)`, the way the
//! rest of the ambient stack does, and convert into `EngineError` only where a classification is
//! required.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("transient RPC failure on {0}")]
    RpcTransient(String),

    #[error("fatal RPC failure: {0}")]
    RpcFatal(String),

    #[error("insufficient balance of {token}: need {required}, have {available}")]
    InsufficientBalance {
        token: String,
        required: String,
        available: String,
    },

    #[error("insufficient allowance of {token} to {spender}")]
    InsufficientAllowance { token: String, spender: String },

    #[error("swap failed: insufficient liquidity for {0} -> {1}")]
    InsufficientLiquidity(String, String),

    #[error("swap quote expired")]
    QuoteExpired,

    #[error("mint reverted on slippage: {0}")]
    SlippageViolation(String),

    #[error("mint failed: {0}")]
    MintFailed(String),

    #[error("force-exit timed out after {elapsed_ms}ms; completed steps: {completed_steps:?}")]
    ForceExitTimedOut {
        elapsed_ms: u64,
        completed_steps: Vec<String>,
    },

    #[error("invalid tick range: lower={lower} upper={upper}")]
    InvalidTickRange { lower: i32, upper: i32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("recovery budget exhausted for instance {0}")]
    RecoveryBudgetExhausted(String),

    #[error("instance {0} is busy")]
    InstanceBusy(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),
}

impl EngineError {
    /// Whether a stage may attempt one local recovery (one approve, one re-quote, ...) before
    /// escalating to the instance's Error state, per the propagation policy in the error design.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::RpcTransient(_)
                | EngineError::InsufficientBalance { .. }
                | EngineError::InsufficientAllowance { .. }
                | EngineError::InsufficientLiquidity(_, _)
                | EngineError::QuoteExpired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_insufficient_are_locally_recoverable() {
        assert!(EngineError::RpcTransient("ladder".into()).is_locally_recoverable());
        assert!(EngineError::QuoteExpired.is_locally_recoverable());
    }

    #[test]
    fn slippage_and_mint_failed_are_not_recoverable() {
        assert!(!EngineError::SlippageViolation("STF".into()).is_locally_recoverable());
        assert!(!EngineError::MintFailed("revert".into()).is_locally_recoverable());
    }
}
