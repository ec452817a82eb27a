//! SwapRouter — aggregator-quoted token swaps used to cover amount shortfalls before mint.
//!
//! Mirrors the teacher's quote-then-approve-then-swap pipeline shape (see the old
//! `arbitrage/executor.rs`), but against a single external aggregator (0x-style `/swap/v1/quote`)
//! instead of a hardcoded Uniswap V2 router, and without the buy/sell leg-pair structure that only
//! made sense for cross-DEX arbitrage.

use crate::chain::contracts::IERC20;
use crate::error::{EngineError, EngineResult};
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::Provider;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SwapQuote {
    pub sell_token: Address,
    pub buy_token: Address,
    pub sell_amount: U256,
    pub buy_amount: U256,
    pub allowance_target: Address,
    pub to: Address,
    pub calldata: Bytes,
    pub value: U256,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub amount_in: U256,
    pub amount_out: U256,
    pub tx_hash: String,
}

/// Quote validity window: quotes older than this are rejected with `QuoteExpired` rather than
/// submitted, since aggregator calldata embeds a price the chain may have since moved past.
const QUOTE_TTL: Duration = Duration::from_secs(20);

#[async_trait::async_trait]
pub trait SwapRouter: Send + Sync {
    async fn quote(&self, sell_token: Address, buy_token: Address, sell_amount: U256, slippage_percent: f64) -> EngineResult<SwapQuote>;
    async fn swap(&self, quote: &SwapQuote, owner: Address) -> EngineResult<SwapOutcome>;
}

#[derive(Debug, Deserialize)]
struct AggregatorResponse {
    #[serde(rename = "buyAmount")]
    buy_amount: String,
    #[serde(rename = "allowanceTarget")]
    allowance_target: Address,
    to: Address,
    data: Bytes,
    #[serde(default)]
    value: Option<String>,
}

/// Aggregator-backed SwapRouter over any alloy `Provider` for submission and receipt polling.
pub struct AggregatorSwapRouter<P: Provider + Clone + Send + Sync + 'static> {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    provider: P,
}

impl<P: Provider + Clone + Send + Sync + 'static> AggregatorSwapRouter<P> {
    pub fn new(base_url: String, api_key: Option<String>, provider: P) -> Self {
        Self { http: reqwest::Client::new(), base_url, api_key, provider }
    }

    /// Approves `spender` for `amount` on `token` if the current allowance is insufficient,
    /// matching the teacher's `ensure_approval` step.
    async fn ensure_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) -> EngineResult<()> {
        let erc20 = IERC20::new(token, self.provider.clone());
        let current = erc20
            .allowance(owner, spender)
            .call()
            .await
            .map_err(|e| EngineError::RpcTransient(e.to_string()))?;
        if current >= amount {
            return Ok(());
        }
        debug!(%token, %spender, "allowance insufficient, approving max");
        let pending = erc20
            .approve(spender, U256::MAX)
            .send()
            .await
            .map_err(|e| EngineError::RpcFatal(e.to_string()))?;
        pending
            .get_receipt()
            .await
            .map_err(|e| EngineError::RpcFatal(format!("awaiting approval receipt: {e}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<P: Provider + Clone + Send + Sync + 'static> SwapRouter for AggregatorSwapRouter<P> {
    async fn quote(&self, sell_token: Address, buy_token: Address, sell_amount: U256, slippage_percent: f64) -> EngineResult<SwapQuote> {
        let mut request = self
            .http
            .get(format!("{}/swap/v1/quote", self.base_url))
            .query(&[
                ("sellToken", format!("{sell_token:?}")),
                ("buyToken", format!("{buy_token:?}")),
                ("sellAmount", sell_amount.to_string()),
                ("slippagePercentage", (slippage_percent / 100.0).to_string()),
            ]);
        if let Some(key) = &self.api_key {
            request = request.header("0x-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::RpcTransient(format!("aggregator request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, %body, "aggregator quote rejected");
            return Err(EngineError::InsufficientLiquidity(format!("{sell_token:?}"), format!("{buy_token:?}")));
        }
        let parsed: AggregatorResponse = response
            .json()
            .await
            .map_err(|e| EngineError::RpcFatal(format!("malformed aggregator response: {e}")))?;
        let buy_amount = U256::from_str_radix(&parsed.buy_amount, 10)
            .map_err(|e| EngineError::RpcFatal(format!("malformed buyAmount: {e}")))?;
        let value = parsed
            .value
            .map(|v| U256::from_str_radix(&v, 10).unwrap_or(U256::ZERO))
            .unwrap_or(U256::ZERO);
        Ok(SwapQuote {
            sell_token,
            buy_token,
            sell_amount,
            buy_amount,
            allowance_target: parsed.allowance_target,
            to: parsed.to,
            calldata: parsed.data,
            value,
            expires_at: chrono::Utc::now() + chrono::Duration::from_std(QUOTE_TTL).unwrap(),
        })
    }

    async fn swap(&self, quote: &SwapQuote, owner: Address) -> EngineResult<SwapOutcome> {
        if chrono::Utc::now() > quote.expires_at {
            return Err(EngineError::QuoteExpired);
        }
        self.ensure_allowance(quote.sell_token, owner, quote.allowance_target, quote.sell_amount).await?;

        let tx = alloy::rpc::types::TransactionRequest::default()
            .to(quote.to)
            .input(quote.calldata.clone().into())
            .value(quote.value);
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| EngineError::RpcFatal(format!("swap submission failed: {e}")))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| EngineError::RpcFatal(format!("awaiting swap receipt: {e}")))?;
        if !receipt.status() {
            return Err(EngineError::InsufficientLiquidity(format!("{:?}", quote.sell_token), format!("{:?}", quote.buy_token)));
        }
        Ok(SwapOutcome {
            amount_in: quote.sell_amount,
            amount_out: quote.buy_amount,
            tx_hash: format!("{:?}", receipt.transaction_hash),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ttl_is_twenty_seconds() {
        assert_eq!(QUOTE_TTL, Duration::from_secs(20));
    }
}
