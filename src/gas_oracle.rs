//! GasOracle — current gas price with an RPC ladder, a stale-cache fallback, and a plausibility
//! band.
//!
//! Same `RwLock<Cache>` + TTL shape as the teacher's `tax/price_oracle.rs::PriceOracle`, adapted
//! from a pool-state-file price feed to a live RPC `eth_gasPrice` read; the provider-ladder retry
//! with a per-attempt timeout mirrors `chain/client.rs::AlloyChainClient::with_read_ladder`.

use crate::error::{EngineError, EngineResult};
use alloy::primitives::U256;
use alloy::providers::Provider;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::warn;

const ONE_GWEI: u128 = 1_000_000_000;

/// Gwei value served when every RPC in the ladder fails and the cache is empty or has aged past
/// `STALE_FALLBACK_BUDGET`, per §4.4's "documented conservative default".
const CONSERVATIVE_DEFAULT_GWEI: f64 = 1.0;

/// How long a stale cached snapshot may still be served after a failed refresh, per §4.4.
const STALE_FALLBACK_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct GasSnapshot {
    pub base_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
}

struct Cache {
    snapshot: Option<GasSnapshot>,
    last_updated: Option<Instant>,
}

/// Object-safe facade over `GasOracle<P>` so callers (Scheduler, InstanceMachine) don't need to
/// carry the provider type parameter through every signature.
#[async_trait::async_trait]
pub trait GasPriceSource: Send + Sync {
    async fn current(&self) -> EngineResult<GasSnapshot>;
}

/// RPC-backed gas price oracle. Retries a provider ladder on transient failure; when every
/// provider fails, falls back to the last cached snapshot if it's still within the freshness
/// budget, else to a conservative default.
pub struct GasOracle<P: Provider + Clone + Send + Sync + 'static> {
    providers: Vec<P>,
    cache: RwLock<Cache>,
    cache_ttl: Duration,
    read_timeout: Duration,
    min_gwei: f64,
    max_gwei: f64,
    priority_fee_gwei: f64,
}

impl<P: Provider + Clone + Send + Sync + 'static> GasOracle<P> {
    pub fn new(providers: Vec<P>, min_gwei: f64, max_gwei: f64, priority_fee_gwei: f64) -> Self {
        assert!(!providers.is_empty(), "provider ladder must not be empty");
        Self {
            providers,
            cache: RwLock::new(Cache { snapshot: None, last_updated: None }),
            cache_ttl: Duration::from_secs(12),
            read_timeout: Duration::from_secs(3),
            min_gwei,
            max_gwei,
            priority_fee_gwei,
        }
    }

    pub async fn current(&self) -> EngineResult<GasSnapshot> {
        let is_fresh = {
            let cache = self.cache.read().unwrap();
            cache.last_updated.map(|t| t.elapsed() < self.cache_ttl).unwrap_or(false)
        };
        if is_fresh {
            let cache = self.cache.read().unwrap();
            if let Some(snapshot) = cache.snapshot {
                return Ok(snapshot);
            }
        }
        match self.fetch_and_validate().await {
            Ok(snapshot) => {
                let mut cache = self.cache.write().unwrap();
                cache.snapshot = Some(snapshot);
                cache.last_updated = Some(Instant::now());
                Ok(snapshot)
            }
            Err(e) => {
                let cache = self.cache.read().unwrap();
                match (cache.snapshot, cache.last_updated) {
                    (Some(snapshot), Some(last_updated)) if last_updated.elapsed() < STALE_FALLBACK_BUDGET => {
                        warn!(error = %e, age_secs = last_updated.elapsed().as_secs(), "gas read failed, serving stale cache");
                        Ok(snapshot)
                    }
                    _ => {
                        warn!(error = %e, "gas read failed and cache exhausted its freshness budget, serving conservative default");
                        Ok(self.conservative_default())
                    }
                }
            }
        }
    }

    fn conservative_default(&self) -> GasSnapshot {
        let base_fee = from_gwei(CONSERVATIVE_DEFAULT_GWEI);
        let priority = from_gwei(self.priority_fee_gwei);
        GasSnapshot { base_fee_per_gas: base_fee, max_priority_fee_per_gas: priority, max_fee_per_gas: base_fee + priority }
    }

    async fn fetch_and_validate(&self) -> EngineResult<GasSnapshot> {
        let base_fee = self
            .with_read_ladder(|provider| async move {
                provider.get_gas_price().await.map(U256::from).map_err(|e| EngineError::RpcTransient(e.to_string()))
            })
            .await?;
        let gwei = to_gwei(base_fee);
        if gwei < self.min_gwei || gwei > self.max_gwei {
            return Err(EngineError::RpcTransient(format!(
                "gas price {gwei:.3} gwei outside plausible band [{}, {}]",
                self.min_gwei, self.max_gwei
            )));
        }
        let priority = from_gwei(self.priority_fee_gwei);
        Ok(GasSnapshot {
            base_fee_per_gas: base_fee,
            max_priority_fee_per_gas: priority,
            max_fee_per_gas: base_fee + priority,
        })
    }

    /// Retries `op` against the provider ladder in order, short-circuiting on the first success,
    /// matching `AlloyChainClient::with_read_ladder`.
    async fn with_read_ladder<T, F, Fut>(&self, op: F) -> EngineResult<T>
    where
        F: Fn(P) -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        let mut last_err = None;
        for (idx, provider) in self.providers.iter().enumerate() {
            match tokio::time::timeout(self.read_timeout, op(provider.clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!(provider_index = idx, error = %e, "gas price read failed, trying next provider");
                    last_err = Some(e);
                }
                Err(_) => {
                    warn!(provider_index = idx, "gas price read timed out, trying next provider");
                    last_err = Some(EngineError::RpcTransient(format!("provider {idx} timed out")));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::RpcFatal("no providers configured".into())))
    }
}

#[async_trait::async_trait]
impl<P: Provider + Clone + Send + Sync + 'static> GasPriceSource for GasOracle<P> {
    async fn current(&self) -> EngineResult<GasSnapshot> {
        self.current().await
    }
}

fn to_gwei(wei: U256) -> f64 {
    let wei: u128 = wei.try_into().unwrap_or(u128::MAX);
    wei as f64 / ONE_GWEI as f64
}

fn from_gwei(gwei: f64) -> U256 {
    U256::from((gwei * ONE_GWEI as f64) as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gwei_roundtrip() {
        let wei = from_gwei(30.5);
        assert!((to_gwei(wei) - 30.5).abs() < 0.001);
    }

    #[test]
    fn stale_fallback_budget_matches_spec() {
        assert_eq!(STALE_FALLBACK_BUDGET, Duration::from_secs(30));
    }

    #[test]
    fn conservative_default_is_within_typical_bands() {
        assert!(CONSERVATIVE_DEFAULT_GWEI > 0.05 && CONSERVATIVE_DEFAULT_GWEI < 50.0);
    }
}
