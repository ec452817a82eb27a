//! PnLTracker — read-path P&L projection over `position.created` / `position.closed` events.
//!
//! Decimal-based cost-basis accounting modeled on the teacher's `tax/mod.rs` TaxRecord fields
//! (cost basis, proceeds, gain/loss all as `rust_decimal::Decimal`), simplified to the two-event
//! lifecycle this engine actually has instead of a full IRS lot-tracking record.

use crate::event_bus::EventBus;
use crate::types::{InstanceId, Scenario};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstancePnl {
    pub instance_id: Option<InstanceId>,
    pub base_currency: Option<String>,
    pub total_in_base: Decimal,
    pub total_out_base: Decimal,
    pub gas_cost_base: Decimal,
    pub closed: bool,
}

impl InstancePnl {
    pub fn net_profit(&self) -> Decimal {
        self.total_out_base - self.total_in_base - self.gas_cost_base
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub instance_count: usize,
    pub closed_count: usize,
    pub total_net_profit_base: Decimal,
}

/// `position.created` payload fields the tracker consumes to seed cost basis.
#[derive(Debug, Deserialize)]
struct PositionCreatedPayload {
    instance_id: InstanceId,
    base_currency: String,
    scenario: Scenario,
    base_spent: Decimal,
}

/// `position.closed` payload fields the tracker consumes to finalize net profit.
#[derive(Debug, Deserialize)]
struct PositionClosedPayload {
    instance_id: InstanceId,
    base_received: Decimal,
    gas_cost_base: Decimal,
}

/// Maintains a DashMap of per-instance P&L, fed by EventBus subscriptions started via `spawn`.
/// Never writes back to InstanceState; it is strictly a projection.
pub struct PnLTracker {
    records: Arc<DashMap<InstanceId, InstancePnl>>,
}

impl PnLTracker {
    pub fn new() -> Self {
        Self { records: Arc::new(DashMap::new()) }
    }

    /// Spawns the background tasks that consume `position.created`/`position.closed` off the
    /// bus. Returns immediately; the tasks run for the lifetime of the returned JoinSet.
    pub fn spawn(&self, bus: Arc<EventBus>) -> tokio::task::JoinSet<()> {
        let mut set = tokio::task::JoinSet::new();

        let records = self.records.clone();
        let (_id, mut created_rx) = bus.subscribe("position.created");
        set.spawn(async move {
            loop {
                match created_rx.recv().await {
                    Ok(event) => match serde_json::from_value::<PositionCreatedPayload>(event.payload) {
                        Ok(payload) => {
                            let mut entry = records.entry(payload.instance_id).or_default();
                            entry.instance_id = Some(payload.instance_id);
                            entry.base_currency = Some(payload.base_currency);
                            entry.total_in_base += payload.base_spent;
                            let _ = payload.scenario;
                        }
                        Err(e) => warn!(error = %e, "malformed position.created payload"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "pnl tracker lagged on position.created");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let records = self.records.clone();
        let (_id, mut closed_rx) = bus.subscribe("position.closed");
        set.spawn(async move {
            loop {
                match closed_rx.recv().await {
                    Ok(event) => match serde_json::from_value::<PositionClosedPayload>(event.payload) {
                        Ok(payload) => {
                            let mut entry = records.entry(payload.instance_id).or_default();
                            entry.instance_id = Some(payload.instance_id);
                            entry.total_out_base += payload.base_received;
                            entry.gas_cost_base += payload.gas_cost_base;
                            entry.closed = true;
                        }
                        Err(e) => warn!(error = %e, "malformed position.closed payload"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "pnl tracker lagged on position.closed");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        set
    }

    pub fn instance(&self, id: InstanceId) -> Option<InstancePnl> {
        self.records.get(&id).map(|r| r.clone())
    }

    pub fn aggregate(&self) -> AggregateSummary {
        let mut summary = AggregateSummary::default();
        for entry in self.records.iter() {
            summary.instance_count += 1;
            if entry.closed {
                summary.closed_count += 1;
                summary.total_net_profit_base += entry.net_profit();
            }
        }
        summary
    }

    pub fn closed_instances(&self) -> Vec<InstancePnl> {
        self.records.iter().filter(|r| r.closed).map(|r| r.clone()).collect()
    }
}

impl Default for PnLTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn net_profit_is_out_minus_in_minus_gas() {
        let bus = Arc::new(EventBus::new(16, 16));
        let tracker = PnLTracker::new();
        let _handles = tracker.spawn(bus.clone());
        let id = uuid::Uuid::new_v4();

        bus.publish(
            "position.created",
            serde_json::json!({"instance_id": id, "base_currency": "USDT", "scenario": "SingleBase", "base_spent": "100"}),
        );
        bus.publish(
            "position.closed",
            serde_json::json!({"instance_id": id, "base_received": "110", "gas_cost_base": "2"}),
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let pnl = tracker.instance(id).unwrap();
        assert_eq!(pnl.net_profit(), dec!(8));
        assert!(pnl.closed);
    }

    #[test]
    fn aggregate_on_empty_tracker_is_zero() {
        let tracker = PnLTracker::new();
        let summary = tracker.aggregate();
        assert_eq!(summary.instance_count, 0);
        assert_eq!(summary.total_net_profit_base, Decimal::ZERO);
    }
}
