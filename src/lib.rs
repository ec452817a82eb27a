//! Concentrated-liquidity provisioning strategy engine.
//!
//! Owns the instance scheduler, the per-instance state machine, the liquidity-math / swap-routing
//! pipeline, the out-of-range monitor, the force-exit path, and the persistence + recovery layer.
//! The HTTP/WebSocket presentation layer is an external collaborator, not part of this crate.

pub mod chain;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod force_exit;
pub mod gas_oracle;
pub mod instance;
pub mod pnl;
pub mod scheduler;
pub mod store;
pub mod swap_router;
pub mod tick_math;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use event_bus::EventBus;
pub use force_exit::ForceExitManager;
pub use gas_oracle::GasOracle;
pub use instance::InstanceMachine;
pub use pnl::PnLTracker;
pub use scheduler::Scheduler;
pub use store::Store;
