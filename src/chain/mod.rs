//! On-chain access: contract bindings plus the retrying ChainClient built on top of them.

pub mod client;
pub mod contracts;

pub use client::{
    AlloyChainClient, ChainClient, CloseOutcome, MintOutcome, MintParams, PoolState, PositionInfo,
    TokenMeta, TxReceipt,
};
