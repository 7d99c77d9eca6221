//! WEL/ETH bridge operator - Library interface
//!
//! Ledger, claim lifecycle, durable flows and governance for the bridge.
//! The `weleth-bridge` binary wires these together; integration tests use
//! them directly.

pub mod api;
pub mod claim;
pub mod config;
pub mod db;
pub mod error;
pub mod governance;
pub mod metrics;
pub mod orchestrator;
pub mod service;
pub mod tokens;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{BridgeError, BridgeResult};
