//! Chain RPC boundary
//!
//! Every chain client exposes the same four-step surface the contract caller
//! drives: trigger (build + estimate), digest, attach signature, broadcast.
//! Signing itself happens in [`crate::signer`], never on the node.

use alloy::primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::ChainAddress;
use crate::error::Result;
use crate::signer::RecoverableSignature;

/// A contract invocation to be built by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerCall {
    pub owner: ChainAddress,
    pub contract: ChainAddress,
    /// Canonical signature, e.g. `claim(address,address,uint256,uint256,bytes)`
    pub function_signature: String,
    /// ABI-encoded arguments without the selector
    pub parameter: Vec<u8>,
    pub call_value: U256,
    /// Upper bound on fee (wallet API) or gas (EVM)
    pub fee_limit: u64,
}

/// Transaction envelope returned by a trigger call, not yet signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    /// Empty when the id depends on the signature
    pub tx_id: String,
    pub raw_data: serde_json::Value,
    pub raw_data_hex: String,
    /// Resource estimate reported by the node (energy or gas)
    pub estimated_usage: Option<u64>,
}

/// A signed transaction ready to broadcast.
///
/// `raw_data_hex` is whatever the chain broadcasts: the unsigned body for the
/// wallet API (signatures travel alongside) and the signed RLP for EVM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx_id: String,
    pub raw_data: serde_json::Value,
    pub raw_data_hex: String,
    pub signature: Vec<String>,
}

/// Immediate answer of the node to a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub accepted: bool,
    /// The node already holds this exact transaction
    pub duplicate: bool,
    pub code: String,
    pub message: String,
    pub tx_id: String,
}

/// Execution result of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub tx_id: String,
    pub block_number: Option<u64>,
    pub success: bool,
    /// Fee paid, in the chain's smallest unit
    pub fee: u128,
    pub message: Option<String>,
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Short name used in logs and metrics labels.
    fn chain_name(&self) -> &str;

    /// Ask the node to build and estimate a contract call.
    async fn trigger_contract(&self, call: &TriggerCall) -> Result<UnsignedTransaction>;

    /// Digest of the canonical raw encoding that the signature must cover.
    fn digest(&self, tx: &UnsignedTransaction) -> Result<[u8; 32]>;

    fn attach_signature(
        &self,
        tx: UnsignedTransaction,
        signature: &RecoverableSignature,
    ) -> Result<SignedTransaction>;

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<BroadcastResult>;

    /// `None` while the transaction is unknown or not yet included.
    async fn transaction_info(&self, tx_id: &str) -> Result<Option<TransactionInfo>>;

    async fn balance_of(&self, address: &ChainAddress) -> Result<U256>;
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multiple_urls() {
        let urls = parse_rpc_urls(" https://a.com/ , https://b.com,,https://c.com ");
        assert_eq!(urls, vec!["https://a.com", "https://b.com", "https://c.com"]);
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(parse_rpc_urls("").is_empty());
    }
}
