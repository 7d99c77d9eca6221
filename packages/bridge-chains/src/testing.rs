//! Scripted in-process chain for unit tests.
//!
//! Behaves like the wallet API: the transaction id is the SHA-256 of the raw
//! body. Broadcasts are recorded and, unless disabled, immediately become
//! visible through `transaction_info` as successful.

use alloy::primitives::U256;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::abi::sha256;
use crate::address::ChainAddress;
use crate::error::{ChainError, Result};
use crate::rpc::{
    BroadcastResult, ChainRpc, SignedTransaction, TransactionInfo, TriggerCall,
    UnsignedTransaction,
};
use crate::signer::RecoverableSignature;

#[derive(Default)]
struct MockState {
    triggers: Vec<TriggerCall>,
    broadcasts: Vec<SignedTransaction>,
    known: HashMap<String, TransactionInfo>,
    rejections: VecDeque<(String, String)>,
    trigger_failures: usize,
    broadcast_failures: usize,
    info_failures: usize,
    auto_confirm: bool,
    confirm_success: bool,
    counter: u64,
    balances: HashMap<ChainAddress, U256>,
}

pub struct MockChainRpc {
    name: String,
    state: Mutex<MockState>,
}

impl MockChainRpc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState {
                auto_confirm: true,
                confirm_success: true,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Next `n` trigger calls fail with a transport error.
    pub fn fail_next_triggers(&self, n: usize) {
        self.state().trigger_failures = n;
    }

    /// Next `n` accepted broadcasts reach the node but the caller sees a
    /// transport error, as when the response times out.
    pub fn fail_next_broadcasts(&self, n: usize) {
        self.state().broadcast_failures = n;
    }

    /// Next `n` transaction lookups fail with a transport error.
    pub fn fail_next_lookups(&self, n: usize) {
        self.state().info_failures = n;
    }

    pub fn reject_next_broadcast(&self, code: &str, reason: &str) {
        self.state()
            .rejections
            .push_back((code.to_string(), reason.to_string()));
    }

    /// When off, broadcasts stay pending until [`MockChainRpc::confirm`].
    pub fn set_auto_confirm(&self, enabled: bool) {
        self.state().auto_confirm = enabled;
    }

    /// Outcome recorded for auto-confirmed transactions.
    pub fn set_confirm_success(&self, success: bool) {
        self.state().confirm_success = success;
    }

    pub fn confirm(&self, tx_id: &str, success: bool) {
        self.state().known.insert(
            tx_id.to_string(),
            TransactionInfo {
                tx_id: tx_id.to_string(),
                block_number: Some(1),
                success,
                fee: 1_000,
                message: None,
            },
        );
    }

    pub fn set_balance(&self, address: ChainAddress, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    pub fn triggers(&self) -> Vec<TriggerCall> {
        self.state().triggers.clone()
    }

    pub fn broadcasts(&self) -> Vec<SignedTransaction> {
        self.state().broadcasts.clone()
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    fn chain_name(&self) -> &str {
        &self.name
    }

    async fn trigger_contract(&self, call: &TriggerCall) -> Result<UnsignedTransaction> {
        let mut state = self.state();
        if state.trigger_failures > 0 {
            state.trigger_failures -= 1;
            return Err(ChainError::Rpc("connection refused".into()));
        }
        state.counter += 1;
        state.triggers.push(call.clone());

        let mut raw = state.counter.to_be_bytes().to_vec();
        raw.extend_from_slice(&crate::abi::selector(&call.function_signature));
        raw.extend_from_slice(&call.parameter);

        Ok(UnsignedTransaction {
            tx_id: hex::encode(sha256(&raw)),
            raw_data: json!({ "contract": call.contract.to_hex(), "nonce": state.counter }),
            raw_data_hex: hex::encode(raw),
            estimated_usage: Some(10_000),
        })
    }

    fn digest(&self, tx: &UnsignedTransaction) -> Result<[u8; 32]> {
        let raw = hex::decode(&tx.raw_data_hex).map_err(|e| ChainError::Encoding(e.to_string()))?;
        Ok(sha256(&raw))
    }

    fn attach_signature(
        &self,
        tx: UnsignedTransaction,
        signature: &RecoverableSignature,
    ) -> Result<SignedTransaction> {
        Ok(SignedTransaction {
            tx_id: tx.tx_id,
            raw_data: tx.raw_data,
            raw_data_hex: tx.raw_data_hex,
            signature: vec![signature.to_hex()],
        })
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<BroadcastResult> {
        let mut state = self.state();
        if let Some((code, message)) = state.rejections.pop_front() {
            return Ok(BroadcastResult {
                accepted: false,
                duplicate: false,
                code,
                message,
                tx_id: tx.tx_id.clone(),
            });
        }
        if state.broadcasts.iter().any(|b| b.tx_id == tx.tx_id) {
            return Ok(BroadcastResult {
                accepted: false,
                duplicate: true,
                code: "DUP_TRANSACTION_ERROR".into(),
                message: "dup transaction".into(),
                tx_id: tx.tx_id.clone(),
            });
        }

        state.broadcasts.push(tx.clone());
        let timed_out = state.broadcast_failures > 0;
        if timed_out {
            state.broadcast_failures -= 1;
        }
        if state.auto_confirm {
            let success = state.confirm_success;
            let block_number = state.counter;
            state.known.insert(
                tx.tx_id.clone(),
                TransactionInfo {
                    tx_id: tx.tx_id.clone(),
                    block_number: Some(block_number),
                    success,
                    fee: 1_000,
                    message: None,
                },
            );
        }
        if timed_out {
            return Err(ChainError::Rpc("timeout".into()));
        }

        Ok(BroadcastResult {
            accepted: true,
            duplicate: false,
            code: "SUCCESS".into(),
            message: String::new(),
            tx_id: tx.tx_id.clone(),
        })
    }

    async fn transaction_info(&self, tx_id: &str) -> Result<Option<TransactionInfo>> {
        let mut state = self.state();
        if state.info_failures > 0 {
            state.info_failures -= 1;
            return Err(ChainError::Rpc("connection reset".into()));
        }
        Ok(state.known.get(tx_id).cloned())
    }

    async fn balance_of(&self, address: &ChainAddress) -> Result<U256> {
        Ok(self
            .state()
            .balances
            .get(address)
            .copied()
            .unwrap_or(U256::ZERO))
    }
}
