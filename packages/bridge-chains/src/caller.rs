//! Contract caller: build, sign and broadcast one contract invocation.
//!
//! The same protocol drives every call on both chains:
//!
//! 1. ABI-encode the arguments and trigger the contract on the node
//! 2. Digest the returned raw transaction body
//! 3. Sign the digest locally and attach the signature
//! 4. Broadcast and check the node's acceptance code
//!
//! Finality is not tracked here; callers poll [`ChainRpc::transaction_info`].

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::abi::{encode, keccak256, AbiValue};
use crate::address::ChainAddress;
use crate::error::{ChainError, Result};
use crate::rpc::{ChainRpc, SignedTransaction, TriggerCall};
use crate::signer::TxSigner;

pub const WITHDRAW_SIGNATURE: &str = "withdraw(address,address,uint256,uint256)";
pub const CLAIM_SIGNATURE: &str = "claim(address,address,uint256,uint256,bytes)";
pub const GRANT_ROLE_SIGNATURE: &str = "grantRole(bytes32,address)";
pub const REVOKE_ROLE_SIGNATURE: &str = "revokeRole(bytes32,address)";

pub const DEFAULT_ADMIN_ROLE: &str = "DEFAULT_ADMIN_ROLE";

/// Role identifier as used by access-controlled contracts.
pub fn role_id(name: &str) -> [u8; 32] {
    if name == DEFAULT_ADMIN_ROLE {
        [0u8; 32]
    } else {
        keccak256(name.as_bytes())
    }
}

/// Digest the administrative key signs to authorize a claim.
pub fn claim_authorization_digest(
    token: &ChainAddress,
    account: &ChainAddress,
    request_id: U256,
    amount: U256,
) -> [u8; 32] {
    keccak256(&encode(&[
        AbiValue::Address(token.0),
        AbiValue::Address(account.0),
        AbiValue::Uint(request_id),
        AbiValue::Uint(amount),
    ]))
}

/// Sign a claim authorization, `v` in {27, 28}.
pub fn sign_claim_authorization(
    signer: &TxSigner,
    token: &ChainAddress,
    account: &ChainAddress,
    request_id: U256,
    amount: U256,
) -> Result<Vec<u8>> {
    let digest = claim_authorization_digest(token, account, request_id, amount);
    Ok(signer.sign_digest(&digest)?.to_eth_bytes().to_vec())
}

/// One contract method invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub signature: &'static str,
    pub args: Vec<AbiValue>,
    pub call_value: U256,
}

impl ContractCall {
    /// Lock or burn `value` of `token` for `account` on the given network.
    pub fn withdraw(token: ChainAddress, account: ChainAddress, network_id: U256, value: U256) -> Self {
        // Native coin withdrawals carry the value with the call
        let call_value = if token.is_zero() { value } else { U256::ZERO };
        Self {
            signature: WITHDRAW_SIGNATURE,
            args: vec![
                AbiValue::Address(token.0),
                AbiValue::Address(account.0),
                AbiValue::Uint(network_id),
                AbiValue::Uint(value),
            ],
            call_value,
        }
    }

    /// Mint or release `amount` of `token` to `account` for a claim request.
    pub fn claim(
        token: ChainAddress,
        account: ChainAddress,
        request_id: U256,
        amount: U256,
        authorization: Vec<u8>,
    ) -> Self {
        Self {
            signature: CLAIM_SIGNATURE,
            args: vec![
                AbiValue::Address(token.0),
                AbiValue::Address(account.0),
                AbiValue::Uint(request_id),
                AbiValue::Uint(amount),
                AbiValue::Bytes(authorization),
            ],
            call_value: U256::ZERO,
        }
    }

    pub fn grant_role(role: &str, account: ChainAddress) -> Self {
        Self::role_call(GRANT_ROLE_SIGNATURE, role, account)
    }

    pub fn revoke_role(role: &str, account: ChainAddress) -> Self {
        Self::role_call(REVOKE_ROLE_SIGNATURE, role, account)
    }

    fn role_call(signature: &'static str, role: &str, account: ChainAddress) -> Self {
        Self {
            signature,
            args: vec![
                AbiValue::FixedBytes32(role_id(role)),
                AbiValue::Address(account.0),
            ],
            call_value: U256::ZERO,
        }
    }
}

/// Accepted broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReceipt {
    pub tx_id: String,
    /// The node already had this transaction
    pub already_known: bool,
    pub transaction: SignedTransaction,
}

/// Executes calls against one contract on one chain.
#[derive(Clone)]
pub struct ContractCaller {
    rpc: Arc<dyn ChainRpc>,
    contract: ChainAddress,
    fee_limit: u64,
}

impl ContractCaller {
    pub fn new(rpc: Arc<dyn ChainRpc>, contract: ChainAddress, fee_limit: u64) -> Self {
        Self {
            rpc,
            contract,
            fee_limit,
        }
    }

    pub fn contract(&self) -> ChainAddress {
        self.contract
    }

    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }

    /// Build and sign without broadcasting. The returned id is final.
    pub async fn prepare(&self, signer: &TxSigner, call: &ContractCall) -> Result<SignedTransaction> {
        let trigger = TriggerCall {
            owner: signer.address(),
            contract: self.contract,
            function_signature: call.signature.to_string(),
            parameter: encode(&call.args),
            call_value: call.call_value,
            fee_limit: self.fee_limit,
        };

        let unsigned = self.rpc.trigger_contract(&trigger).await?;
        let digest = self.rpc.digest(&unsigned)?;
        let signature = signer.sign_digest(&digest)?;
        self.rpc.attach_signature(unsigned, &signature)
    }

    /// Broadcast a prepared transaction and check the acceptance code.
    pub async fn broadcast(&self, signed: SignedTransaction) -> Result<CallReceipt> {
        let result = self.rpc.broadcast(&signed).await?;

        if result.duplicate {
            warn!(
                chain = self.rpc.chain_name(),
                tx_id = %signed.tx_id,
                "Transaction already known to node, treating as submitted"
            );
            return Ok(CallReceipt {
                tx_id: signed.tx_id.clone(),
                already_known: true,
                transaction: signed,
            });
        }

        if !result.accepted {
            return Err(ChainError::BroadcastRejected {
                code: result.code,
                reason: result.message,
            });
        }

        info!(
            chain = self.rpc.chain_name(),
            tx_id = %result.tx_id,
            "Transaction broadcast accepted"
        );

        Ok(CallReceipt {
            tx_id: result.tx_id,
            already_known: false,
            transaction: signed,
        })
    }

    pub async fn invoke(&self, signer: &TxSigner, call: &ContractCall) -> Result<CallReceipt> {
        let signed = self.prepare(signer, call).await?;
        self.broadcast(signed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChainRpc;

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn caller(rpc: Arc<MockChainRpc>) -> ContractCaller {
        ContractCaller::new(rpc, ChainAddress([0xcc; 20]), 100_000_000)
    }

    #[test]
    fn test_role_ids() {
        assert_eq!(role_id(DEFAULT_ADMIN_ROLE), [0u8; 32]);
        assert_eq!(role_id("AUTHENTICATOR_ROLE"), keccak256(b"AUTHENTICATOR_ROLE"));
    }

    #[test]
    fn test_withdraw_native_carries_value() {
        let call = ContractCall::withdraw(
            ChainAddress::ZERO,
            ChainAddress([1; 20]),
            U256::from(1u64),
            U256::from(500u64),
        );
        assert_eq!(call.call_value, U256::from(500u64));

        let token_call = ContractCall::withdraw(
            ChainAddress([2; 20]),
            ChainAddress([1; 20]),
            U256::from(1u64),
            U256::from(500u64),
        );
        assert_eq!(token_call.call_value, U256::ZERO);
    }

    #[tokio::test]
    async fn test_invoke_signs_and_broadcasts() {
        let rpc = Arc::new(MockChainRpc::new("wel"));
        let signer = TxSigner::from_hex(KEY).unwrap();
        let call = ContractCall::claim(
            ChainAddress([2; 20]),
            ChainAddress([3; 20]),
            U256::from(42u64),
            U256::from(100u64),
            vec![0u8; 65],
        );

        let receipt = caller(rpc.clone()).invoke(&signer, &call).await.unwrap();
        assert!(!receipt.already_known);

        let triggers = rpc.triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].function_signature, CLAIM_SIGNATURE);
        assert_eq!(triggers[0].owner, signer.address());
        assert_eq!(triggers[0].fee_limit, 100_000_000);

        let broadcasts = rpc.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].tx_id, receipt.tx_id);
        assert_eq!(broadcasts[0].signature.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_broadcast_carries_reason() {
        let rpc = Arc::new(MockChainRpc::new("wel"));
        rpc.reject_next_broadcast("CONTRACT_VALIDATE_ERROR", "balance is not sufficient");
        let signer = TxSigner::from_hex(KEY).unwrap();

        let err = caller(rpc)
            .invoke(&signer, &ContractCall::grant_role("AUTHENTICATOR_ROLE", ChainAddress([9; 20])))
            .await
            .unwrap_err();
        match err {
            ChainError::BroadcastRejected { code, reason } => {
                assert_eq!(code, "CONTRACT_VALIDATE_ERROR");
                assert_eq!(reason, "balance is not sufficient");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rpc_failure_is_transient() {
        let rpc = Arc::new(MockChainRpc::new("wel"));
        rpc.fail_next_triggers(1);
        let signer = TxSigner::from_hex(KEY).unwrap();
        let call = ContractCall::revoke_role("AUTHENTICATOR_ROLE", ChainAddress([9; 20]));

        let err = caller(rpc.clone()).invoke(&signer, &call).await.unwrap_err();
        assert!(err.is_transient());
        assert!(rpc.broadcasts().is_empty());

        assert!(caller(rpc).invoke(&signer, &call).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_broadcast_is_accepted() {
        let rpc = Arc::new(MockChainRpc::new("wel"));
        let signer = TxSigner::from_hex(KEY).unwrap();
        let call = ContractCall::grant_role("AUTHENTICATOR_ROLE", ChainAddress([9; 20]));
        let c = caller(rpc.clone());

        let signed = c.prepare(&signer, &call).await.unwrap();
        let first = c.broadcast(signed.clone()).await.unwrap();
        let second = c.broadcast(signed).await.unwrap();
        assert!(!first.already_known);
        assert!(second.already_known);
        assert_eq!(first.tx_id, second.tx_id);
    }

    #[test]
    fn test_claim_authorization_is_deterministic() {
        let signer = TxSigner::from_hex(KEY).unwrap();
        let token = ChainAddress([2; 20]);
        let account = ChainAddress([3; 20]);
        let a = sign_claim_authorization(&signer, &token, &account, U256::from(7u64), U256::from(100u64))
            .unwrap();
        let b = sign_claim_authorization(&signer, &token, &account, U256::from(7u64), U256::from(100u64))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 65);
        assert!(a[64] == 27 || a[64] == 28);

        let other = sign_claim_authorization(&signer, &token, &account, U256::from(8u64), U256::from(100u64))
            .unwrap();
        assert_ne!(a, other);
    }
}
