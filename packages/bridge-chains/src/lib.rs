//! Bridge chains: contract calls and local signing for the WEL/ETH bridge
//!
//! - **Addresses** - 20-byte accounts in hex, prefixed hex and base58check form
//! - **ABI** - argument encoding, selectors, keccak256/sha256
//! - **Signer** - local secp256k1 signing over a prehashed digest
//! - **RPC** - the `ChainRpc` boundary with a wallet-API client and an EVM client
//! - **Caller** - trigger, sign, broadcast protocol for one contract
//!
//! ## Feature Flags
//!
//! - `testing` - scripted in-process `MockChainRpc`

pub mod abi;
pub mod address;
pub mod caller;
pub mod error;
pub mod evm;
pub mod rpc;
pub mod signer;
pub mod wallet;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use address::{same_address, ChainAddress, DEFAULT_ADDRESS_PREFIX};
pub use caller::{
    claim_authorization_digest, role_id, sign_claim_authorization, CallReceipt, ContractCall,
    ContractCaller,
};
pub use error::ChainError;
pub use evm::EvmRpcClient;
pub use rpc::{
    parse_rpc_urls, BroadcastResult, ChainRpc, SignedTransaction, TransactionInfo, TriggerCall,
    UnsignedTransaction,
};
pub use signer::{RecoverableSignature, TxSigner};
pub use wallet::WalletHttpClient;

// Re-exported so downstream crates share one U256 type
pub use alloy::primitives::U256;
