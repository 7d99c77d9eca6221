//! Client for the wallet HTTP API (chain B)
//!
//! Transactions are protobuf bodies built by the node. The transaction id is
//! the SHA-256 of `raw_data_hex` and is also the digest that gets signed.

use alloy::primitives::U256;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::abi::sha256;
use crate::address::ChainAddress;
use crate::error::{ChainError, Result};
use crate::rpc::{
    BroadcastResult, ChainRpc, SignedTransaction, TransactionInfo, TriggerCall,
    UnsignedTransaction,
};
use crate::signer::RecoverableSignature;

pub const DUPLICATE_CODE: &str = "DUP_TRANSACTION_ERROR";

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    #[serde(default)]
    result: TriggerResult,
    #[serde(default)]
    energy_used: Option<u64>,
    #[serde(default)]
    transaction: Option<WalletTransaction>,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerResult {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WalletTransaction {
    #[serde(rename = "txID")]
    tx_id: String,
    raw_data: Value,
    raw_data_hex: String,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    txid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionInfoResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "blockNumber", default)]
    block_number: Option<u64>,
    #[serde(default)]
    fee: u64,
    #[serde(default)]
    receipt: Option<ReceiptResponse>,
    #[serde(default)]
    result: Option<String>,
    #[serde(rename = "resMessage", default)]
    res_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReceiptResponse {
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    balance: u64,
}

/// Node messages are usually hex-encoded UTF-8.
fn decode_message(message: Option<String>) -> String {
    let message = message.unwrap_or_default();
    hex::decode(&message)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or(message)
}

/// Wallet-API client with ordered URL fallback.
pub struct WalletHttpClient {
    client: Client,
    urls: Vec<String>,
    address_prefix: u8,
}

impl WalletHttpClient {
    pub fn new(urls: Vec<String>, address_prefix: u8) -> Result<Self> {
        if urls.is_empty() {
            return Err(ChainError::Rpc("at least one wallet API URL is required".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            urls,
            address_prefix,
        })
    }

    pub fn address_prefix(&self) -> u8 {
        self.address_prefix
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let mut last_err = None;
        for url in &self.urls {
            let endpoint = format!("{}{}", url, path);
            let response = self.client.post(&endpoint).json(body).send().await;
            match response {
                Ok(resp) if resp.status().is_success() => return Ok(resp.json::<T>().await?),
                Ok(resp) => {
                    warn!(path, status = %resp.status(), "Wallet API returned error status");
                    last_err = Some(ChainError::Rpc(format!(
                        "{} returned HTTP {}",
                        path,
                        resp.status()
                    )));
                }
                Err(e) => {
                    let err = ChainError::from(e);
                    warn!(path, error = %err, "Wallet API request failed, trying next URL");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ChainError::Rpc("no wallet API URL configured".into())))
    }
}

#[async_trait]
impl ChainRpc for WalletHttpClient {
    fn chain_name(&self) -> &str {
        "wel"
    }

    async fn trigger_contract(&self, call: &TriggerCall) -> Result<UnsignedTransaction> {
        let call_value: u64 = call
            .call_value
            .try_into()
            .map_err(|_| ChainError::Encoding("call value exceeds u64".into()))?;
        let body = json!({
            "owner_address": call.owner.to_prefixed_hex(self.address_prefix),
            "contract_address": call.contract.to_prefixed_hex(self.address_prefix),
            "function_selector": call.function_signature,
            "parameter": hex::encode(&call.parameter),
            "fee_limit": call.fee_limit,
            "call_value": call_value,
            "visible": false,
        });
        let response: TriggerResponse = self.post("/wallet/triggersmartcontract", &body).await?;

        let transaction = match (response.result.result, response.transaction) {
            (true, Some(tx)) => tx,
            (_, _) => {
                return Err(ChainError::TriggerFailed {
                    code: response.result.code.unwrap_or_else(|| "UNKNOWN".into()),
                    reason: decode_message(response.result.message),
                })
            }
        };

        debug!(
            tx_id = %transaction.tx_id,
            energy_used = ?response.energy_used,
            function = %call.function_signature,
            "Contract call built"
        );

        Ok(UnsignedTransaction {
            tx_id: transaction.tx_id,
            raw_data: transaction.raw_data,
            raw_data_hex: transaction.raw_data_hex,
            estimated_usage: response.energy_used,
        })
    }

    fn digest(&self, tx: &UnsignedTransaction) -> Result<[u8; 32]> {
        let raw = hex::decode(&tx.raw_data_hex)
            .map_err(|e| ChainError::Encoding(format!("raw_data_hex: {}", e)))?;
        let digest = sha256(&raw);
        if !tx.tx_id.eq_ignore_ascii_case(&hex::encode(digest)) {
            return Err(ChainError::EnvelopeMismatch(format!(
                "txID {} does not hash raw_data_hex",
                tx.tx_id
            )));
        }
        Ok(digest)
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
        let body = json!({
            "txID": tx.tx_id,
            "raw_data": tx.raw_data,
            "raw_data_hex": tx.raw_data_hex,
            "signature": tx.signature,
            "visible": false,
        });
        let response: BroadcastResponse = self.post("/wallet/broadcasttransaction", &body).await?;
        let code = response
            .code
            .unwrap_or_else(|| if response.result { "SUCCESS".into() } else { "UNKNOWN".into() });

        Ok(BroadcastResult {
            accepted: response.result,
            duplicate: code == DUPLICATE_CODE,
            code,
            message: decode_message(response.message),
            tx_id: response.txid.unwrap_or_else(|| tx.tx_id.clone()),
        })
    }

    async fn transaction_info(&self, tx_id: &str) -> Result<Option<TransactionInfo>> {
        let body = json!({ "value": tx_id });
        let response: TransactionInfoResponse =
            self.post("/wallet/gettransactioninfobyid", &body).await?;

        let Some(id) = response.id else {
            return Ok(None);
        };
        let failed = response.result.as_deref() == Some("FAILED")
            || response
                .receipt
                .as_ref()
                .and_then(|r| r.result.as_deref())
                .is_some_and(|r| r != "SUCCESS");

        Ok(Some(TransactionInfo {
            tx_id: id,
            block_number: response.block_number,
            success: !failed,
            fee: u128::from(response.fee),
            message: response.res_message.map(|m| decode_message(Some(m))),
        }))
    }

    async fn balance_of(&self, address: &ChainAddress) -> Result<U256> {
        let body = json!({
            "address": address.to_prefixed_hex(self.address_prefix),
            "visible": false,
        });
        let response: AccountResponse = self.post("/wallet/getaccount", &body).await?;
        Ok(U256::from(response.balance))
    }
}
