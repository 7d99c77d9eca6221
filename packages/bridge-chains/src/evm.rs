//! JSON-RPC client for the EVM chain (chain A)
//!
//! Builds legacy EIP-155 transactions locally: the node only supplies nonce,
//! gas price and a gas estimate. The signing digest is keccak256 of the RLP
//! signing payload; the transaction id is keccak256 of the signed RLP.

use alloy::primitives::U256;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::abi::{keccak256, selector};
use crate::address::ChainAddress;
use crate::error::{ChainError, Result};
use crate::rpc::{
    BroadcastResult, ChainRpc, SignedTransaction, TransactionInfo, TriggerCall,
    UnsignedTransaction,
};
use crate::signer::RecoverableSignature;

/// EVM RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// EVM RPC error
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
    gas_used: Option<String>,
    effective_gas_price: Option<String>,
}

/// Fields of a legacy transaction, as carried in `raw_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub to: ChainAddress,
    pub value: U256,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub chain_id: u64,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

impl LegacyTransaction {
    fn fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp::uint(&self.nonce.to_be_bytes()),
            rlp::uint(&self.gas_price.to_be_bytes::<32>()),
            rlp::uint(&self.gas.to_be_bytes()),
            rlp::bytes(self.to.as_bytes()),
            rlp::uint(&self.value.to_be_bytes::<32>()),
            rlp::bytes(&self.data),
        ]
    }

    /// EIP-155 signing payload: the six fields followed by `chain_id, 0, 0`.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut items = self.fields();
        items.push(rlp::uint(&self.chain_id.to_be_bytes()));
        items.push(rlp::uint(&[]));
        items.push(rlp::uint(&[]));
        rlp::list(&items)
    }

    pub fn signed_payload(&self, signature: &RecoverableSignature) -> Vec<u8> {
        let v = self.chain_id * 2 + 35 + u64::from(signature.recovery_id);
        let mut items = self.fields();
        items.push(rlp::uint(&v.to_be_bytes()));
        items.push(rlp::uint(&signature.r));
        items.push(rlp::uint(&signature.s));
        rlp::list(&items)
    }
}

/// Minimal RLP encoding for byte strings and flat lists.
mod rlp {
    fn length_prefix(len: usize, offset: u8) -> Vec<u8> {
        if len < 56 {
            vec![offset + len as u8]
        } else {
            let len_bytes = strip_leading_zeros(&(len as u64).to_be_bytes()).to_vec();
            let mut out = vec![offset + 55 + len_bytes.len() as u8];
            out.extend_from_slice(&len_bytes);
            out
        }
    }

    fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        &bytes[first..]
    }

    pub fn bytes(data: &[u8]) -> Vec<u8> {
        if data.len() == 1 && data[0] < 0x80 {
            return vec![data[0]];
        }
        let mut out = length_prefix(data.len(), 0x80);
        out.extend_from_slice(data);
        out
    }

    /// Big-endian integer, minimal encoding.
    pub fn uint(be: &[u8]) -> Vec<u8> {
        bytes(strip_leading_zeros(be))
    }

    pub fn list(items: &[Vec<u8>]) -> Vec<u8> {
        let payload: Vec<u8> = items.concat();
        let mut out = length_prefix(payload.len(), 0xc0);
        out.extend_from_slice(&payload);
        out
    }
}

fn parse_quantity(hex_str: &str) -> Result<U256> {
    U256::from_str_radix(hex_str.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Encoding(format!("invalid quantity {}: {}", hex_str, e)))
}

fn parse_u64(hex_str: &str) -> Result<u64> {
    u64::from_str_radix(hex_str.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Encoding(format!("invalid quantity {}: {}", hex_str, e)))
}

/// EVM JSON-RPC client with ordered URL fallback.
pub struct EvmRpcClient {
    client: Client,
    urls: Vec<String>,
    chain_id: u64,
}

impl EvmRpcClient {
    pub fn new(urls: Vec<String>, chain_id: u64) -> Result<Self> {
        if urls.is_empty() {
            return Err(ChainError::Rpc("at least one EVM RPC URL is required".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            urls,
            chain_id,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Send one request; a JSON-RPC error is returned inside `Ok`.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<RpcResponse<T>> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let mut last_err = None;
        for url in &self.urls {
            match self.client.post(url).json(&body).send().await {
                Ok(resp) => return Ok(resp.json::<RpcResponse<T>>().await?),
                Err(e) => {
                    let err = ChainError::from(e);
                    warn!(method, error = %err, "EVM RPC request failed, trying next URL");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ChainError::Rpc("no EVM RPC URL configured".into())))
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let response = self.request::<T>(method, params).await?;
        if let Some(error) = response.error {
            return Err(ChainError::Rpc(format!(
                "{}: {} - {}",
                method, error.code, error.message
            )));
        }
        response
            .result
            .ok_or_else(|| ChainError::Rpc(format!("{}: empty result", method)))
    }
}

#[async_trait]
impl ChainRpc for EvmRpcClient {
    fn chain_name(&self) -> &str {
        "eth"
    }

    async fn trigger_contract(&self, call: &TriggerCall) -> Result<UnsignedTransaction> {
        let mut data = selector(&call.function_signature).to_vec();
        data.extend_from_slice(&call.parameter);

        let from = call.owner.to_hex();
        let nonce: String = self
            .call("eth_getTransactionCount", json!([from, "pending"]))
            .await?;
        let gas_price: String = self.call("eth_gasPrice", json!([])).await?;

        let estimate = self
            .request::<String>(
                "eth_estimateGas",
                json!([{
                    "from": from,
                    "to": call.contract.to_hex(),
                    "data": format!("0x{}", hex::encode(&data)),
                    "value": format!("0x{:x}", call.call_value),
                }]),
            )
            .await?;
        if let Some(error) = estimate.error {
            return Err(ChainError::TriggerFailed {
                code: error.code.to_string(),
                reason: error.message,
            });
        }
        let estimated = parse_u64(
            &estimate
                .result
                .ok_or_else(|| ChainError::Rpc("eth_estimateGas: empty result".into()))?,
        )?;

        // 20% headroom, capped by the configured limit
        let mut gas = estimated.saturating_mul(6) / 5;
        if call.fee_limit > 0 {
            gas = gas.min(call.fee_limit);
        }

        let tx = LegacyTransaction {
            nonce: parse_u64(&nonce)?,
            gas_price: parse_quantity(&gas_price)?,
            gas,
            to: call.contract,
            value: call.call_value,
            data,
            chain_id: self.chain_id,
        };
        debug!(
            nonce = tx.nonce,
            gas = tx.gas,
            function = %call.function_signature,
            "EVM contract call built"
        );

        Ok(UnsignedTransaction {
            tx_id: String::new(),
            raw_data_hex: hex::encode(tx.signing_payload()),
            raw_data: serde_json::to_value(&tx).map_err(|e| ChainError::Encoding(e.to_string()))?,
            estimated_usage: Some(estimated),
        })
    }

    fn digest(&self, tx: &UnsignedTransaction) -> Result<[u8; 32]> {
        let legacy: LegacyTransaction = serde_json::from_value(tx.raw_data.clone())
            .map_err(|e| ChainError::Encoding(e.to_string()))?;
        let payload = legacy.signing_payload();
        if hex::encode(&payload) != tx.raw_data_hex.to_lowercase() {
            return Err(ChainError::EnvelopeMismatch(
                "raw_data_hex does not encode raw_data".into(),
            ));
        }
        Ok(keccak256(&payload))
    }

    fn attach_signature(
        &self,
        tx: UnsignedTransaction,
        signature: &RecoverableSignature,
    ) -> Result<SignedTransaction> {
        let legacy: LegacyTransaction = serde_json::from_value(tx.raw_data.clone())
            .map_err(|e| ChainError::Encoding(e.to_string()))?;
        let signed = legacy.signed_payload(signature);
        Ok(SignedTransaction {
            tx_id: format!("0x{}", hex::encode(keccak256(&signed))),
            raw_data: tx.raw_data,
            raw_data_hex: hex::encode(signed),
            signature: vec![hex::encode(signature.to_bytes())],
        })
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<BroadcastResult> {
        let response = self
            .request::<String>(
                "eth_sendRawTransaction",
                json!([format!("0x{}", tx.raw_data_hex)]),
            )
            .await?;

        match (response.result, response.error) {
            (Some(hash), None) => Ok(BroadcastResult {
                accepted: true,
                duplicate: false,
                code: "SUCCESS".into(),
                message: String::new(),
                tx_id: hash,
            }),
            (_, Some(error)) => {
                let duplicate = error.message.to_lowercase().contains("already known");
                Ok(BroadcastResult {
                    accepted: false,
                    duplicate,
                    code: if duplicate {
                        "ALREADY_KNOWN".into()
                    } else {
                        error.code.to_string()
                    },
                    message: error.message,
                    tx_id: tx.tx_id.clone(),
                })
            }
            (None, None) => Err(ChainError::Rpc("eth_sendRawTransaction: empty result".into())),
        }
    }

    async fn transaction_info(&self, tx_id: &str) -> Result<Option<TransactionInfo>> {
        let response = self
            .request::<TransactionReceipt>("eth_getTransactionReceipt", json!([tx_id]))
            .await?;
        if let Some(error) = response.error {
            return Err(ChainError::Rpc(format!(
                "eth_getTransactionReceipt: {} - {}",
                error.code, error.message
            )));
        }
        let Some(receipt) = response.result else {
            return Ok(None);
        };
        let Some(block) = receipt.block_number.as_deref() else {
            return Ok(None);
        };

        let gas_used = receipt.gas_used.as_deref().map(parse_quantity).transpose()?;
        let price = receipt
            .effective_gas_price
            .as_deref()
            .map(parse_quantity)
            .transpose()?;
        let fee = match (gas_used, price) {
            (Some(g), Some(p)) => g.saturating_mul(p).try_into().unwrap_or(u128::MAX),
            _ => 0,
        };

        Ok(Some(TransactionInfo {
            tx_id: receipt.transaction_hash,
            block_number: Some(parse_u64(block)?),
            success: receipt.status.as_deref() == Some("0x1"),
            fee,
            message: None,
        }))
    }

    async fn balance_of(&self, address: &ChainAddress) -> Result<U256> {
        let balance: String = self
            .call("eth_getBalance", json!([address.to_hex(), "latest"]))
            .await?;
        parse_quantity(&balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::TxSigner;

    /// The worked example from EIP-155.
    fn eip155_example() -> LegacyTransaction {
        LegacyTransaction {
            nonce: 9,
            gas_price: U256::from(20_000_000_000u64),
            gas: 21000,
            to: ChainAddress([0x35; 20]),
            value: U256::from(1_000_000_000_000_000_000u64),
            data: vec![],
            chain_id: 1,
        }
    }

    #[test]
    fn test_eip155_signing_payload() {
        assert_eq!(
            hex::encode(eip155_example().signing_payload()),
            "ec098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a764000080018080"
        );
        assert_eq!(
            hex::encode(keccak256(&eip155_example().signing_payload())),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn test_eip155_signed_transaction() {
        let client = EvmRpcClient::new(vec!["http://localhost:8545".into()], 1).unwrap();
        let tx = eip155_example();
        let unsigned = UnsignedTransaction {
            tx_id: String::new(),
            raw_data: serde_json::to_value(&tx).unwrap(),
            raw_data_hex: hex::encode(tx.signing_payload()),
            estimated_usage: None,
        };

        let signer =
            TxSigner::from_hex("4646464646464646464646464646464646464646464646464646464646464646")
                .unwrap();
        let digest = client.digest(&unsigned).unwrap();
        let signature = signer.sign_digest(&digest).unwrap();
        let signed = client.attach_signature(unsigned, &signature).unwrap();

        assert_eq!(
            signed.raw_data_hex,
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
        assert!(signed.tx_id.starts_with("0x"));
        assert_eq!(signed.tx_id.len(), 66);
    }

    #[test]
    fn test_digest_rejects_tampered_body() {
        let client = EvmRpcClient::new(vec!["http://localhost:8545".into()], 1).unwrap();
        let tx = eip155_example();
        let mut other = tx.clone();
        other.nonce = 10;
        let unsigned = UnsignedTransaction {
            tx_id: String::new(),
            raw_data: serde_json::to_value(&tx).unwrap(),
            raw_data_hex: hex::encode(other.signing_payload()),
            estimated_usage: None,
        };
        assert!(matches!(
            client.digest(&unsigned),
            Err(ChainError::EnvelopeMismatch(_))
        ));
    }

    #[test]
    fn test_rlp_long_string_prefix() {
        let encoded = rlp::bytes(&[0xaa; 60]);
        assert_eq!(&encoded[..2], &[0xb8, 60]);
        assert_eq!(encoded.len(), 62);
        assert_eq!(rlp::bytes(&[0x05]), vec![0x05]);
        assert_eq!(rlp::uint(&[0, 0]), vec![0x80]);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x10").unwrap(), U256::from(16u64));
        assert_eq!(parse_u64("0x5208").unwrap(), 21000);
        assert!(parse_u64("0xzz").is_err());
    }
}
