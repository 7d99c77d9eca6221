//! Hashing and Solidity ABI argument encoding
//!
//! Only the shapes the bridge contracts take are supported: static words
//! (address, uint256, bytes32) and dynamic `bytes`.

use alloy::primitives::U256;
use sha2::{Digest, Sha256};
use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Compute sha256 hash of data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// First four bytes of keccak256 of a canonical signature such as `transfer(address,uint256)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// A single ABI argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Address([u8; 20]),
    Uint(U256),
    FixedBytes32([u8; 32]),
    Bytes(Vec<u8>),
}

impl AbiValue {
    fn head_word(&self) -> Option<[u8; 32]> {
        match self {
            AbiValue::Address(addr) => {
                let mut word = [0u8; 32];
                word[12..].copy_from_slice(addr);
                Some(word)
            }
            AbiValue::Uint(value) => Some(value.to_be_bytes::<32>()),
            AbiValue::FixedBytes32(bytes) => Some(*bytes),
            AbiValue::Bytes(_) => None,
        }
    }
}

/// `abi.encode(values...)` without a selector.
pub fn encode(values: &[AbiValue]) -> Vec<u8> {
    let head_len = values.len() * 32;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for value in values {
        match value.head_word() {
            Some(word) => head.extend_from_slice(&word),
            None => {
                let offset = U256::from((head_len + tail.len()) as u64);
                head.extend_from_slice(&offset.to_be_bytes::<32>());
                if let AbiValue::Bytes(bytes) = value {
                    tail.extend_from_slice(&U256::from(bytes.len() as u64).to_be_bytes::<32>());
                    tail.extend_from_slice(bytes);
                    let padding = (32 - bytes.len() % 32) % 32;
                    tail.extend(std::iter::repeat(0u8).take(padding));
                }
            }
        }
    }

    head.extend_from_slice(&tail);
    head
}

/// Selector followed by the encoded arguments.
pub fn encode_call(signature: &str, values: &[AbiValue]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&encode(values));
    data
}
