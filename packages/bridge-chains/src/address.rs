//! Account addresses for both bridge chains.
//!
//! Both chains use 20-byte secp256k1 account ids. Chain A renders them as
//! `0x`-prefixed hex; chain B prepends a one-byte network version and renders
//! either base58check (`W...`) or prefixed hex (`41...`).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChainError, Result};

/// Default version byte for base58check addresses on the wallet-API chain.
pub const DEFAULT_ADDRESS_PREFIX: u8 = 0x41;

/// A 20-byte account or contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChainAddress(pub [u8; 20]);

impl ChainAddress {
    pub const ZERO: ChainAddress = ChainAddress([0u8; 20]);

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 20] = bytes.try_into().map_err(|_| {
            ChainError::invalid_address(hex::encode(bytes), "expected 20 bytes")
        })?;
        Ok(Self(raw))
    }

    /// Parse any of the accepted renderings.
    ///
    /// - `0x` + 40 hex chars
    /// - `prefix` byte + 20 bytes as 42 hex chars
    /// - base58check of `prefix` byte + 20 bytes
    pub fn parse(s: &str, prefix: u8) -> Result<Self> {
        let s = s.trim();
        if let Some(hex_part) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            if hex_part.len() != 40 {
                return Err(ChainError::invalid_address(s, "expected 40 hex characters"));
            }
            let bytes =
                hex::decode(hex_part).map_err(|e| ChainError::invalid_address(s, e.to_string()))?;
            return Self::from_bytes(&bytes);
        }

        if s.len() == 42 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let bytes = hex::decode(s).map_err(|e| ChainError::invalid_address(s, e.to_string()))?;
            if bytes[0] != prefix {
                return Err(ChainError::invalid_address(
                    s,
                    format!("unexpected version byte 0x{:02x}", bytes[0]),
                ));
            }
            return Self::from_bytes(&bytes[1..]);
        }

        let decoded = bs58::decode(s)
            .with_check(Some(prefix))
            .into_vec()
            .map_err(|e| ChainError::invalid_address(s, e.to_string()))?;
        if decoded.len() != 21 {
            return Err(ChainError::invalid_address(s, "expected 21-byte payload"));
        }
        Self::from_bytes(&decoded[1..])
    }

    /// Parse a `0x` hex address only.
    pub fn parse_hex(s: &str) -> Result<Self> {
        if !s.trim().starts_with("0x") && !s.trim().starts_with("0X") {
            return Err(ChainError::invalid_address(s, "missing 0x prefix"));
        }
        Self::parse(s, DEFAULT_ADDRESS_PREFIX)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Lowercase `0x` hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Version byte followed by the account, hex encoded without `0x`.
    pub fn to_prefixed_hex(&self, prefix: u8) -> String {
        format!("{:02x}{}", prefix, hex::encode(self.0))
    }

    pub fn to_base58(&self, prefix: u8) -> String {
        let mut payload = Vec::with_capacity(21);
        payload.push(prefix);
        payload.extend_from_slice(&self.0);
        bs58::encode(payload).with_check().into_string()
    }

    /// Left-pad into a 32-byte ABI word.
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&self.0);
        word
    }
}

impl fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<alloy::primitives::Address> for ChainAddress {
    fn from(address: alloy::primitives::Address) -> Self {
        ChainAddress(address.0 .0)
    }
}

/// Compare two rendered addresses: case-insensitive for `0x` hex, exact otherwise.
pub fn same_address(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    if a.starts_with("0x") && b.starts_with("0x") {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANVIL_ADDR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    #[test]
    fn test_parse_hex_roundtrip() {
        let addr = ChainAddress::parse(ANVIL_ADDR, DEFAULT_ADDRESS_PREFIX).unwrap();
        assert_eq!(addr.to_hex(), ANVIL_ADDR.to_lowercase());
        assert!(!addr.is_zero());
    }

    #[test]
    fn test_parse_rejects_short_hex() {
        let err = ChainAddress::parse("0x1234", DEFAULT_ADDRESS_PREFIX).unwrap_err();
        assert!(matches!(err, ChainError::InvalidAddress { .. }));
    }

    #[test]
    fn test_base58_and_prefixed_hex_agree() {
        let addr = ChainAddress::parse(ANVIL_ADDR, DEFAULT_ADDRESS_PREFIX).unwrap();

        let b58 = addr.to_base58(DEFAULT_ADDRESS_PREFIX);
        assert_eq!(b58.len(), 34);
        assert_eq!(ChainAddress::parse(&b58, DEFAULT_ADDRESS_PREFIX).unwrap(), addr);

        let prefixed = addr.to_prefixed_hex(DEFAULT_ADDRESS_PREFIX);
        assert!(prefixed.starts_with("41"));
        assert_eq!(
            ChainAddress::parse(&prefixed, DEFAULT_ADDRESS_PREFIX).unwrap(),
            addr
        );
    }

    #[test]
    fn test_base58_wrong_version_rejected() {
        let addr = ChainAddress([7u8; 20]);
        let b58 = addr.to_base58(0x49);
        assert!(ChainAddress::parse(&b58, DEFAULT_ADDRESS_PREFIX).is_err());
        assert_eq!(ChainAddress::parse(&b58, 0x49).unwrap(), addr);
    }

    #[test]
    fn test_base58_bad_checksum_rejected() {
        let addr = ChainAddress([7u8; 20]);
        let mut b58 = addr.to_base58(DEFAULT_ADDRESS_PREFIX);
        let last = b58.pop().unwrap();
        b58.push(if last == '1' { '2' } else { '1' });
        assert!(ChainAddress::parse(&b58, DEFAULT_ADDRESS_PREFIX).is_err());
    }

    #[test]
    fn test_to_word_left_pads() {
        let addr = ChainAddress([0xab; 20]);
        let word = addr.to_word();
        assert_eq!(&word[..12], &[0u8; 12]);
        assert_eq!(&word[12..], &[0xab; 20]);
    }

    #[test]
    fn test_same_address() {
        assert!(same_address("0xABCdef", "0xabcDEF"));
        assert!(!same_address("0xabc", "0xabd"));
        assert!(same_address("WAbc", "WAbc"));
        assert!(!same_address("WAbc", "Wabc"));
    }
}
