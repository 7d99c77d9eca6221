//! Token mapping table
//!
//! Static bidirectional map between ETH and WEL token addresses, loaded once
//! at startup and read-only afterwards. A missing entry is an error, never a
//! default.

use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{BridgeError, BridgeResult};

/// One line of `tokens-map.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub eth: String,
    pub wel: String,
    #[serde(default)]
    pub eth_name: String,
    #[serde(default)]
    pub wel_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct TokenMap {
    pairs: Vec<TokenPair>,
    wel_by_eth: HashMap<String, usize>,
    eth_by_wel: HashMap<String, usize>,
}

// Hex addresses compare case-insensitively; base58 is case-sensitive
fn lookup_key(address: &str) -> String {
    let address = address.trim();
    if address.starts_with("0x") || address.starts_with("0X") {
        address.to_lowercase()
    } else {
        address.to_string()
    }
}

impl TokenMap {
    pub fn new(pairs: Vec<TokenPair>) -> Result<Self> {
        let mut wel_by_eth = HashMap::with_capacity(pairs.len());
        let mut eth_by_wel = HashMap::with_capacity(pairs.len());

        for (idx, pair) in pairs.iter().enumerate() {
            if pair.eth.trim().is_empty() || pair.wel.trim().is_empty() {
                return Err(eyre!("token map entry {} has an empty address", idx));
            }
            if wel_by_eth.insert(lookup_key(&pair.eth), idx).is_some() {
                return Err(eyre!("duplicate ETH token in map: {}", pair.eth));
            }
            if eth_by_wel.insert(lookup_key(&pair.wel), idx).is_some() {
                return Err(eyre!("duplicate WEL token in map: {}", pair.wel));
            }
        }

        Ok(Self {
            pairs,
            wel_by_eth,
            eth_by_wel,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let pairs: Vec<TokenPair> =
            serde_json::from_str(json).wrap_err("Failed to parse token map")?;
        Self::new(pairs)
    }

    /// Load the map from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read token map {}", path.display()))?;
        let map = Self::from_json(&json)?;
        info!(path = %path.display(), pairs = map.len(), "Loaded token map");
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[TokenPair] {
        &self.pairs
    }

    pub fn eth_to_wel(&self, eth_token: &str) -> BridgeResult<&str> {
        self.wel_by_eth
            .get(&lookup_key(eth_token))
            .map(|&idx| self.pairs[idx].wel.as_str())
            .ok_or_else(|| BridgeError::TokenNotMapped(eth_token.to_string()))
    }

    pub fn wel_to_eth(&self, wel_token: &str) -> BridgeResult<&str> {
        self.eth_by_wel
            .get(&lookup_key(wel_token))
            .map(|&idx| self.pairs[idx].eth.as_str())
            .ok_or_else(|| BridgeError::TokenNotMapped(wel_token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = r#"[
        {"eth": "0xdAC17F958D2ee523a2206206994597C13D831ec7", "wel": "WUsdtBridged111111111111111111111", "eth_name": "USDT", "wel_name": "wUSDT"},
        {"eth": "0x0000000000000000000000000000000000000000", "wel": "WEthWrapped22222222222222222222222"}
    ]"#;

    #[test]
    fn test_lookup_both_ways() {
        let map = TokenMap::from_json(MAP).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.eth_to_wel("0xdac17f958d2ee523a2206206994597c13d831ec7").unwrap(),
            "WUsdtBridged111111111111111111111"
        );
        assert_eq!(
            map.wel_to_eth("WUsdtBridged111111111111111111111").unwrap(),
            "0xdAC17F958D2ee523a2206206994597C13D831ec7"
        );
    }

    #[test]
    fn test_missing_mapping_is_error() {
        let map = TokenMap::from_json(MAP).unwrap();
        let err = map.eth_to_wel("0x1111111111111111111111111111111111111111").unwrap_err();
        assert!(matches!(err, BridgeError::TokenNotMapped(_)));
        assert!(err.to_string().starts_with("corresponding token not found"));

        // Base58 lookups are case-sensitive
        assert!(map.wel_to_eth("wusdtbridged111111111111111111111").is_err());
    }

    #[test]
    fn test_duplicates_rejected() {
        let dup = r#"[
            {"eth": "0xAA00000000000000000000000000000000000000", "wel": "W1"},
            {"eth": "0xaa00000000000000000000000000000000000000", "wel": "W2"}
        ]"#;
        assert!(TokenMap::from_json(dup).is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(TokenMap::from_json("{not json").is_err());
        assert!(TokenMap::from_json(r#"[{"eth": "", "wel": "W1"}]"#).is_err());
    }
}
