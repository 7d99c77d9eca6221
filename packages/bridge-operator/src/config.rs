use bridge_chains::{parse_rpc_urls, ChainAddress, DEFAULT_ADDRESS_PREFIX};
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::claim::DEFAULT_REQUEST_TTL_SECS;

/// Secret string that never shows up in Debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Redacted(String);

impl Redacted {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Redacted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Main configuration for the bridge service
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub eth: EthConfig,
    pub wel: WelConfig,
    pub bridge: BridgeConfig,
    pub api: ApiConfig,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Redacted,
    pub max_connections: u32,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// ETH side: JSON-RPC endpoints and contracts
#[derive(Debug, Clone)]
pub struct EthConfig {
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    pub bridge_address: String,
    pub governance_address: String,
    pub treasury_address: String,
    pub gas_limit: u64,
}

/// WEL side: wallet HTTP API endpoints and contracts
#[derive(Debug, Clone)]
pub struct WelConfig {
    pub rpc_urls: Vec<String>,
    pub bridge_address: String,
    pub governance_address: String,
    pub fee_limit: u64,
    /// base58check version byte
    pub address_prefix: u8,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub admin_private_key: Option<Redacted>,
    pub tokens_map_path: PathBuf,
    pub claim_request_ttl_secs: i64,
    pub bridge_queue_workers: usize,
    pub governance_queue_workers: usize,
    /// Zero disables the sweeper
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

fn default_db_connections() -> u32 {
    10
}

fn default_eth_gas_limit() -> u64 {
    500_000
}

fn default_wel_fee_limit() -> u64 {
    100_000_000
}

fn default_bridge_workers() -> usize {
    16
}

fn default_governance_workers() -> usize {
    4
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_api_port() -> u16 {
    9090
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| eyre!("{} environment variable is required", key))
}

fn parsed_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| eyre!("{} is invalid: {}", key, e)),
        _ => Ok(default),
    }
}

fn parse_prefix(raw: &str) -> Result<u8> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse(),
    }
    .wrap_err_with(|| format!("WEL_ADDRESS_PREFIX must be a byte, got {}", raw))
}

impl Config {
    /// Load configuration from `.env` if present, then the process environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
            tracing::debug!("Loaded .env from {}", path);
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build and validate a configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database = DatabaseConfig {
            url: Redacted::new(required(&lookup, "DATABASE_URL")?),
            max_connections: parsed_or(&lookup, "DATABASE_MAX_CONNECTIONS", default_db_connections())?,
        };

        let eth_bridge = required(&lookup, "ETH_BRIDGE_ADDRESS")?;
        let eth = EthConfig {
            rpc_urls: parse_rpc_urls(&required(&lookup, "ETH_RPC_URL")?),
            chain_id: required(&lookup, "ETH_CHAIN_ID")?
                .trim()
                .parse()
                .wrap_err("ETH_CHAIN_ID must be a valid u64")?,
            governance_address: lookup("ETH_GOVERNANCE_ADDRESS")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| eth_bridge.clone()),
            bridge_address: eth_bridge,
            treasury_address: required(&lookup, "ETH_TREASURY_ADDRESS")?,
            gas_limit: parsed_or(&lookup, "ETH_GAS_LIMIT", default_eth_gas_limit())?,
        };

        let wel_bridge = required(&lookup, "WEL_BRIDGE_ADDRESS")?;
        let wel = WelConfig {
            rpc_urls: parse_rpc_urls(&required(&lookup, "WEL_RPC_URL")?),
            governance_address: lookup("WEL_GOVERNANCE_ADDRESS")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| wel_bridge.clone()),
            bridge_address: wel_bridge,
            fee_limit: parsed_or(&lookup, "WEL_FEE_LIMIT", default_wel_fee_limit())?,
            address_prefix: match lookup("WEL_ADDRESS_PREFIX") {
                Some(raw) if !raw.trim().is_empty() => parse_prefix(&raw)?,
                _ => DEFAULT_ADDRESS_PREFIX,
            },
        };

        let bridge = BridgeConfig {
            admin_private_key: lookup("ADMIN_PRIVATE_KEY")
                .filter(|v| !v.trim().is_empty())
                .map(Redacted::new),
            tokens_map_path: lookup("TOKENS_MAP_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tokens-map.json")),
            claim_request_ttl_secs: parsed_or(&lookup, "CLAIM_REQUEST_TTL_SECS", DEFAULT_REQUEST_TTL_SECS)?,
            bridge_queue_workers: parsed_or(&lookup, "BRIDGE_QUEUE_WORKERS", default_bridge_workers())?,
            governance_queue_workers: parsed_or(
                &lookup,
                "GOVERNANCE_QUEUE_WORKERS",
                default_governance_workers(),
            )?,
            sweep_interval_secs: parsed_or(&lookup, "SWEEP_INTERVAL_SECS", default_sweep_interval())?,
        };

        let api = ApiConfig {
            bind_address: lookup("API_BIND_ADDRESS")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parsed_or(&lookup, "API_PORT", default_api_port())?,
        };

        let config = Config {
            database,
            eth,
            wel,
            bridge,
            api,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.eth.rpc_urls.is_empty() {
            return Err(eyre!("ETH_RPC_URL cannot be empty"));
        }
        if self.wel.rpc_urls.is_empty() {
            return Err(eyre!("WEL_RPC_URL cannot be empty"));
        }

        for (name, address) in [
            ("ETH_BRIDGE_ADDRESS", &self.eth.bridge_address),
            ("ETH_GOVERNANCE_ADDRESS", &self.eth.governance_address),
            ("ETH_TREASURY_ADDRESS", &self.eth.treasury_address),
        ] {
            ChainAddress::parse_hex(address)
                .map_err(|e| eyre!("{} must be a 0x hex address: {}", name, e))?;
        }
        for (name, address) in [
            ("WEL_BRIDGE_ADDRESS", &self.wel.bridge_address),
            ("WEL_GOVERNANCE_ADDRESS", &self.wel.governance_address),
        ] {
            ChainAddress::parse(address, self.wel.address_prefix)
                .map_err(|e| eyre!("{} is not a valid address: {}", name, e))?;
        }

        if let Some(key) = &self.bridge.admin_private_key {
            let key = key.expose();
            if key.len() != 66 || !key.starts_with("0x") {
                return Err(eyre!("ADMIN_PRIVATE_KEY must be 66 chars (0x + 64 hex chars)"));
            }
        }

        if self.bridge.claim_request_ttl_secs <= 0 {
            return Err(eyre!("CLAIM_REQUEST_TTL_SECS must be positive"));
        }
        if self.bridge.bridge_queue_workers == 0 || self.bridge.governance_queue_workers == 0 {
            return Err(eyre!("queue worker counts must be at least 1"));
        }

        Ok(())
    }
}
