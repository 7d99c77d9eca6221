//! Local transaction signing
//!
//! Wraps alloy's `PrivateKeySigner`. Keys never leave the process: the chain
//! clients hand over a 32-byte digest and receive a recoverable signature.

use alloy::primitives::B256;
use alloy::signers::{local::PrivateKeySigner, SignerSync};
use std::fmt;

use crate::address::ChainAddress;
use crate::error::{ChainError, Result};

/// secp256k1 signature with its recovery id (0 or 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_id: u8,
}

impl RecoverableSignature {
    /// `r || s || recovery_id`, the layout the wallet API expects.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.recovery_id;
        out
    }

    /// `r || s || v` with `v` in {27, 28}, the layout `ecrecover` expects.
    pub fn to_eth_bytes(&self) -> [u8; 65] {
        let mut out = self.to_bytes();
        out[64] += 27;
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Private key holder used by the contract caller.
#[derive(Clone)]
pub struct TxSigner {
    inner: PrivateKeySigner,
    address: ChainAddress,
}

impl fmt::Debug for TxSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxSigner")
            .field("address", &self.address)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl TxSigner {
    /// Parse a hex private key, with or without `0x`.
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let inner: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|_| ChainError::Signing("invalid private key".to_string()))?;
        let address = ChainAddress::from(inner.address());
        Ok(Self { inner, address })
    }

    pub fn address(&self) -> ChainAddress {
        self.address
    }

    /// Sign a prehashed 32-byte digest.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<RecoverableSignature> {
        let signature = self
            .inner
            .sign_hash_sync(&B256::from(*digest))
            .map_err(|e| ChainError::Signing(e.to_string()))?;

        let bytes = signature.as_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        let recovery_id = match bytes[64] {
            v @ (0 | 1) => v,
            v @ (27 | 28) => v - 27,
            v => return Err(ChainError::Signing(format!("unexpected recovery byte {v}"))),
        };

        Ok(RecoverableSignature { r, s, recovery_id })
    }
}
