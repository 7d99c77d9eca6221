//! Error type shared by the chain clients and the contract caller.

use thiserror::Error;

/// Errors raised while building, signing or submitting chain transactions.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Transport or node failure. Safe to retry.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The node answered but refused the transaction.
    #[error("broadcast rejected ({code}): {reason}")]
    BroadcastRejected { code: String, reason: String },

    /// The trigger call was refused before anything was signed.
    #[error("contract trigger failed ({code}): {reason}")]
    TriggerFailed { code: String, reason: String },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("encoding error: {0}")]
    Encoding(String),

    /// The node returned a transaction envelope that does not match its own id.
    #[error("transaction envelope mismatch: {0}")]
    EnvelopeMismatch(String),
}

impl ChainError {
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// True for failures where re-sending the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Rpc(_))
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        // URLs may embed API keys
        ChainError::Rpc(err.without_url().to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
