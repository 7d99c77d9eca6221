//! Error taxonomy for ledger, claim and orchestration operations
//!
//! Errors are plain data so a terminal failure can be journaled with its
//! class and handed back to a caller after a restart. Retry decisions use
//! [`BridgeError::is_retryable`] only.

use bridge_chains::ChainError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BridgeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("Already claimed")]
    AlreadyClaimed,

    #[error("Request pending")]
    RequestPending,

    #[error("Inconsistent receiver address")]
    AddressMismatch,

    #[error("corresponding token not found: {0}")]
    TokenNotMapped(String),

    #[error("account {0} is locked")]
    AccountLocked(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("broadcast rejected ({code}): {reason}")]
    BroadcastRejected { code: String, reason: String },

    #[error("transaction {0} not yet confirmed")]
    NotYetConfirmed(String),

    #[error("claim transaction {0} failed on chain")]
    ClaimFailedOnChain(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("flow {0} is already running")]
    FlowAlreadyRunning(String),

    #[error("unknown flow type: {0}")]
    UnknownFlow(String),

    #[error("unknown activity: {0}")]
    UnknownActivity(String),

    #[error("flow history diverged: {0}")]
    NonDeterministic(String),

    #[error("flow canceled")]
    Canceled,
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Whether the orchestrator may re-run the failed step.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Rpc(_) | BridgeError::NotYetConfirmed(_) => true,
            BridgeError::Storage { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Stable label for metrics and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::NotFound(_) => "not_found",
            BridgeError::AlreadyClaimed => "already_claimed",
            BridgeError::RequestPending => "request_pending",
            BridgeError::AddressMismatch => "address_mismatch",
            BridgeError::TokenNotMapped(_) => "token_not_mapped",
            BridgeError::AccountLocked(_) => "account_locked",
            BridgeError::Validation(_) => "validation",
            BridgeError::InvalidTransition(_) => "invalid_transition",
            BridgeError::Storage { .. } => "storage",
            BridgeError::Rpc(_) => "rpc",
            BridgeError::BroadcastRejected { .. } => "broadcast_rejected",
            BridgeError::NotYetConfirmed(_) => "not_yet_confirmed",
            BridgeError::ClaimFailedOnChain(_) => "claim_failed_on_chain",
            BridgeError::Signing(_) => "signing",
            BridgeError::FlowAlreadyRunning(_) => "flow_already_running",
            BridgeError::UnknownFlow(_) => "unknown_flow",
            BridgeError::UnknownActivity(_) => "unknown_activity",
            BridgeError::NonDeterministic(_) => "non_deterministic",
            BridgeError::Canceled => "canceled",
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        BridgeError::Storage {
            message: message.into(),
            transient: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BridgeError::Validation(message.into())
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        let transient = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        );
        tracing::debug!(error = ?err, transient, "Storage error");
        let message = match &err {
            sqlx::Error::Database(db) => {
                format!("database rejected statement ({})", db.code().unwrap_or_default())
            }
            sqlx::Error::RowNotFound => "row not found".to_string(),
            sqlx::Error::ColumnDecode { index, .. } => format!("failed to decode column {index}"),
            _ if transient => "database unavailable".to_string(),
            _ => "database error".to_string(),
        };
        BridgeError::Storage { message, transient }
    }
}

impl From<ChainError> for BridgeError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Rpc(msg) => BridgeError::Rpc(msg),
            ChainError::BroadcastRejected { code, reason } => {
                BridgeError::BroadcastRejected { code, reason }
            }
            // The contract refused the call before anything was signed
            ChainError::TriggerFailed { code, reason } => {
                BridgeError::BroadcastRejected { code, reason }
            }
            ChainError::Signing(msg) => BridgeError::Signing(msg),
            ChainError::InvalidAddress { address, reason } => {
                BridgeError::Validation(format!("invalid address {address}: {reason}"))
            }
            ChainError::Encoding(msg) | ChainError::EnvelopeMismatch(msg) => {
                BridgeError::Validation(msg)
            }
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Validation(format!("malformed payload: {err}"))
    }
}
