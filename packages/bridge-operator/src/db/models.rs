use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{
    AccountStatus, ClaimRequestStatus, ClaimStatus, DepositStatus, Direction, TreasuryStatus,
};

// Amounts are decimal strings. The database stores NUMERIC(78,0): inserts cast
// with $n::NUMERIC and selects read amount::TEXT.

/// One directional value movement between the chains.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct CashTransaction {
    pub id: i64,
    pub direction: Direction,
    pub request_id: Option<String>,
    pub deposit_tx_hash: Option<String>,
    pub claim_tx_hash: Option<String>,
    /// Treasury deposit this record consumed, if any
    pub treasury_tx_id: Option<String>,
    pub source_token_addr: String,
    pub dest_token_addr: String,
    pub source_wallet_addr: String,
    pub dest_wallet_addr: String,
    pub network_id: String,
    pub amount: String,
    pub fee: String,
    pub deposit_status: DepositStatus,
    pub claim_status: ClaimStatus,
    pub deposit_at: DateTime<Utc>,
    pub claim_at: Option<DateTime<Utc>>,
}

/// For inserting new cash transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCashTransaction {
    pub direction: Direction,
    pub deposit_tx_hash: String,
    /// When set, the treasury deposit flips to `isCashin` in the same transaction
    pub treasury_tx_id: Option<String>,
    pub source_token_addr: String,
    pub dest_token_addr: String,
    pub source_wallet_addr: String,
    pub dest_wallet_addr: String,
    pub network_id: String,
    pub amount: String,
    pub fee: String,
    pub deposit_status: DepositStatus,
    pub deposit_at: DateTime<Utc>,
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insertion {
    pub id: i64,
    /// False when the row already existed
    pub created: bool,
}

/// A single-use right to execute one claim.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub request_id: String,
    pub tx_id: i64,
    pub status: ClaimRequestStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ClaimRequestStatus::Pending && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClaimRequest {
    pub request_id: String,
    pub tx_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// Result of closing a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub tx_id: i64,
    pub request_id: String,
    pub request_status: ClaimRequestStatus,
    pub claim_tx_hash: Option<String>,
    pub amount: String,
    pub fee: String,
    pub claim_status: ClaimStatus,
}

/// What `update_claim_outcome` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimResolution {
    Recorded,
    /// The same outcome was already stored
    Unchanged,
    /// The transaction had already been claimed by another request
    DoubleClaimed,
}

/// Raw inbound transfer to the treasury, before it backs a cash-in.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct TreasuryDeposit {
    pub tx_id: String,
    pub from_address: String,
    pub treasury_address: String,
    pub token_address: String,
    pub amount: String,
    pub tx_fee: String,
    pub status: TreasuryStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTreasuryDeposit {
    pub tx_id: String,
    pub from_address: String,
    pub treasury_address: String,
    pub token_address: String,
    pub amount: String,
    pub tx_fee: String,
}

/// Lookup key for an unconsumed treasury deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryQuery {
    pub from_address: String,
    pub treasury_address: String,
    pub token_address: String,
    pub amount: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOrder {
    /// Primary key ascending
    #[default]
    Id,
    /// Deposit time, newest first
    NewestFirst,
}

/// Optional filters for listing; `None` means no constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub direction: Direction,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub deposit_status: Option<DepositStatus>,
    pub offset: i64,
    /// Zero means no limit
    pub limit: i64,
    #[serde(default)]
    pub order: ListOrder,
}

impl TransactionFilter {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            sender: None,
            receiver: None,
            deposit_status: None,
            offset: 0,
            limit: 0,
            order: ListOrder::Id,
        }
    }
}

/// Off-chain registry entry for a governance signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAccount {
    pub address: String,
    pub status: AccountStatus,
    pub roles: Vec<String>,
}

impl AdminAccount {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
