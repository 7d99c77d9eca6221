//! Ledger store
//!
//! `LedgerStore` owns every persisted bridge entity. Compound operations are
//! atomic: either every row they touch changes or none does. `PgLedger` is
//! the production store; `MemoryLedger` has the same semantics for tests.
//! Admission and outcome rules are shared so both stores decide identically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::{BridgeError, BridgeResult};
use crate::types::{AccountStatus, ClaimRequestStatus, ClaimStatus, DepositStatus, Direction};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryLedger;
pub use models::*;
pub use postgres::PgLedger;

/// Create a database connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a cash transaction; consumes the referenced treasury deposit atomically.
    /// A repeated `(direction, deposit_tx_hash)` returns the existing id with `created = false`.
    async fn create_cash_transaction(&self, new: &NewCashTransaction) -> BridgeResult<Insertion>;

    /// Overwrite descriptive fields and advance statuses. Statuses never move backward.
    async fn update_cash_transaction(&self, tx: &CashTransaction) -> BridgeResult<()>;

    /// Mark a deposit final on its source chain.
    async fn confirm_deposit(&self, direction: Direction, deposit_tx_hash: &str) -> BridgeResult<()>;

    async fn select_by_deposit_hash(
        &self,
        direction: Direction,
        deposit_tx_hash: &str,
    ) -> BridgeResult<Option<CashTransaction>>;

    async fn select_by_claim_hash(
        &self,
        direction: Direction,
        claim_tx_hash: &str,
    ) -> BridgeResult<Vec<CashTransaction>>;

    async fn select_by_id(&self, id: i64) -> BridgeResult<Option<CashTransaction>>;

    async fn select_by_request_id(&self, request_id: &str) -> BridgeResult<Option<CashTransaction>>;

    async fn select_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> BridgeResult<Vec<CashTransaction>>;

    /// Insert a pending request and move the owning transaction to claim-pending.
    /// An elapsed pending request is expired in the same unit.
    async fn create_claim_request(&self, new: &NewClaimRequest) -> BridgeResult<ClaimRequest>;

    async fn get_claim_request(&self, request_id: &str) -> BridgeResult<Option<ClaimRequest>>;

    /// Compare-and-set on the request status. Returns false if `from` no longer holds.
    async fn update_claim_request_status(
        &self,
        request_id: &str,
        from: ClaimRequestStatus,
        to: ClaimRequestStatus,
    ) -> BridgeResult<bool>;

    /// Store the claim transaction id and its signed body before it is broadcast.
    async fn record_claim_submission(
        &self,
        tx_id: i64,
        request_id: &str,
        claim_tx_hash: &str,
        signed_tx: &serde_json::Value,
    ) -> BridgeResult<()>;

    /// Signed claim transaction recorded for a request, if any.
    async fn claim_submission(&self, request_id: &str) -> BridgeResult<Option<serde_json::Value>>;

    /// Update the transaction row and close the claim request together.
    async fn update_claim_outcome(&self, outcome: &ClaimOutcome) -> BridgeResult<ClaimResolution>;

    /// Expire pending requests whose deadline passed. Returns how many changed.
    async fn expire_stale_requests(&self, now: DateTime<Utc>) -> BridgeResult<u64>;

    async fn count_claim_requests(&self, status: ClaimRequestStatus) -> BridgeResult<i64>;

    /// Record a raw treasury deposit. Returns false if the tx id is already known.
    async fn create_treasury_deposit(&self, new: &NewTreasuryDeposit) -> BridgeResult<bool>;

    async fn unconfirmed_treasury_deposit(
        &self,
        query: &TreasuryQuery,
    ) -> BridgeResult<Option<TreasuryDeposit>>;

    async fn treasury_deposit_by_tx(&self, tx_id: &str) -> BridgeResult<Option<TreasuryDeposit>>;

    async fn treasury_deposits_by_sender(&self, sender: &str) -> BridgeResult<Vec<TreasuryDeposit>>;
}

/// Off-chain registry of governance signers.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn add_account(&self, address: &str, status: AccountStatus) -> BridgeResult<()>;

    async fn remove_account(&self, address: &str) -> BridgeResult<()>;

    async fn get_account(&self, address: &str) -> BridgeResult<Option<AdminAccount>>;

    async fn set_account_status(&self, address: &str, status: AccountStatus) -> BridgeResult<()>;

    async fn assign_role(&self, address: &str, role: &str) -> BridgeResult<()>;

    async fn accounts_with_role(
        &self,
        role: &str,
        offset: i64,
        limit: i64,
    ) -> BridgeResult<Vec<AdminAccount>>;

    /// Every registered account ordered by address; a zero limit means no limit.
    async fn list_accounts(&self, offset: i64, limit: i64) -> BridgeResult<Vec<AdminAccount>>;

    /// Distinct roles held by any account, sorted.
    async fn list_roles(&self) -> BridgeResult<Vec<String>>;
}

/// Registry key for an account: hex addresses compare case-insensitively,
/// base58 addresses are case-sensitive and kept as given.
pub(crate) fn account_key(address: &str) -> String {
    if address.starts_with("0x") || address.starts_with("0X") {
        address.to_lowercase()
    } else {
        address.to_string()
    }
}

/// True once a claim transaction has been signed for this request. Such a
/// request stays pending past its deadline until the flow records the outcome.
pub(crate) fn is_submitted(tx: &CashTransaction, request: &ClaimRequest) -> bool {
    request.status == ClaimRequestStatus::Pending
        && tx.claim_tx_hash.is_some()
        && tx.request_id.as_deref() == Some(request.request_id.as_str())
}

/// Admission check for a new claim request against the transaction's current state.
///
/// Returns the id of an elapsed pending request that must be expired first.
pub(crate) fn check_claim_admission(
    tx: &CashTransaction,
    current: Option<&ClaimRequest>,
    now: DateTime<Utc>,
) -> BridgeResult<Option<String>> {
    match tx.claim_status {
        ClaimStatus::Confirmed => Err(BridgeError::AlreadyClaimed),
        ClaimStatus::Unconfirmed => Ok(None),
        ClaimStatus::Pending => match current {
            Some(req) if req.is_live(now) || is_submitted(tx, req) => {
                Err(BridgeError::RequestPending)
            }
            Some(req) if req.status == ClaimRequestStatus::Pending => {
                Ok(Some(req.request_id.clone()))
            }
            _ => Ok(None),
        },
    }
}

/// How a claim outcome applies to the current rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutcomePlan {
    Apply,
    Unchanged,
    DoubleClaim,
}

pub(crate) fn plan_claim_outcome(
    tx: &CashTransaction,
    request: &ClaimRequest,
    outcome: &ClaimOutcome,
) -> BridgeResult<OutcomePlan> {
    if request.tx_id != tx.id {
        return Err(BridgeError::validation(format!(
            "claim request {} does not belong to transaction {}",
            request.request_id, tx.id
        )));
    }

    let same_request = tx.request_id.as_deref() == Some(outcome.request_id.as_str());

    if tx.claim_status == ClaimStatus::Confirmed
        && outcome.request_status == ClaimRequestStatus::Success
    {
        let replay = same_request
            && request.status == ClaimRequestStatus::Success
            && tx.claim_tx_hash == outcome.claim_tx_hash;
        return Ok(if replay {
            OutcomePlan::Unchanged
        } else {
            OutcomePlan::DoubleClaim
        });
    }

    if request.status == outcome.request_status
        && tx.claim_status == outcome.claim_status
        && tx.claim_tx_hash == outcome.claim_tx_hash
    {
        return Ok(OutcomePlan::Unchanged);
    }

    if !tx.claim_status.can_advance_to(outcome.claim_status) {
        return Err(BridgeError::InvalidTransition(format!(
            "claim status {} -> {}",
            tx.claim_status, outcome.claim_status
        )));
    }
    if !request.status.can_transition_to(outcome.request_status) {
        return Err(BridgeError::InvalidTransition(format!(
            "claim request {} -> {}",
            request.status, outcome.request_status
        )));
    }
    if outcome.claim_status == ClaimStatus::Confirmed && !same_request {
        return Err(BridgeError::validation(format!(
            "claim request {} is not the current request",
            outcome.request_id
        )));
    }

    Ok(OutcomePlan::Apply)
}

/// Reject updates that would move either status backward.
pub(crate) fn check_forward_only(current: &CashTransaction, next: &CashTransaction) -> BridgeResult<()> {
    if !current.deposit_status.can_advance_to(next.deposit_status) {
        return Err(BridgeError::InvalidTransition(format!(
            "deposit status {} -> {}",
            current.deposit_status, next.deposit_status
        )));
    }
    if !current.claim_status.can_advance_to(next.claim_status) {
        return Err(BridgeError::InvalidTransition(format!(
            "claim status {} -> {}",
            current.claim_status, next.claim_status
        )));
    }
    Ok(())
}

pub(crate) fn initial_deposit_status(status: DepositStatus) -> BridgeResult<DepositStatus> {
    match status {
        DepositStatus::Unconfirmed | DepositStatus::Confirmed => Ok(status),
        DepositStatus::Pending => Err(BridgeError::validation(
            "new deposits are either unconfirmed or confirmed",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tx(claim_status: ClaimStatus, request_id: Option<&str>) -> CashTransaction {
        CashTransaction {
            id: 1,
            direction: Direction::WelCashinEth,
            request_id: request_id.map(str::to_string),
            deposit_tx_hash: Some("0xabc".into()),
            claim_tx_hash: None,
            treasury_tx_id: None,
            source_token_addr: "Wtoken".into(),
            dest_token_addr: "0xtoken".into(),
            source_wallet_addr: "Wuser".into(),
            dest_wallet_addr: "0xUser".into(),
            network_id: "1".into(),
            amount: "100".into(),
            fee: "0".into(),
            deposit_status: DepositStatus::Confirmed,
            claim_status,
            deposit_at: Utc::now(),
            claim_at: None,
        }
    }

    fn request(id: &str, status: ClaimRequestStatus, expires_in: Duration) -> ClaimRequest {
        ClaimRequest {
            request_id: id.into(),
            tx_id: 1,
            status,
            expires_at: Utc::now() + expires_in,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_admission_rules() {
        let now = Utc::now();
        assert_eq!(
            check_claim_admission(&tx(ClaimStatus::Confirmed, None), None, now),
            Err(BridgeError::AlreadyClaimed)
        );
        assert_eq!(
            check_claim_admission(&tx(ClaimStatus::Unconfirmed, None), None, now),
            Ok(None)
        );

        let live = request("1", ClaimRequestStatus::Pending, Duration::minutes(3));
        assert_eq!(
            check_claim_admission(&tx(ClaimStatus::Pending, Some("1")), Some(&live), now),
            Err(BridgeError::RequestPending)
        );

        let stale = request("1", ClaimRequestStatus::Pending, Duration::minutes(-1));
        assert_eq!(
            check_claim_admission(&tx(ClaimStatus::Pending, Some("1")), Some(&stale), now),
            Ok(Some("1".to_string()))
        );

        let mut submitted = tx(ClaimStatus::Pending, Some("1"));
        submitted.claim_tx_hash = Some("0xc1".into());
        assert_eq!(
            check_claim_admission(&submitted, Some(&stale), now),
            Err(BridgeError::RequestPending)
        );

        let closed = request("1", ClaimRequestStatus::Expired, Duration::minutes(3));
        assert_eq!(
            check_claim_admission(&tx(ClaimStatus::Pending, Some("1")), Some(&closed), now),
            Ok(None)
        );
    }

    fn outcome(request_id: &str, hash: &str) -> ClaimOutcome {
        ClaimOutcome {
            tx_id: 1,
            request_id: request_id.into(),
            request_status: ClaimRequestStatus::Success,
            claim_tx_hash: Some(hash.into()),
            amount: "100".into(),
            fee: "0".into(),
            claim_status: ClaimStatus::Confirmed,
        }
    }

    #[test]
    fn test_outcome_plans() {
        let pending = request("1", ClaimRequestStatus::Pending, Duration::minutes(3));
        assert_eq!(
            plan_claim_outcome(&tx(ClaimStatus::Pending, Some("1")), &pending, &outcome("1", "0xc1")),
            Ok(OutcomePlan::Apply)
        );

        let mut claimed = tx(ClaimStatus::Confirmed, Some("1"));
        claimed.claim_tx_hash = Some("0xc1".into());
        let success = request("1", ClaimRequestStatus::Success, Duration::minutes(3));
        assert_eq!(
            plan_claim_outcome(&claimed, &success, &outcome("1", "0xc1")),
            Ok(OutcomePlan::Unchanged)
        );

        let other = request("2", ClaimRequestStatus::Pending, Duration::minutes(3));
        assert_eq!(
            plan_claim_outcome(&claimed, &other, &outcome("2", "0xc2")),
            Ok(OutcomePlan::DoubleClaim)
        );

        let expired = request("1", ClaimRequestStatus::Expired, Duration::minutes(-3));
        assert!(matches!(
            plan_claim_outcome(&tx(ClaimStatus::Pending, Some("1")), &expired, &outcome("1", "0xc1")),
            Err(BridgeError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_forward_only() {
        let current = tx(ClaimStatus::Confirmed, Some("1"));
        let mut next = current.clone();
        next.claim_status = ClaimStatus::Pending;
        assert!(check_forward_only(&current, &next).is_err());
        next.claim_status = ClaimStatus::Confirmed;
        assert!(check_forward_only(&current, &next).is_ok());
    }
}
