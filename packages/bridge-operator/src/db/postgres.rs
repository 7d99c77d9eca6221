//! Postgres ledger store
//!
//! Compound operations run in a single database transaction and lock the
//! cash transaction row with `FOR UPDATE` before deciding anything, so two
//! concurrent requests for the same transaction serialize on that row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, warn};

use super::{
    account_key, check_claim_admission, check_forward_only, initial_deposit_status,
    plan_claim_outcome, AccountStore, AdminAccount, CashTransaction, ClaimOutcome, ClaimRequest,
    ClaimResolution, Insertion, LedgerStore, ListOrder, NewCashTransaction, NewClaimRequest,
    NewTreasuryDeposit, OutcomePlan, TransactionFilter, TreasuryDeposit, TreasuryQuery,
};
use crate::error::{BridgeError, BridgeResult};
use crate::types::{AccountStatus, ClaimRequestStatus, ClaimStatus, Direction};

// NUMERIC columns are read back as TEXT since sqlx can't convert them to String
const CASH_COLUMNS: &str = "id, direction, request_id, deposit_tx_hash, claim_tx_hash, \
    treasury_tx_id, source_token_addr, dest_token_addr, source_wallet_addr, dest_wallet_addr, \
    network_id, amount::TEXT AS amount, fee::TEXT AS fee, deposit_status, claim_status, \
    deposit_at, claim_at";

const REQUEST_COLUMNS: &str = "request_id, tx_id, status, expires_at, created_at";

const TREASURY_COLUMNS: &str = "tx_id, from_address, treasury_address, token_address, \
    amount::TEXT AS amount, tx_fee::TEXT AS tx_fee, status, created_at";

const ACCOUNT_SELECT: &str = "SELECT a.address, a.status, \
    COALESCE(array_agg(r.role ORDER BY r.role) FILTER (WHERE r.role IS NOT NULL), '{}')::TEXT[] AS roles \
    FROM admin_accounts a LEFT JOIN admin_account_roles r ON r.address = a.address";

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn into_account((address, status, roles): (String, AccountStatus, Vec<String>)) -> AdminAccount {
    AdminAccount {
        address,
        status,
        roles,
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn create_cash_transaction(&self, new: &NewCashTransaction) -> BridgeResult<Insertion> {
        let deposit_status = initial_deposit_status(new.deposit_status)?;
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM cash_transactions WHERE direction = $1 AND deposit_tx_hash = $2",
        )
        .bind(new.direction)
        .bind(&new.deposit_tx_hash)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((id,)) = existing {
            return Ok(Insertion { id, created: false });
        }

        if let Some(treasury_tx) = &new.treasury_tx_id {
            // Compare-and-set: only an unconsumed deposit may back a cash-in
            let flipped = sqlx::query(
                "UPDATE tx_to_treasury SET status = 'isCashin' WHERE tx_id = $1 AND status = 'unconfirmed'",
            )
            .bind(treasury_tx)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if flipped == 0 {
                let known: (bool,) =
                    sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tx_to_treasury WHERE tx_id = $1)")
                        .bind(treasury_tx)
                        .fetch_one(&mut *tx)
                        .await?;
                return Err(if known.0 {
                    BridgeError::storage(format!("treasury deposit {treasury_tx} already consumed"))
                } else {
                    BridgeError::NotFound(format!("treasury deposit {treasury_tx}"))
                });
            }
        }

        // Note: amount and fee are stored as NUMERIC(78,0), so we cast the text values
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO cash_transactions (direction, deposit_tx_hash, treasury_tx_id,
                source_token_addr, dest_token_addr, source_wallet_addr, dest_wallet_addr,
                network_id, amount, fee, deposit_status, deposit_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::NUMERIC, $10::NUMERIC, $11, $12)
            ON CONFLICT (direction, deposit_tx_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(new.direction)
        .bind(&new.deposit_tx_hash)
        .bind(&new.treasury_tx_id)
        .bind(&new.source_token_addr)
        .bind(&new.dest_token_addr)
        .bind(&new.source_wallet_addr)
        .bind(&new.dest_wallet_addr)
        .bind(&new.network_id)
        .bind(&new.amount)
        .bind(&new.fee)
        .bind(deposit_status)
        .bind(new.deposit_at)
        .fetch_optional(&mut *tx)
        .await?;

        match inserted {
            Some((id,)) => {
                tx.commit().await?;
                debug!(id, direction = %new.direction, hash = %new.deposit_tx_hash, "Cash transaction created");
                Ok(Insertion { id, created: true })
            }
            None => {
                // Lost an insert race; undo the treasury flip and report the winner
                tx.rollback().await?;
                let (id,): (i64,) = sqlx::query_as(
                    "SELECT id FROM cash_transactions WHERE direction = $1 AND deposit_tx_hash = $2",
                )
                .bind(new.direction)
                .bind(&new.deposit_tx_hash)
                .fetch_one(&self.pool)
                .await?;
                Ok(Insertion { id, created: false })
            }
        }
    }

    async fn update_cash_transaction(&self, row: &CashTransaction) -> BridgeResult<()> {
        let mut tx = self.pool.begin().await?;
        let current: CashTransaction = sqlx::query_as(&format!(
            "SELECT {CASH_COLUMNS} FROM cash_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(row.id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BridgeError::NotFound(format!("cash transaction {}", row.id)))?;

        check_forward_only(&current, row)?;
        if current.direction != row.direction {
            return Err(BridgeError::validation("direction is immutable"));
        }

        sqlx::query(
            r#"
            UPDATE cash_transactions SET request_id = $2, deposit_tx_hash = $3, claim_tx_hash = $4,
                treasury_tx_id = $5, source_token_addr = $6, dest_token_addr = $7,
                source_wallet_addr = $8, dest_wallet_addr = $9, network_id = $10,
                amount = $11::NUMERIC, fee = $12::NUMERIC, deposit_status = $13,
                claim_status = $14, deposit_at = $15, claim_at = $16, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.request_id)
        .bind(&row.deposit_tx_hash)
        .bind(&row.claim_tx_hash)
        .bind(&row.treasury_tx_id)
        .bind(&row.source_token_addr)
        .bind(&row.dest_token_addr)
        .bind(&row.source_wallet_addr)
        .bind(&row.dest_wallet_addr)
        .bind(&row.network_id)
        .bind(&row.amount)
        .bind(&row.fee)
        .bind(row.deposit_status)
        .bind(row.claim_status)
        .bind(row.deposit_at)
        .bind(row.claim_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn confirm_deposit(&self, direction: Direction, deposit_tx_hash: &str) -> BridgeResult<()> {
        let updated = sqlx::query(
            r#"UPDATE cash_transactions SET deposit_status = 'confirmed', updated_at = NOW()
               WHERE direction = $1 AND deposit_tx_hash = $2"#,
        )
        .bind(direction)
        .bind(deposit_tx_hash)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(BridgeError::NotFound(format!("deposit {deposit_tx_hash}")));
        }
        Ok(())
    }

    async fn select_by_deposit_hash(
        &self,
        direction: Direction,
        deposit_tx_hash: &str,
    ) -> BridgeResult<Option<CashTransaction>> {
        let row = sqlx::query_as(&format!(
            "SELECT {CASH_COLUMNS} FROM cash_transactions WHERE direction = $1 AND deposit_tx_hash = $2"
        ))
        .bind(direction)
        .bind(deposit_tx_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn select_by_claim_hash(
        &self,
        direction: Direction,
        claim_tx_hash: &str,
    ) -> BridgeResult<Vec<CashTransaction>> {
        let rows = sqlx::query_as(&format!(
            "SELECT {CASH_COLUMNS} FROM cash_transactions WHERE direction = $1 AND claim_tx_hash = $2 ORDER BY id"
        ))
        .bind(direction)
        .bind(claim_tx_hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn select_by_id(&self, id: i64) -> BridgeResult<Option<CashTransaction>> {
        let row = sqlx::query_as(&format!(
            "SELECT {CASH_COLUMNS} FROM cash_transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn select_by_request_id(&self, request_id: &str) -> BridgeResult<Option<CashTransaction>> {
        let row = sqlx::query_as(&format!(
            "SELECT {CASH_COLUMNS} FROM cash_transactions WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn select_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> BridgeResult<Vec<CashTransaction>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {CASH_COLUMNS} FROM cash_transactions WHERE direction = "
        ));
        qb.push_bind(filter.direction);
        if let Some(sender) = &filter.sender {
            qb.push(" AND source_wallet_addr = ").push_bind(sender.clone());
        }
        if let Some(receiver) = &filter.receiver {
            qb.push(" AND dest_wallet_addr = ").push_bind(receiver.clone());
        }
        if let Some(status) = filter.deposit_status {
            qb.push(" AND deposit_status = ").push_bind(status);
        }
        qb.push(match filter.order {
            ListOrder::Id => " ORDER BY id ASC",
            ListOrder::NewestFirst => " ORDER BY deposit_at DESC, id DESC",
        });
        if filter.limit > 0 {
            qb.push(" LIMIT ").push_bind(filter.limit);
        }
        qb.push(" OFFSET ").push_bind(filter.offset.max(0));

        let rows = qb
            .build_query_as::<CashTransaction>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn create_claim_request(&self, new: &NewClaimRequest) -> BridgeResult<ClaimRequest> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let cash: CashTransaction = sqlx::query_as(&format!(
            "SELECT {CASH_COLUMNS} FROM cash_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(new.tx_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BridgeError::NotFound(format!("cash transaction {}", new.tx_id)))?;

        let current: Option<ClaimRequest> = match &cash.request_id {
            Some(id) => {
                sqlx::query_as(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM claim_requests WHERE request_id = $1"
                ))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
            }
            None => None,
        };

        if let Some(stale) = check_claim_admission(&cash, current.as_ref(), now)? {
            sqlx::query(
                r#"UPDATE claim_requests SET status = 'expired', updated_at = NOW()
                   WHERE request_id = $1 AND status = 'pending'"#,
            )
            .bind(&stale)
            .execute(&mut *tx)
            .await?;
            debug!(request_id = %stale, tx_id = cash.id, "Expired stale claim request");
        }

        let request: ClaimRequest = sqlx::query_as(&format!(
            r#"INSERT INTO claim_requests (request_id, tx_id, status, expires_at, created_at)
               VALUES ($1, $2, 'pending', $3, $4)
               RETURNING {REQUEST_COLUMNS}"#
        ))
        .bind(&new.request_id)
        .bind(new.tx_id)
        .bind(new.expires_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"UPDATE cash_transactions SET claim_status = 'pending', request_id = $1,
                   claim_tx_hash = NULL, updated_at = NOW()
               WHERE id = $2"#,
        )
        .bind(&new.request_id)
        .bind(new.tx_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(request)
    }

    async fn get_claim_request(&self, request_id: &str) -> BridgeResult<Option<ClaimRequest>> {
        let row = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM claim_requests WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_claim_request_status(
        &self,
        request_id: &str,
        from: ClaimRequestStatus,
        to: ClaimRequestStatus,
    ) -> BridgeResult<bool> {
        if !from.can_transition_to(to) {
            return Err(BridgeError::InvalidTransition(format!(
                "claim request {from} -> {to}"
            )));
        }

        let updated = sqlx::query(
            r#"UPDATE claim_requests SET status = $1, updated_at = NOW()
               WHERE request_id = $2 AND status = $3"#,
        )
        .bind(to)
        .bind(request_id)
        .bind(from)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(true);
        }
        let known: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM claim_requests WHERE request_id = $1)")
                .bind(request_id)
                .fetch_one(&self.pool)
                .await?;
        if known.0 {
            Ok(false)
        } else {
            Err(BridgeError::NotFound(format!("claim request {request_id}")))
        }
    }

    async fn record_claim_submission(
        &self,
        tx_id: i64,
        request_id: &str,
        claim_tx_hash: &str,
        signed_tx: &serde_json::Value,
    ) -> BridgeResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE cash_transactions t SET claim_tx_hash = $1, updated_at = NOW()
            WHERE t.id = $2 AND t.request_id = $3 AND t.claim_status = 'pending'
              AND EXISTS (SELECT 1 FROM claim_requests r
                          WHERE r.request_id = $3 AND r.status = 'pending')
            "#,
        )
        .bind(claim_tx_hash)
        .bind(tx_id)
        .bind(request_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let known: (bool,) =
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM cash_transactions WHERE id = $1)")
                    .bind(tx_id)
                    .fetch_one(&mut *tx)
                    .await?;
            return Err(if known.0 {
                BridgeError::validation(format!("claim request {request_id} is no longer current"))
            } else {
                BridgeError::NotFound(format!("cash transaction {tx_id}"))
            });
        }

        sqlx::query(
            "UPDATE claim_requests SET signed_tx = $1, updated_at = NOW() WHERE request_id = $2",
        )
        .bind(signed_tx)
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim_submission(&self, request_id: &str) -> BridgeResult<Option<serde_json::Value>> {
        let row: Option<(Option<serde_json::Value>,)> =
            sqlx::query_as("SELECT signed_tx FROM claim_requests WHERE request_id = $1")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(signed,)| signed))
    }

    async fn update_claim_outcome(&self, outcome: &ClaimOutcome) -> BridgeResult<ClaimResolution> {
        let mut tx = self.pool.begin().await?;

        let cash: CashTransaction = sqlx::query_as(&format!(
            "SELECT {CASH_COLUMNS} FROM cash_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(outcome.tx_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BridgeError::NotFound(format!("cash transaction {}", outcome.tx_id)))?;

        let request: ClaimRequest = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM claim_requests WHERE request_id = $1 FOR UPDATE"
        ))
        .bind(&outcome.request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BridgeError::NotFound(format!("claim request {}", outcome.request_id)))?;

        let resolution = match plan_claim_outcome(&cash, &request, outcome)? {
            OutcomePlan::Unchanged => ClaimResolution::Unchanged,
            OutcomePlan::DoubleClaim => {
                sqlx::query(
                    r#"UPDATE claim_requests SET status = 'doubleclaimed', updated_at = NOW()
                       WHERE request_id = $1 AND status IN ('pending', 'success')"#,
                )
                .bind(&outcome.request_id)
                .execute(&mut *tx)
                .await?;
                warn!(
                    tx_id = cash.id,
                    request_id = %outcome.request_id,
                    claim_tx_hash = ?outcome.claim_tx_hash,
                    "Transaction already claimed by another request"
                );
                ClaimResolution::DoubleClaimed
            }
            OutcomePlan::Apply => {
                let claim_at = (outcome.claim_status == ClaimStatus::Confirmed).then(Utc::now);
                sqlx::query(
                    r#"
                    UPDATE cash_transactions SET claim_tx_hash = $1, claim_status = $2,
                        amount = $3::NUMERIC, fee = $4::NUMERIC,
                        claim_at = COALESCE($5, claim_at), updated_at = NOW()
                    WHERE id = $6
                    "#,
                )
                .bind(&outcome.claim_tx_hash)
                .bind(outcome.claim_status)
                .bind(&outcome.amount)
                .bind(&outcome.fee)
                .bind(claim_at)
                .bind(outcome.tx_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE claim_requests SET status = $1, updated_at = NOW() WHERE request_id = $2",
                )
                .bind(outcome.request_status)
                .bind(&outcome.request_id)
                .execute(&mut *tx)
                .await?;
                ClaimResolution::Recorded
            }
        };

        tx.commit().await?;
        Ok(resolution)
    }

    async fn expire_stale_requests(&self, now: DateTime<Utc>) -> BridgeResult<u64> {
        // Requests whose claim was already signed stay open until the outcome lands
        let expired = sqlx::query(
            r#"
            UPDATE claim_requests r SET status = 'expired', updated_at = NOW()
            WHERE r.status = 'pending' AND r.expires_at <= $1
              AND NOT EXISTS (SELECT 1 FROM cash_transactions t
                              WHERE t.request_id = r.request_id AND t.claim_tx_hash IS NOT NULL)
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(expired)
    }

    async fn count_claim_requests(&self, status: ClaimRequestStatus) -> BridgeResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM claim_requests WHERE status = $1")
                .bind(status)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn create_treasury_deposit(&self, new: &NewTreasuryDeposit) -> BridgeResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO tx_to_treasury (tx_id, from_address, treasury_address, token_address, amount, tx_fee)
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6::NUMERIC)
            ON CONFLICT (tx_id) DO NOTHING
            "#,
        )
        .bind(&new.tx_id)
        .bind(&new.from_address)
        .bind(&new.treasury_address)
        .bind(&new.token_address)
        .bind(&new.amount)
        .bind(&new.tx_fee)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    async fn unconfirmed_treasury_deposit(
        &self,
        query: &TreasuryQuery,
    ) -> BridgeResult<Option<TreasuryDeposit>> {
        let row = sqlx::query_as(&format!(
            r#"SELECT {TREASURY_COLUMNS} FROM tx_to_treasury
               WHERE status = 'unconfirmed'
                 AND LOWER(from_address) = LOWER($1)
                 AND LOWER(treasury_address) = LOWER($2)
                 AND LOWER(token_address) = LOWER($3)
                 AND amount = $4::NUMERIC
               ORDER BY created_at
               LIMIT 1"#
        ))
        .bind(&query.from_address)
        .bind(&query.treasury_address)
        .bind(&query.token_address)
        .bind(&query.amount)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn treasury_deposit_by_tx(&self, tx_id: &str) -> BridgeResult<Option<TreasuryDeposit>> {
        let row = sqlx::query_as(&format!(
            "SELECT {TREASURY_COLUMNS} FROM tx_to_treasury WHERE tx_id = $1"
        ))
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn treasury_deposits_by_sender(&self, sender: &str) -> BridgeResult<Vec<TreasuryDeposit>> {
        let rows = sqlx::query_as(&format!(
            "SELECT {TREASURY_COLUMNS} FROM tx_to_treasury WHERE LOWER(from_address) = LOWER($1) ORDER BY created_at"
        ))
        .bind(sender)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl AccountStore for PgLedger {
    async fn add_account(&self, address: &str, status: AccountStatus) -> BridgeResult<()> {
        let inserted = sqlx::query(
            "INSERT INTO admin_accounts (address, status) VALUES ($1, $2) ON CONFLICT (address) DO NOTHING",
        )
        .bind(account_key(address))
        .bind(status)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(BridgeError::validation(format!("account {address} already exists")));
        }
        Ok(())
    }

    async fn remove_account(&self, address: &str) -> BridgeResult<()> {
        let removed = sqlx::query("DELETE FROM admin_accounts WHERE address = $1")
            .bind(account_key(address))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(BridgeError::NotFound(format!("account {address}")));
        }
        Ok(())
    }

    async fn get_account(&self, address: &str) -> BridgeResult<Option<AdminAccount>> {
        let row: Option<(String, AccountStatus, Vec<String>)> = sqlx::query_as(&format!(
            "{ACCOUNT_SELECT} WHERE a.address = $1 GROUP BY a.address, a.status"
        ))
        .bind(account_key(address))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(into_account))
    }

    async fn set_account_status(&self, address: &str, status: AccountStatus) -> BridgeResult<()> {
        let updated = sqlx::query("UPDATE admin_accounts SET status = $1 WHERE address = $2")
            .bind(status)
            .bind(account_key(address))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(BridgeError::NotFound(format!("account {address}")));
        }
        Ok(())
    }

    async fn assign_role(&self, address: &str, role: &str) -> BridgeResult<()> {
        let key = account_key(address);
        let mut tx = self.pool.begin().await?;

        let known: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM admin_accounts WHERE address = $1)")
                .bind(&key)
                .fetch_one(&mut *tx)
                .await?;
        if !known.0 {
            return Err(BridgeError::NotFound(format!("account {address}")));
        }

        sqlx::query(
            "INSERT INTO admin_account_roles (address, role) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(&key)
        .bind(role)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn accounts_with_role(
        &self,
        role: &str,
        offset: i64,
        limit: i64,
    ) -> BridgeResult<Vec<AdminAccount>> {
        // LIMIT NULL is no limit
        let rows: Vec<(String, AccountStatus, Vec<String>)> = sqlx::query_as(&format!(
            r#"{ACCOUNT_SELECT}
               WHERE EXISTS (SELECT 1 FROM admin_account_roles x WHERE x.address = a.address AND x.role = $1)
               GROUP BY a.address, a.status
               ORDER BY a.address
               LIMIT NULLIF($2, 0) OFFSET $3"#
        ))
        .bind(role)
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(into_account).collect())
    }

    async fn list_accounts(&self, offset: i64, limit: i64) -> BridgeResult<Vec<AdminAccount>> {
        let rows: Vec<(String, AccountStatus, Vec<String>)> = sqlx::query_as(&format!(
            r#"{ACCOUNT_SELECT}
               GROUP BY a.address, a.status
               ORDER BY a.address
               LIMIT NULLIF($1, 0) OFFSET $2"#
        ))
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(into_account).collect())
    }

    async fn list_roles(&self) -> BridgeResult<Vec<String>> {
        let roles: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT role FROM admin_account_roles ORDER BY role")
                .fetch_all(&self.pool)
                .await?;
        Ok(roles.into_iter().map(|(role,)| role).collect())
    }
}
