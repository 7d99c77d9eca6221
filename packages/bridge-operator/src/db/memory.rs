//! In-memory ledger with the same transactional rules as the Postgres store.
//!
//! A single mutex makes every operation atomic; each compound operation
//! validates all of its rows before writing any of them.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use tokio::sync::Mutex;

use super::{
    account_key, check_claim_admission, check_forward_only, initial_deposit_status, is_submitted,
    plan_claim_outcome, AccountStore, AdminAccount, CashTransaction, ClaimOutcome, ClaimRequest,
    ClaimResolution, Insertion, LedgerStore, ListOrder, NewCashTransaction, NewClaimRequest,
    NewTreasuryDeposit, OutcomePlan, TransactionFilter, TreasuryDeposit, TreasuryQuery,
};
use crate::error::{BridgeError, BridgeResult};
use crate::types::{
    AccountStatus, ClaimRequestStatus, ClaimStatus, DepositStatus, Direction, TreasuryStatus,
};

/// Numeric equality of decimal amount strings, as `NUMERIC` compares them.
fn same_amount(a: &str, b: &str) -> bool {
    match (BigDecimal::from_str(a.trim()), BigDecimal::from_str(b.trim())) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[derive(Default)]
struct State {
    next_id: i64,
    transactions: BTreeMap<i64, CashTransaction>,
    requests: HashMap<String, ClaimRequest>,
    submissions: HashMap<String, serde_json::Value>,
    treasury: HashMap<String, TreasuryDeposit>,
    accounts: BTreeMap<String, AdminAccount>,
}

impl State {
    fn find_by_deposit(&self, direction: Direction, hash: &str) -> Option<&CashTransaction> {
        self.transactions
            .values()
            .find(|t| t.direction == direction && t.deposit_tx_hash.as_deref() == Some(hash))
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn create_cash_transaction(&self, new: &NewCashTransaction) -> BridgeResult<Insertion> {
        let mut state = self.state.lock().await;
        let deposit_status = initial_deposit_status(new.deposit_status)?;

        if let Some(existing) = state.find_by_deposit(new.direction, &new.deposit_tx_hash) {
            return Ok(Insertion {
                id: existing.id,
                created: false,
            });
        }

        if let Some(treasury_tx) = &new.treasury_tx_id {
            match state.treasury.get(treasury_tx) {
                Some(d) if d.status == TreasuryStatus::Unconfirmed => {}
                Some(_) => {
                    return Err(BridgeError::storage(format!(
                        "treasury deposit {treasury_tx} already consumed"
                    )))
                }
                None => {
                    return Err(BridgeError::NotFound(format!(
                        "treasury deposit {treasury_tx}"
                    )))
                }
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        state.transactions.insert(
            id,
            CashTransaction {
                id,
                direction: new.direction,
                request_id: None,
                deposit_tx_hash: Some(new.deposit_tx_hash.clone()),
                claim_tx_hash: None,
                treasury_tx_id: new.treasury_tx_id.clone(),
                source_token_addr: new.source_token_addr.clone(),
                dest_token_addr: new.dest_token_addr.clone(),
                source_wallet_addr: new.source_wallet_addr.clone(),
                dest_wallet_addr: new.dest_wallet_addr.clone(),
                network_id: new.network_id.clone(),
                amount: new.amount.clone(),
                fee: new.fee.clone(),
                deposit_status,
                claim_status: ClaimStatus::Unconfirmed,
                deposit_at: new.deposit_at,
                claim_at: None,
            },
        );
        if let Some(treasury_tx) = &new.treasury_tx_id {
            if let Some(deposit) = state.treasury.get_mut(treasury_tx) {
                deposit.status = TreasuryStatus::IsCashin;
            }
        }

        Ok(Insertion { id, created: true })
    }

    async fn update_cash_transaction(&self, tx: &CashTransaction) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let current = state
            .transactions
            .get(&tx.id)
            .ok_or_else(|| BridgeError::NotFound(format!("cash transaction {}", tx.id)))?;
        check_forward_only(current, tx)?;
        if current.direction != tx.direction {
            return Err(BridgeError::validation("direction is immutable"));
        }
        state.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn confirm_deposit(&self, direction: Direction, deposit_tx_hash: &str) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let tx = state
            .transactions
            .values_mut()
            .find(|t| t.direction == direction && t.deposit_tx_hash.as_deref() == Some(deposit_tx_hash))
            .ok_or_else(|| BridgeError::NotFound(format!("deposit {deposit_tx_hash}")))?;
        tx.deposit_status = DepositStatus::Confirmed;
        Ok(())
    }

    async fn select_by_deposit_hash(
        &self,
        direction: Direction,
        deposit_tx_hash: &str,
    ) -> BridgeResult<Option<CashTransaction>> {
        let state = self.state.lock().await;
        Ok(state.find_by_deposit(direction, deposit_tx_hash).cloned())
    }

    async fn select_by_claim_hash(
        &self,
        direction: Direction,
        claim_tx_hash: &str,
    ) -> BridgeResult<Vec<CashTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| t.direction == direction && t.claim_tx_hash.as_deref() == Some(claim_tx_hash))
            .cloned()
            .collect())
    }

    async fn select_by_id(&self, id: i64) -> BridgeResult<Option<CashTransaction>> {
        Ok(self.state.lock().await.transactions.get(&id).cloned())
    }

    async fn select_by_request_id(&self, request_id: &str) -> BridgeResult<Option<CashTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .find(|t| t.request_id.as_deref() == Some(request_id))
            .cloned())
    }

    async fn select_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> BridgeResult<Vec<CashTransaction>> {
        let state = self.state.lock().await;
        let mut rows: Vec<CashTransaction> = state
            .transactions
            .values()
            .filter(|t| t.direction == filter.direction)
            .filter(|t| filter.sender.as_ref().map_or(true, |s| &t.source_wallet_addr == s))
            .filter(|t| filter.receiver.as_ref().map_or(true, |r| &t.dest_wallet_addr == r))
            .filter(|t| filter.deposit_status.map_or(true, |s| t.deposit_status == s))
            .cloned()
            .collect();

        if filter.order == ListOrder::NewestFirst {
            rows.sort_by(|a, b| b.deposit_at.cmp(&a.deposit_at).then(b.id.cmp(&a.id)));
        }

        let rows = rows.into_iter().skip(filter.offset.max(0) as usize);
        Ok(if filter.limit > 0 {
            rows.take(filter.limit as usize).collect()
        } else {
            rows.collect()
        })
    }

    async fn create_claim_request(&self, new: &NewClaimRequest) -> BridgeResult<ClaimRequest> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let tx = state
            .transactions
            .get(&new.tx_id)
            .ok_or_else(|| BridgeError::NotFound(format!("cash transaction {}", new.tx_id)))?;
        if state.requests.contains_key(&new.request_id) {
            return Err(BridgeError::storage(format!(
                "claim request {} already exists",
                new.request_id
            )));
        }
        let current = tx.request_id.as_ref().and_then(|id| state.requests.get(id));
        let to_expire = check_claim_admission(tx, current, now)?;

        if let Some(old) = to_expire {
            if let Some(req) = state.requests.get_mut(&old) {
                req.status = ClaimRequestStatus::Expired;
            }
        }

        let request = ClaimRequest {
            request_id: new.request_id.clone(),
            tx_id: new.tx_id,
            status: ClaimRequestStatus::Pending,
            expires_at: new.expires_at,
            created_at: now,
        };
        state.requests.insert(new.request_id.clone(), request.clone());
        if let Some(tx) = state.transactions.get_mut(&new.tx_id) {
            tx.claim_status = ClaimStatus::Pending;
            tx.request_id = Some(new.request_id.clone());
            tx.claim_tx_hash = None;
        }
        Ok(request)
    }

    async fn get_claim_request(&self, request_id: &str) -> BridgeResult<Option<ClaimRequest>> {
        Ok(self.state.lock().await.requests.get(request_id).cloned())
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
        let mut state = self.state.lock().await;
        match state.requests.get_mut(request_id) {
            Some(req) if req.status == from => {
                req.status = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BridgeError::NotFound(format!("claim request {request_id}"))),
        }
    }

    async fn record_claim_submission(
        &self,
        tx_id: i64,
        request_id: &str,
        claim_tx_hash: &str,
        signed_tx: &serde_json::Value,
    ) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let request_pending = state
            .requests
            .get(request_id)
            .is_some_and(|r| r.status == ClaimRequestStatus::Pending);
        let tx = state
            .transactions
            .get_mut(&tx_id)
            .ok_or_else(|| BridgeError::NotFound(format!("cash transaction {tx_id}")))?;
        if tx.request_id.as_deref() != Some(request_id)
            || tx.claim_status != ClaimStatus::Pending
            || !request_pending
        {
            return Err(BridgeError::validation(format!(
                "claim request {request_id} is no longer current"
            )));
        }
        tx.claim_tx_hash = Some(claim_tx_hash.to_string());
        state
            .submissions
            .insert(request_id.to_string(), signed_tx.clone());
        Ok(())
    }

    async fn claim_submission(&self, request_id: &str) -> BridgeResult<Option<serde_json::Value>> {
        Ok(self.state.lock().await.submissions.get(request_id).cloned())
    }

    async fn update_claim_outcome(&self, outcome: &ClaimOutcome) -> BridgeResult<ClaimResolution> {
        let mut state = self.state.lock().await;
        let tx = state
            .transactions
            .get(&outcome.tx_id)
            .ok_or_else(|| BridgeError::NotFound(format!("cash transaction {}", outcome.tx_id)))?;
        let request = state
            .requests
            .get(&outcome.request_id)
            .ok_or_else(|| BridgeError::NotFound(format!("claim request {}", outcome.request_id)))?;

        match plan_claim_outcome(tx, request, outcome)? {
            OutcomePlan::Unchanged => Ok(ClaimResolution::Unchanged),
            OutcomePlan::DoubleClaim => {
                if let Some(req) = state.requests.get_mut(&outcome.request_id) {
                    if req.status.can_transition_to(ClaimRequestStatus::DoubleClaimed) {
                        req.status = ClaimRequestStatus::DoubleClaimed;
                    }
                }
                Ok(ClaimResolution::DoubleClaimed)
            }
            OutcomePlan::Apply => {
                if let Some(tx) = state.transactions.get_mut(&outcome.tx_id) {
                    tx.claim_tx_hash = outcome.claim_tx_hash.clone();
                    tx.claim_status = outcome.claim_status;
                    tx.amount = outcome.amount.clone();
                    tx.fee = outcome.fee.clone();
                    if outcome.claim_status == ClaimStatus::Confirmed {
                        tx.claim_at = Some(Utc::now());
                    }
                }
                if let Some(req) = state.requests.get_mut(&outcome.request_id) {
                    req.status = outcome.request_status;
                }
                Ok(ClaimResolution::Recorded)
            }
        }
    }

    async fn expire_stale_requests(&self, now: DateTime<Utc>) -> BridgeResult<u64> {
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .requests
            .values()
            .filter(|r| r.status == ClaimRequestStatus::Pending && r.expires_at <= now)
            .filter(|r| {
                state
                    .transactions
                    .get(&r.tx_id)
                    .map_or(true, |tx| !is_submitted(tx, r))
            })
            .map(|r| r.request_id.clone())
            .collect();
        for id in &stale {
            if let Some(req) = state.requests.get_mut(id) {
                req.status = ClaimRequestStatus::Expired;
            }
        }
        Ok(stale.len() as u64)
    }

    async fn count_claim_requests(&self, status: ClaimRequestStatus) -> BridgeResult<i64> {
        let state = self.state.lock().await;
        Ok(state.requests.values().filter(|r| r.status == status).count() as i64)
    }

    async fn create_treasury_deposit(&self, new: &NewTreasuryDeposit) -> BridgeResult<bool> {
        let mut state = self.state.lock().await;
        if state.treasury.contains_key(&new.tx_id) {
            return Ok(false);
        }
        state.treasury.insert(
            new.tx_id.clone(),
            TreasuryDeposit {
                tx_id: new.tx_id.clone(),
                from_address: new.from_address.clone(),
                treasury_address: new.treasury_address.clone(),
                token_address: new.token_address.clone(),
                amount: new.amount.clone(),
                tx_fee: new.tx_fee.clone(),
                status: TreasuryStatus::Unconfirmed,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn unconfirmed_treasury_deposit(
        &self,
        query: &TreasuryQuery,
    ) -> BridgeResult<Option<TreasuryDeposit>> {
        let state = self.state.lock().await;
        let mut matches: Vec<&TreasuryDeposit> = state
            .treasury
            .values()
            .filter(|d| {
                d.status == TreasuryStatus::Unconfirmed
                    && d.from_address.eq_ignore_ascii_case(&query.from_address)
                    && d.treasury_address.eq_ignore_ascii_case(&query.treasury_address)
                    && d.token_address.eq_ignore_ascii_case(&query.token_address)
                    && same_amount(&d.amount, &query.amount)
            })
            .collect();
        matches.sort_by_key(|d| d.created_at);
        Ok(matches.first().map(|d| (*d).clone()))
    }

    async fn treasury_deposit_by_tx(&self, tx_id: &str) -> BridgeResult<Option<TreasuryDeposit>> {
        Ok(self.state.lock().await.treasury.get(tx_id).cloned())
    }

    async fn treasury_deposits_by_sender(&self, sender: &str) -> BridgeResult<Vec<TreasuryDeposit>> {
        let state = self.state.lock().await;
        let mut rows: Vec<TreasuryDeposit> = state
            .treasury
            .values()
            .filter(|d| d.from_address.eq_ignore_ascii_case(sender))
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl AccountStore for MemoryLedger {
    async fn add_account(&self, address: &str, status: AccountStatus) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let key = account_key(address);
        if state.accounts.contains_key(&key) {
            return Err(BridgeError::validation(format!("account {address} already exists")));
        }
        state.accounts.insert(
            key.clone(),
            AdminAccount {
                address: key,
                status,
                roles: Vec::new(),
            },
        );
        Ok(())
    }

    async fn remove_account(&self, address: &str) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        state
            .accounts
            .remove(&account_key(address))
            .map(|_| ())
            .ok_or_else(|| BridgeError::NotFound(format!("account {address}")))
    }

    async fn get_account(&self, address: &str) -> BridgeResult<Option<AdminAccount>> {
        Ok(self.state.lock().await.accounts.get(&account_key(address)).cloned())
    }

    async fn set_account_status(&self, address: &str, status: AccountStatus) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&account_key(address))
            .ok_or_else(|| BridgeError::NotFound(format!("account {address}")))?;
        account.status = status;
        Ok(())
    }

    async fn assign_role(&self, address: &str, role: &str) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&account_key(address))
            .ok_or_else(|| BridgeError::NotFound(format!("account {address}")))?;
        if !account.has_role(role) {
            account.roles.push(role.to_string());
        }
        Ok(())
    }

    async fn accounts_with_role(
        &self,
        role: &str,
        offset: i64,
        limit: i64,
    ) -> BridgeResult<Vec<AdminAccount>> {
        let state = self.state.lock().await;
        let rows = state
            .accounts
            .values()
            .filter(|a| a.has_role(role))
            .skip(offset.max(0) as usize)
            .cloned();
        Ok(if limit > 0 {
            rows.take(limit as usize).collect()
        } else {
            rows.collect()
        })
    }

    async fn list_accounts(&self, offset: i64, limit: i64) -> BridgeResult<Vec<AdminAccount>> {
        let state = self.state.lock().await;
        let rows = state.accounts.values().skip(offset.max(0) as usize).cloned();
        Ok(if limit > 0 {
            rows.take(limit as usize).collect()
        } else {
            rows.collect()
        })
    }

    async fn list_roles(&self) -> BridgeResult<Vec<String>> {
        let state = self.state.lock().await;
        let roles: BTreeSet<&String> = state.accounts.values().flat_map(|a| &a.roles).collect();
        Ok(roles.into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn new_tx(hash: &str, treasury: Option<&str>) -> NewCashTransaction {
        NewCashTransaction {
            direction: Direction::WelCashinEth,
            deposit_tx_hash: hash.into(),
            treasury_tx_id: treasury.map(str::to_string),
            source_token_addr: "Wtoken".into(),
            dest_token_addr: "0xtoken".into(),
            source_wallet_addr: "Wsender".into(),
            dest_wallet_addr: "0xUser".into(),
            network_id: "1".into(),
            amount: "100".into(),
            fee: "1".into(),
            deposit_status: DepositStatus::Confirmed,
            deposit_at: Utc::now(),
        }
    }

    fn treasury(tx_id: &str) -> NewTreasuryDeposit {
        NewTreasuryDeposit {
            tx_id: tx_id.into(),
            from_address: "0xSender".into(),
            treasury_address: "0xTreasury".into(),
            token_address: "0xToken".into(),
            amount: "100".into(),
            tx_fee: "21000".into(),
        }
    }

    fn claim_request(id: &str, tx_id: i64, ttl: Duration) -> NewClaimRequest {
        NewClaimRequest {
            request_id: id.into(),
            tx_id,
            expires_at: Utc::now() + ttl,
        }
    }

    #[tokio::test]
    async fn test_create_cash_transaction_idempotent() {
        let ledger = MemoryLedger::new();
        ledger.create_treasury_deposit(&treasury("0xt1")).await.unwrap();

        let first = ledger
            .create_cash_transaction(&new_tx("0xabc", Some("0xt1")))
            .await
            .unwrap();
        let second = ledger
            .create_cash_transaction(&new_tx("0xabc", Some("0xt1")))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        let all = ledger
            .select_transactions(&TransactionFilter::new(Direction::WelCashinEth))
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        let deposit = ledger.treasury_deposit_by_tx("0xt1").await.unwrap().unwrap();
        assert_eq!(deposit.status, TreasuryStatus::IsCashin);
    }

    #[tokio::test]
    async fn test_missing_treasury_deposit_leaves_no_row() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .create_cash_transaction(&new_tx("0xabc", Some("0xmissing")))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
        assert!(ledger
            .select_by_deposit_hash(Direction::WelCashinEth, "0xabc")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_consumed_treasury_deposit_rejected() {
        let ledger = MemoryLedger::new();
        ledger.create_treasury_deposit(&treasury("0xt1")).await.unwrap();
        ledger
            .create_cash_transaction(&new_tx("0xabc", Some("0xt1")))
            .await
            .unwrap();

        let err = ledger
            .create_cash_transaction(&new_tx("0xdef", Some("0xt1")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage");
        assert!(ledger
            .select_by_deposit_hash(Direction::WelCashinEth, "0xdef")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_same_hash_different_direction_is_distinct() {
        let ledger = MemoryLedger::new();
        let a = ledger.create_cash_transaction(&new_tx("0xabc", None)).await.unwrap();
        let mut other = new_tx("0xabc", None);
        other.direction = Direction::EthCashoutWel;
        let b = ledger.create_cash_transaction(&other).await.unwrap();
        assert!(b.created);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_claim_request_roundtrip() {
        let ledger = MemoryLedger::new();
        let tx = ledger.create_cash_transaction(&new_tx("0xabc", None)).await.unwrap();
        ledger
            .create_claim_request(&claim_request("7", tx.id, Duration::minutes(3)))
            .await
            .unwrap();

        let pending = ledger.select_by_id(tx.id).await.unwrap().unwrap();
        assert_eq!(pending.claim_status, ClaimStatus::Pending);
        assert_eq!(pending.request_id.as_deref(), Some("7"));

        let resolution = ledger
            .update_claim_outcome(&ClaimOutcome {
                tx_id: tx.id,
                request_id: "7".into(),
                request_status: ClaimRequestStatus::Success,
                claim_tx_hash: Some("0xclaim".into()),
                amount: "100".into(),
                fee: "1".into(),
                claim_status: ClaimStatus::Confirmed,
            })
            .await
            .unwrap();
        assert_eq!(resolution, ClaimResolution::Recorded);

        let claimed = ledger.select_by_id(tx.id).await.unwrap().unwrap();
        assert_eq!(claimed.claim_status, ClaimStatus::Confirmed);
        assert_eq!(claimed.claim_tx_hash.as_deref(), Some("0xclaim"));
        assert!(claimed.claim_at.is_some());
        let request = ledger.get_claim_request("7").await.unwrap().unwrap();
        assert_eq!(request.status, ClaimRequestStatus::Success);

        let by_hash = ledger
            .select_by_claim_hash(Direction::WelCashinEth, "0xclaim")
            .await
            .unwrap();
        assert_eq!(by_hash.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_request_on_confirmed_rejected_without_row() {
        let ledger = MemoryLedger::new();
        let tx = ledger.create_cash_transaction(&new_tx("0xabc", None)).await.unwrap();
        ledger
            .create_claim_request(&claim_request("1", tx.id, Duration::minutes(3)))
            .await
            .unwrap();
        ledger
            .update_claim_outcome(&ClaimOutcome {
                tx_id: tx.id,
                request_id: "1".into(),
                request_status: ClaimRequestStatus::Success,
                claim_tx_hash: Some("0xclaim".into()),
                amount: "100".into(),
                fee: "1".into(),
                claim_status: ClaimStatus::Confirmed,
            })
            .await
            .unwrap();

        let err = ledger
            .create_claim_request(&claim_request("2", tx.id, Duration::minutes(3)))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::AlreadyClaimed);
        assert!(ledger.get_claim_request("2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_admit_one() {
        let ledger = Arc::new(MemoryLedger::new());
        let tx = ledger.create_cash_transaction(&new_tx("0xabc", None)).await.unwrap();

        let a = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .create_claim_request(&claim_request("a", tx.id, Duration::minutes(3)))
                    .await
            })
        };
        let b = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .create_claim_request(&claim_request("b", tx.id, Duration::minutes(3)))
                    .await
            })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(BridgeError::RequestPending)))
                .count(),
            1
        );
        assert_eq!(
            ledger.count_claim_requests(ClaimRequestStatus::Pending).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_expired_request_allows_new_one() {
        let ledger = MemoryLedger::new();
        let tx = ledger.create_cash_transaction(&new_tx("0xabc", None)).await.unwrap();
        ledger
            .create_claim_request(&claim_request("old", tx.id, Duration::seconds(-1)))
            .await
            .unwrap();

        ledger
            .create_claim_request(&claim_request("new", tx.id, Duration::minutes(3)))
            .await
            .unwrap();

        assert_eq!(
            ledger.get_claim_request("old").await.unwrap().unwrap().status,
            ClaimRequestStatus::Expired
        );
        assert_eq!(
            ledger.select_by_id(tx.id).await.unwrap().unwrap().request_id.as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn test_double_claim_marks_request() {
        let ledger = MemoryLedger::new();
        let tx = ledger.create_cash_transaction(&new_tx("0xabc", None)).await.unwrap();
        ledger
            .create_claim_request(&claim_request("1", tx.id, Duration::minutes(3)))
            .await
            .unwrap();
        let success = ClaimOutcome {
            tx_id: tx.id,
            request_id: "1".into(),
            request_status: ClaimRequestStatus::Success,
            claim_tx_hash: Some("0xclaim".into()),
            amount: "100".into(),
            fee: "1".into(),
            claim_status: ClaimStatus::Confirmed,
        };
        ledger.update_claim_outcome(&success).await.unwrap();

        // Replaying the same outcome is a no-op
        assert_eq!(
            ledger.update_claim_outcome(&success).await.unwrap(),
            ClaimResolution::Unchanged
        );

        let second = ClaimOutcome {
            claim_tx_hash: Some("0xsecond".into()),
            ..success
        };
        assert_eq!(
            ledger.update_claim_outcome(&second).await.unwrap(),
            ClaimResolution::DoubleClaimed
        );
        assert_eq!(
            ledger.get_claim_request("1").await.unwrap().unwrap().status,
            ClaimRequestStatus::DoubleClaimed
        );
        let row = ledger.select_by_id(tx.id).await.unwrap().unwrap();
        assert_eq!(row.claim_tx_hash.as_deref(), Some("0xclaim"));
    }

    #[tokio::test]
    async fn test_sweep_skips_submitted_requests() {
        let ledger = MemoryLedger::new();
        let a = ledger.create_cash_transaction(&new_tx("0xa", None)).await.unwrap();
        let b = ledger.create_cash_transaction(&new_tx("0xb", None)).await.unwrap();
        ledger
            .create_claim_request(&claim_request("ra", a.id, Duration::seconds(-5)))
            .await
            .unwrap();
        ledger
            .create_claim_request(&claim_request("rb", b.id, Duration::minutes(3)))
            .await
            .unwrap();
        ledger
            .record_claim_submission(b.id, "rb", "0xsubmitted", &serde_json::json!({}))
            .await
            .unwrap();

        let expired = ledger
            .expire_stale_requests(Utc::now() + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(
            ledger.get_claim_request("ra").await.unwrap().unwrap().status,
            ClaimRequestStatus::Expired
        );
        assert_eq!(
            ledger.get_claim_request("rb").await.unwrap().unwrap().status,
            ClaimRequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_update_cash_transaction_forward_only() {
        let ledger = MemoryLedger::new();
        let mut new = new_tx("0xabc", None);
        new.deposit_status = DepositStatus::Unconfirmed;
        let id = ledger.create_cash_transaction(&new).await.unwrap().id;

        ledger.confirm_deposit(Direction::WelCashinEth, "0xabc").await.unwrap();
        let mut row = ledger.select_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.deposit_status, DepositStatus::Confirmed);

        row.deposit_status = DepositStatus::Unconfirmed;
        assert!(matches!(
            ledger.update_cash_transaction(&row).await,
            Err(BridgeError::InvalidTransition(_))
        ));

        row.deposit_status = DepositStatus::Confirmed;
        row.fee = "2".into();
        ledger.update_cash_transaction(&row).await.unwrap();
        assert_eq!(ledger.select_by_id(id).await.unwrap().unwrap().fee, "2");
    }

    #[tokio::test]
    async fn test_select_transactions_filters_and_pages() {
        let ledger = MemoryLedger::new();
        for i in 0..5 {
            let mut new = new_tx(&format!("0x{i}"), None);
            if i % 2 == 0 {
                new.source_wallet_addr = "Weven".into();
            }
            ledger.create_cash_transaction(&new).await.unwrap();
        }

        let mut filter = TransactionFilter::new(Direction::WelCashinEth);
        filter.sender = Some("Weven".into());
        assert_eq!(ledger.select_transactions(&filter).await.unwrap().len(), 3);

        filter.offset = 1;
        filter.limit = 1;
        let page = ledger.select_transactions(&filter).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].deposit_tx_hash.as_deref(), Some("0x2"));

        let mut newest = TransactionFilter::new(Direction::WelCashinEth);
        newest.order = ListOrder::NewestFirst;
        newest.limit = 1;
        let rows = ledger.select_transactions(&newest).await.unwrap();
        assert_eq!(rows[0].deposit_tx_hash.as_deref(), Some("0x4"));

        let other = TransactionFilter::new(Direction::EthCashinWel);
        assert!(ledger.select_transactions(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_treasury_lookup() {
        let ledger = MemoryLedger::new();
        assert!(ledger.create_treasury_deposit(&treasury("0xt1")).await.unwrap());
        assert!(!ledger.create_treasury_deposit(&treasury("0xt1")).await.unwrap());

        let query = TreasuryQuery {
            from_address: "0xsender".into(),
            treasury_address: "0xtreasury".into(),
            token_address: "0xtoken".into(),
            amount: "100".into(),
        };
        let found = ledger.unconfirmed_treasury_deposit(&query).await.unwrap().unwrap();
        assert_eq!(found.tx_id, "0xt1");

        let wrong_amount = TreasuryQuery {
            amount: "99".into(),
            ..query
        };
        assert!(ledger
            .unconfirmed_treasury_deposit(&wrong_amount)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            ledger.treasury_deposits_by_sender("0xSENDER").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_treasury_lookup_compares_amount_numerically() {
        let ledger = MemoryLedger::new();
        ledger.create_treasury_deposit(&treasury("0xt1")).await.unwrap();

        let query = TreasuryQuery {
            from_address: "0xsender".into(),
            treasury_address: "0xtreasury".into(),
            token_address: "0xtoken".into(),
            amount: "100.0".into(),
        };
        assert!(ledger.unconfirmed_treasury_deposit(&query).await.unwrap().is_some());

        for amount in ["101", "not-a-number"] {
            let other = TreasuryQuery {
                amount: amount.into(),
                ..query.clone()
            };
            assert!(ledger.unconfirmed_treasury_deposit(&other).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_accounts() {
        let ledger = MemoryLedger::new();
        ledger.add_account("0xAdmin", AccountStatus::Ok).await.unwrap();
        ledger.assign_role("0xadmin", "authenticator").await.unwrap();
        ledger.assign_role("0xadmin", "authenticator").await.unwrap();

        let account = ledger.get_account("0xADMIN").await.unwrap().unwrap();
        assert_eq!(account.roles, vec!["authenticator".to_string()]);

        ledger.set_account_status("0xAdmin", AccountStatus::Locked).await.unwrap();
        assert_eq!(
            ledger.get_account("0xadmin").await.unwrap().unwrap().status,
            AccountStatus::Locked
        );
        assert_eq!(
            ledger.accounts_with_role("authenticator", 0, 10).await.unwrap().len(),
            1
        );

        ledger.remove_account("0xadmin").await.unwrap();
        assert!(matches!(
            ledger.remove_account("0xadmin").await,
            Err(BridgeError::NotFound(_))
        ));
    }
}
