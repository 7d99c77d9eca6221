//! Postgres integration tests for the ledger and flow journal
//!
//! Run with: cargo test --test integration_test -- --ignored --nocapture
//!
//! Prerequisites:
//! - DATABASE_URL pointing at a disposable Postgres database

use std::sync::Arc;

use bridge_operator::claim::{generate_request_id, ClaimEngine};
use bridge_operator::db::{
    self, AccountStore, ClaimOutcome, LedgerStore, NewCashTransaction, NewTreasuryDeposit,
    PgLedger, TreasuryQuery,
};
use bridge_operator::orchestrator::{FlowJournal, FlowStatus, PgFlowJournal, StepOutcome, StepRecord};
use bridge_operator::types::{AccountStatus, ClaimRequestStatus, ClaimStatus, DepositStatus, Direction};
use bridge_operator::BridgeError;
use chrono::{Duration, Utc};
use serde_json::json;

mod helpers {
    use sqlx::PgPool;

    /// Connect and migrate, or None when DATABASE_URL is unset
    pub async fn pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = bridge_operator::db::create_pool(&url, 10)
            .await
            .expect("database reachable");
        bridge_operator::db::run_migrations(&pool)
            .await
            .expect("migrations apply");
        Some(pool)
    }

    /// Random suffix so runs never collide on unique keys
    pub fn unique(prefix: &str) -> String {
        let id = bridge_operator::claim::generate_request_id();
        format!("{}{}", prefix, &id[..16.min(id.len())])
    }
}

fn deposit(hash: &str, receiver: &str) -> NewCashTransaction {
    NewCashTransaction {
        direction: Direction::WelCashinEth,
        deposit_tx_hash: hash.to_string(),
        treasury_tx_id: None,
        source_token_addr: "WToken".into(),
        dest_token_addr: "0x00000000000000000000000000000000000000aa".into(),
        source_wallet_addr: "WSender".into(),
        dest_wallet_addr: receiver.to_string(),
        network_id: "1".into(),
        amount: "123456789012345678901234567890".into(),
        fee: "0".into(),
        deposit_status: DepositStatus::Confirmed,
        deposit_at: Utc::now(),
    }
}

#[tokio::test]
#[ignore]
async fn test_pg_claim_lifecycle() {
    let Some(pool) = helpers::pool().await else {
        println!("DATABASE_URL not set, skipping");
        return;
    };
    let ledger = Arc::new(PgLedger::new(pool));
    let hash = helpers::unique("0xdep");

    let first = ledger.create_cash_transaction(&deposit(&hash, "0xUser")).await.unwrap();
    let again = ledger.create_cash_transaction(&deposit(&hash, "0xUser")).await.unwrap();
    assert!(first.created);
    assert!(!again.created);
    assert_eq!(first.id, again.id);

    let engine = ClaimEngine::new(ledger.clone(), Duration::seconds(180));
    let ticket = engine
        .request_claim(Direction::WelCashinEth, &hash, "0xuser")
        .await
        .unwrap();
    assert_eq!(ticket.amount, "123456789012345678901234567890");
    assert_eq!(
        engine
            .request_claim(Direction::WelCashinEth, &hash, "0xUser")
            .await
            .unwrap_err(),
        BridgeError::RequestPending
    );

    let signed = json!({ "tx_id": "0xclaim", "raw_data_hex": "f86c" });
    ledger
        .record_claim_submission(ticket.transaction_id, &ticket.request_id, "0xclaim", &signed)
        .await
        .unwrap();
    assert_eq!(
        ledger.claim_submission(&ticket.request_id).await.unwrap(),
        Some(signed)
    );
    let outcome = ClaimOutcome {
        tx_id: ticket.transaction_id,
        request_id: ticket.request_id.clone(),
        request_status: ClaimRequestStatus::Success,
        claim_tx_hash: Some("0xclaim".into()),
        amount: ticket.amount.clone(),
        fee: "0".into(),
        claim_status: ClaimStatus::Confirmed,
    };
    engine.record_outcome(&outcome).await.unwrap();
    // Replay is a no-op
    engine.record_outcome(&outcome).await.unwrap();

    let tx = ledger.select_by_id(ticket.transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.claim_status, ClaimStatus::Confirmed);
    assert_eq!(tx.claim_tx_hash.as_deref(), Some("0xclaim"));
    assert_eq!(
        ledger
            .select_by_request_id(&ticket.request_id)
            .await
            .unwrap()
            .map(|t| t.id),
        Some(ticket.transaction_id)
    );
    assert_eq!(
        engine
            .request_claim(Direction::WelCashinEth, &hash, "0xUser")
            .await
            .unwrap_err(),
        BridgeError::AlreadyClaimed
    );
}

#[tokio::test]
#[ignore]
async fn test_pg_concurrent_requests_admit_one() {
    let Some(pool) = helpers::pool().await else {
        println!("DATABASE_URL not set, skipping");
        return;
    };
    let ledger = Arc::new(PgLedger::new(pool));
    let hash = helpers::unique("0xrace");
    ledger.create_cash_transaction(&deposit(&hash, "0xUser")).await.unwrap();
    let engine = Arc::new(ClaimEngine::new(ledger.clone(), Duration::seconds(180)));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let hash = hash.clone();
            tokio::spawn(async move {
                engine
                    .request_claim(Direction::WelCashinEth, &hash, "0xUser")
                    .await
            })
        })
        .collect();

    let mut issued = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => issued += 1,
            Err(e) => assert_eq!(e, BridgeError::RequestPending),
        }
    }
    assert_eq!(issued, 1);
}

#[tokio::test]
#[ignore]
async fn test_pg_elapsed_request_is_replaced() {
    let Some(pool) = helpers::pool().await else {
        println!("DATABASE_URL not set, skipping");
        return;
    };
    let ledger = Arc::new(PgLedger::new(pool));
    let hash = helpers::unique("0xstale");
    ledger.create_cash_transaction(&deposit(&hash, "0xUser")).await.unwrap();

    let short = ClaimEngine::new(ledger.clone(), Duration::seconds(-1));
    let stale = short
        .request_claim(Direction::WelCashinEth, &hash, "0xUser")
        .await
        .unwrap();

    let engine = ClaimEngine::new(ledger.clone(), Duration::seconds(180));
    let fresh = engine
        .request_claim(Direction::WelCashinEth, &hash, "0xUser")
        .await
        .unwrap();
    assert_ne!(stale.request_id, fresh.request_id);
    assert_eq!(
        ledger
            .get_claim_request(&stale.request_id)
            .await
            .unwrap()
            .unwrap()
            .status,
        ClaimRequestStatus::Expired
    );
}

#[tokio::test]
#[ignore]
async fn test_pg_treasury_deposit_consumed_once() {
    let Some(pool) = helpers::pool().await else {
        println!("DATABASE_URL not set, skipping");
        return;
    };
    let ledger = PgLedger::new(pool);
    let tx_id = helpers::unique("0xtreasury");
    let sender = helpers::unique("0xsender");
    let treasury = "0x00000000000000000000000000000000000000fe";

    let new = NewTreasuryDeposit {
        tx_id: tx_id.clone(),
        from_address: sender.clone(),
        treasury_address: treasury.into(),
        token_address: "0x00000000000000000000000000000000000000aa".into(),
        amount: "500".into(),
        tx_fee: "1".into(),
    };
    assert!(ledger.create_treasury_deposit(&new).await.unwrap());
    assert!(!ledger.create_treasury_deposit(&new).await.unwrap());

    let query = TreasuryQuery {
        from_address: sender.to_uppercase().replacen("0X", "0x", 1),
        treasury_address: treasury.into(),
        token_address: new.token_address.clone(),
        amount: "500".into(),
    };
    let found = ledger.unconfirmed_treasury_deposit(&query).await.unwrap().unwrap();
    assert_eq!(found.tx_id, tx_id);

    let mut cashin = deposit(&tx_id, "WReceiver");
    cashin.direction = Direction::EthCashinWel;
    cashin.treasury_tx_id = Some(tx_id.clone());
    assert!(ledger.create_cash_transaction(&cashin).await.unwrap().created);

    assert!(ledger.unconfirmed_treasury_deposit(&query).await.unwrap().is_none());
    assert_eq!(ledger.treasury_deposits_by_sender(&sender).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_pg_account_registry() {
    let Some(pool) = helpers::pool().await else {
        println!("DATABASE_URL not set, skipping");
        return;
    };
    let ledger = PgLedger::new(pool);
    let address = format!("0x{:0>40}", &generate_request_id()[..20]);
    let role = helpers::unique("role-");

    ledger.add_account(&address, AccountStatus::Ok).await.unwrap();
    ledger.assign_role(&address.to_uppercase().replacen("0X", "0x", 1), &role).await.unwrap();
    let listed = ledger.accounts_with_role(&role, 0, 10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].has_role(&role));
    assert!(ledger.list_roles().await.unwrap().contains(&role));
    assert!(ledger
        .list_accounts(0, 0)
        .await
        .unwrap()
        .iter()
        .any(|a| a.address == address));

    ledger.set_account_status(&address, AccountStatus::Locked).await.unwrap();
    assert_eq!(
        ledger.get_account(&address).await.unwrap().unwrap().status,
        AccountStatus::Locked
    );
    ledger.remove_account(&address).await.unwrap();
    assert!(ledger.get_account(&address).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_pg_journal_runs_steps_and_signals() {
    let Some(pool) = helpers::pool().await else {
        println!("DATABASE_URL not set, skipping");
        return;
    };
    let journal = PgFlowJournal::new(pool);
    let queue = helpers::unique("queue-");
    let flow_id = helpers::unique("flow-");

    let run = journal
        .create_flow(&flow_id, "TestFlow", &queue, &json!({ "n": 1 }))
        .await
        .unwrap();
    assert!(matches!(
        journal.create_flow(&flow_id, "TestFlow", &queue, &json!({})).await,
        Err(BridgeError::FlowAlreadyRunning(_))
    ));

    let claimed = journal.claim_next(&queue).await.unwrap().unwrap();
    assert_eq!(claimed.run_id, run.run_id);
    assert_eq!(claimed.status, FlowStatus::Running);
    assert!(journal.claim_next(&queue).await.unwrap().is_none());

    let step = StepRecord {
        run_id: run.run_id,
        seq: 0,
        name: "Double".into(),
        outcome: StepOutcome::Ok(json!(2)),
    };
    journal.save_step(&step).await.unwrap();
    journal
        .save_step(&StepRecord {
            outcome: StepOutcome::Err(BridgeError::AlreadyClaimed),
            ..step.clone()
        })
        .await
        .unwrap();
    assert_eq!(journal.load_step(run.run_id, 0).await.unwrap(), Some(step));

    journal
        .push_signal(run.run_id, "go", &json!({ "x": 1 }))
        .await
        .unwrap();
    assert_eq!(
        journal.consume_signal(run.run_id, "go", 1).await.unwrap(),
        Some(json!({ "x": 1 }))
    );
    assert_eq!(journal.consume_signal(run.run_id, "go", 2).await.unwrap(), None);
    assert!(journal.load_step(run.run_id, 1).await.unwrap().is_some());

    assert!(journal
        .finish_flow(run.run_id, FlowStatus::Completed, Some(&json!("done")), None)
        .await
        .unwrap());
    assert!(!journal
        .finish_flow(run.run_id, FlowStatus::Failed, None, Some(&BridgeError::Canceled))
        .await
        .unwrap());
    let record = journal.flow(run.run_id).await.unwrap().unwrap();
    assert_eq!(record.status, FlowStatus::Completed);
    assert_eq!(record.output, Some(json!("done")));

    // The id is free again once the run closed
    journal
        .create_flow(&flow_id, "TestFlow", &queue, &json!({}))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn test_pg_migrations_are_idempotent() {
    let Some(pool) = helpers::pool().await else {
        println!("DATABASE_URL not set, skipping");
        return;
    };
    db::run_migrations(&pool).await.unwrap();
}
