//! In-process bridge wiring for tests: memory stores, scripted chains and a
//! running flow engine with short retry backoffs.

use bridge_chains::testing::MockChainRpc;
use bridge_chains::{ChainAddress, ContractCaller, TxSigner, DEFAULT_ADDRESS_PREFIX};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::claim::ClaimEngine;
use crate::db::{MemoryLedger, NewCashTransaction};
use crate::governance::{Governance, SignerCell};
use crate::orchestrator::activities::{BridgeActivities, ChainCallers};
use crate::orchestrator::{flows, EngineBuilder, FlowEngine, MemoryFlowJournal, RetryPolicy};
use crate::service::BridgeService;
use crate::tokens::{TokenMap, TokenPair};
use crate::types::{DepositStatus, Direction};

// anvil account #0
pub(crate) const ADMIN_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub(crate) const ADMIN: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
pub(crate) const TREASURY: &str = "0x00000000000000000000000000000000000000fe";
pub(crate) const ETH_TOKEN: &str = "0x00000000000000000000000000000000000000aa";
pub(crate) const ETH_RECEIVER: &str = "0x1111111111111111111111111111111111111111";

pub(crate) fn wel_token() -> String {
    ChainAddress([0xaa; 20]).to_base58(DEFAULT_ADDRESS_PREFIX)
}

pub(crate) fn wel_receiver() -> String {
    ChainAddress([0x22; 20]).to_base58(DEFAULT_ADDRESS_PREFIX)
}

pub(crate) struct TestBridge {
    pub ledger: Arc<MemoryLedger>,
    pub eth: Arc<MockChainRpc>,
    pub wel: Arc<MockChainRpc>,
    pub engine: FlowEngine,
    pub service: BridgeService,
    pub governance: Governance,
    _shutdown: mpsc::Sender<()>,
}

impl TestBridge {
    /// Wire everything up and start the engine. The engine stops when the
    /// bridge is dropped.
    pub async fn start(request_ttl: Duration) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let eth = Arc::new(MockChainRpc::new("eth"));
        let wel = Arc::new(MockChainRpc::new("wel"));

        let caller =
            |rpc: Arc<MockChainRpc>, byte: u8| ContractCaller::new(rpc, ChainAddress([byte; 20]), 1_000_000);
        let chains = ChainCallers {
            eth_bridge: caller(eth.clone(), 0xb1),
            eth_governance: caller(eth.clone(), 0xb2),
            wel_bridge: caller(wel.clone(), 0xb3),
            wel_governance: caller(wel.clone(), 0xb4),
            wel_address_prefix: DEFAULT_ADDRESS_PREFIX,
        };
        let tokens = TokenMap::new(vec![TokenPair {
            eth: ETH_TOKEN.into(),
            wel: wel_token(),
            eth_name: "USDT".into(),
            wel_name: "wUSDT".into(),
        }])
        .unwrap();

        let signer = Arc::new(SignerCell::new(Some(TxSigner::from_hex(ADMIN_KEY).unwrap())));
        let claims = Arc::new(ClaimEngine::new(ledger.clone(), request_ttl));
        let activities = Arc::new(BridgeActivities::new(
            claims.clone(),
            ledger.clone(),
            Arc::new(tokens),
            chains,
            signer.clone(),
            TREASURY.into(),
        ));

        let builder = flows::register(
            EngineBuilder::new(Arc::new(MemoryFlowJournal::new()))
                .poll_interval(std::time::Duration::from_millis(10)),
            4,
            2,
        );
        let engine = activities
            .register_with_policy(builder, |class| {
                RetryPolicy::immediate(RetryPolicy::for_class(class).max_attempts)
            })
            .build();

        let (shutdown, rx) = mpsc::channel(1);
        tokio::spawn(engine.clone().run(rx));

        let orchestration = Arc::new(engine.clone());
        Self {
            service: BridgeService::new(claims, orchestration.clone()),
            governance: Governance::new(ledger.clone(), orchestration, signer),
            ledger,
            eth,
            wel,
            engine,
            _shutdown: shutdown,
        }
    }

    pub fn new_deposit(direction: Direction, hash: &str, receiver: &str) -> NewCashTransaction {
        let (source_token, dest_token) = match direction.dest_chain() {
            crate::types::Chain::Eth => (wel_token(), ETH_TOKEN.to_string()),
            crate::types::Chain::Wel => (ETH_TOKEN.to_string(), wel_token()),
        };
        NewCashTransaction {
            direction,
            deposit_tx_hash: hash.into(),
            treasury_tx_id: None,
            source_token_addr: source_token,
            dest_token_addr: dest_token,
            source_wallet_addr: "sender".into(),
            dest_wallet_addr: receiver.into(),
            network_id: "1".into(),
            amount: "100".into(),
            fee: "0".into(),
            deposit_status: DepositStatus::Confirmed,
            deposit_at: Utc::now(),
        }
    }

    /// Record a confirmed deposit of 100 units.
    pub async fn deposit(&self, direction: Direction, hash: &str, receiver: &str) -> i64 {
        self.service
            .record_deposit(&Self::new_deposit(direction, hash, receiver))
            .await
            .unwrap()
            .id
    }
}
