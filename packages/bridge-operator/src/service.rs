//! API-level entry point of the bridge
//!
//! Callers receive the terminal error class and message of the operation;
//! storage and RPC details never leave [`BridgeError`].

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::claim::{generate_request_id, ClaimEngine, ClaimTicket};
use crate::db::{
    CashTransaction, Insertion, LedgerStore, NewCashTransaction, NewTreasuryDeposit,
    TransactionFilter, TreasuryDeposit,
};
use crate::error::{BridgeError, BridgeResult};
use crate::orchestrator::activities::ClaimInput;
use crate::orchestrator::flows::{
    claim_flow_id, treasury_flow_id, ClaimFlowOutput, TreasuryCashinInput, TreasuryCashinOutput,
    CASHIN_CLAIM_FLOW, CLAIM_TRIGGERED, TREASURY_CASHIN_FLOW,
};
use crate::orchestrator::{FlowHandle, Orchestration};
use crate::types::Direction;

/// A claim flow that has issued its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedClaim {
    pub ticket: ClaimTicket,
    pub handle: FlowHandle,
}

pub struct BridgeService {
    claims: Arc<ClaimEngine>,
    orchestration: Arc<dyn Orchestration>,
}

impl BridgeService {
    pub fn new(claims: Arc<ClaimEngine>, orchestration: Arc<dyn Orchestration>) -> Self {
        Self {
            claims,
            orchestration,
        }
    }

    fn ledger(&self) -> &Arc<dyn LedgerStore> {
        self.claims.ledger()
    }

    /// Start the claim flow for a deposit and return once its request is issued.
    pub async fn start_claim(
        &self,
        direction: Direction,
        deposit_tx_hash: &str,
        claimant: &str,
    ) -> BridgeResult<StartedClaim> {
        let input = ClaimInput {
            direction,
            deposit_tx_hash: deposit_tx_hash.to_string(),
            claimant: claimant.to_string(),
            request_id: generate_request_id(),
        };

        let flow_id = claim_flow_id(direction, deposit_tx_hash);
        let handle = match self
            .orchestration
            .start_flow(CASHIN_CLAIM_FLOW, &flow_id, json!(input))
            .await
        {
            Ok(handle) => handle,
            // A claim flow for this deposit still owns a request
            Err(BridgeError::FlowAlreadyRunning(_)) => return Err(BridgeError::RequestPending),
            Err(e) => return Err(e),
        };

        let ticket: ClaimTicket =
            serde_json::from_value(self.orchestration.flow_progress(&handle).await?)?;
        debug!(flow_id = %handle.flow_id, request_id = %ticket.request_id, "Claim flow started");
        Ok(StartedClaim { ticket, handle })
    }

    /// Accept the user's trigger for an issued request and wake its flow.
    pub async fn trigger_claim(&self, request_id: &str) -> BridgeResult<()> {
        let request = self.claims.validate_trigger(request_id).await?;
        let tx = self
            .ledger()
            .select_by_id(request.tx_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("cash transaction {}", request.tx_id)))?;
        let deposit_tx_hash = tx.deposit_tx_hash.as_deref().ok_or_else(|| {
            BridgeError::validation(format!("cash transaction {} has no deposit hash", tx.id))
        })?;

        self.orchestration
            .signal_flow(
                &claim_flow_id(tx.direction, deposit_tx_hash),
                CLAIM_TRIGGERED,
                json!({ "request_id": request_id }),
            )
            .await?;
        info!(request_id, tx_id = tx.id, "Claim triggered");
        Ok(())
    }

    /// Wait for a claim flow to finish.
    pub async fn claim_outcome(&self, handle: &FlowHandle) -> BridgeResult<ClaimFlowOutput> {
        Ok(serde_json::from_value(
            self.orchestration.flow_result(handle).await?,
        )?)
    }

    /// Turn a matched treasury deposit into a cash-in record.
    pub async fn cashin_from_treasury(
        &self,
        input: TreasuryCashinInput,
    ) -> BridgeResult<TreasuryCashinOutput> {
        let handle = self
            .orchestration
            .start_flow(TREASURY_CASHIN_FLOW, &treasury_flow_id(&input), json!(input))
            .await?;
        Ok(serde_json::from_value(
            self.orchestration.flow_result(&handle).await?,
        )?)
    }

    /// Record a parsed deposit fact.
    pub async fn record_deposit(&self, new: &NewCashTransaction) -> BridgeResult<Insertion> {
        self.ledger().create_cash_transaction(new).await
    }

    /// Record a raw transfer into the treasury. Returns false if already known.
    pub async fn record_treasury_deposit(&self, new: &NewTreasuryDeposit) -> BridgeResult<bool> {
        self.ledger().create_treasury_deposit(new).await
    }

    pub async fn confirm_deposit(&self, direction: Direction, deposit_tx_hash: &str) -> BridgeResult<()> {
        self.ledger().confirm_deposit(direction, deposit_tx_hash).await
    }

    pub async fn transaction(
        &self,
        direction: Direction,
        deposit_tx_hash: &str,
    ) -> BridgeResult<CashTransaction> {
        self.ledger()
            .select_by_deposit_hash(direction, deposit_tx_hash)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("deposit {deposit_tx_hash}")))
    }

    pub async fn transactions(&self, filter: &TransactionFilter) -> BridgeResult<Vec<CashTransaction>> {
        self.ledger().select_transactions(filter).await
    }

    pub async fn treasury_deposits_by_sender(&self, sender: &str) -> BridgeResult<Vec<TreasuryDeposit>> {
        self.ledger().treasury_deposits_by_sender(sender).await
    }
}
