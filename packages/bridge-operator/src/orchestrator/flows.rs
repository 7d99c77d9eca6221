//! Bridge flows
//!
//! - `CashinClaimFlow`: issue a claim request, wait for the user's trigger
//!   until the request expires, then sign, broadcast and confirm the claim on
//!   the destination chain and record the outcome.
//! - `TreasuryCashinFlow`: match a treasury deposit, map its token and record
//!   the cash-in atomically with consuming the deposit.
//! - `GovernanceFlow`: check the administrative account, then grant or revoke
//!   a contract role.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::activities::*;
use super::engine::{EngineBuilder, FlowContext};
use super::{BRIDGE_QUEUE, GOVERNANCE_QUEUE};
use crate::claim::ClaimTicket;
use crate::db::{ClaimOutcome, ClaimResolution, Insertion, NewCashTransaction, TreasuryDeposit};
use crate::error::{BridgeError, BridgeResult};
use crate::governance::GovernanceRequest;
use crate::types::{ClaimRequestStatus, ClaimStatus, DepositStatus, Direction};
use bridge_chains::TransactionInfo;

pub const CASHIN_CLAIM_FLOW: &str = "CashinClaimFlow";
pub const TREASURY_CASHIN_FLOW: &str = "TreasuryCashinFlow";
pub const GOVERNANCE_FLOW: &str = "GovernanceFlow";

/// Signal a user sends to execute an issued claim.
pub const CLAIM_TRIGGERED: &str = "claim_triggered";

/// One claim flow per deposit at a time.
pub fn claim_flow_id(direction: Direction, deposit_tx_hash: &str) -> String {
    format!("claim:{}:{}", direction.as_str(), deposit_tx_hash)
}

pub fn treasury_flow_id(input: &TreasuryCashinInput) -> String {
    format!(
        "treasury-cashin:{}:{}:{}",
        input.from_address.to_lowercase(),
        input.token_address.to_lowercase(),
        input.amount
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimFlowOutput {
    Claimed {
        request_id: String,
        claim_tx_hash: String,
    },
    /// No trigger arrived before the request expired
    Expired { request_id: String },
    /// The deposit had already been claimed under another request
    DoubleClaimed {
        request_id: String,
        claim_tx_hash: String,
    },
}

async fn cashin_claim_flow(mut ctx: FlowContext, input: ClaimInput) -> BridgeResult<ClaimFlowOutput> {
    let ticket: ClaimTicket = ctx.execute_activity(REQUEST_CLAIM, &input).await?;
    ctx.publish(&ticket).await?;

    if ctx.wait_signal(CLAIM_TRIGGERED, ticket.expires_at).await?.is_none() {
        let _: bool = ctx
            .execute_activity(EXPIRE_CLAIM_REQUEST, &ticket.request_id)
            .await?;
        info!(request_id = %ticket.request_id, "Claim request expired without trigger");
        return Ok(ClaimFlowOutput::Expired {
            request_id: ticket.request_id,
        });
    }

    let submission: ClaimSubmission = match ctx.execute_activity(SUBMIT_CLAIM, &ticket).await {
        Ok(submission) => submission,
        // Attempts ran out on a transient error: a recorded claim may still land
        Err(e) if e.is_retryable() => return Err(e),
        Err(e) => return Err(release_request(&mut ctx, &ticket, e).await),
    };

    let confirmation = ConfirmationInput {
        chain: ticket.direction.dest_chain(),
        tx_hash: submission.claim_tx_hash.clone(),
    };
    let info: TransactionInfo = match ctx
        .execute_activity(AWAIT_CLAIM_CONFIRMATION, &confirmation)
        .await
    {
        Ok(info) => info,
        Err(e @ BridgeError::ClaimFailedOnChain(_)) => {
            return Err(release_request(&mut ctx, &ticket, e).await)
        }
        // Still unconfirmed: keep the request open so no second claim is issued
        Err(e) => return Err(e),
    };

    let outcome = ClaimOutcome {
        tx_id: ticket.transaction_id,
        request_id: ticket.request_id.clone(),
        request_status: ClaimRequestStatus::Success,
        claim_tx_hash: Some(info.tx_id.clone()),
        amount: ticket.amount.clone(),
        fee: ticket.fee.clone(),
        claim_status: ClaimStatus::Confirmed,
    };
    let resolution: ClaimResolution = ctx.execute_activity(UPDATE_CLAIM_OUTCOME, &outcome).await?;

    Ok(match resolution {
        ClaimResolution::DoubleClaimed => ClaimFlowOutput::DoubleClaimed {
            request_id: ticket.request_id,
            claim_tx_hash: info.tx_id,
        },
        ClaimResolution::Recorded | ClaimResolution::Unchanged => ClaimFlowOutput::Claimed {
            request_id: ticket.request_id,
            claim_tx_hash: info.tx_id,
        },
    })
}

/// Expire the request after a claim that never landed, so the deposit can be claimed again.
async fn release_request(ctx: &mut FlowContext, ticket: &ClaimTicket, cause: BridgeError) -> BridgeError {
    if matches!(cause, BridgeError::Canceled) {
        return cause;
    }
    warn!(request_id = %ticket.request_id, error = %cause, "Claim failed, releasing request");
    match ctx
        .execute_activity::<_, bool>(EXPIRE_CLAIM_REQUEST, &ticket.request_id)
        .await
    {
        Ok(_) => cause,
        Err(e) => e,
    }
}

/// Input of `TreasuryCashinFlow`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryCashinInput {
    pub from_address: String,
    /// ETH token sent to the treasury
    pub token_address: String,
    pub amount: String,
    /// WEL account that will claim
    pub receiver: String,
    pub network_id: String,
    #[serde(default = "zero")]
    pub fee: String,
}

fn zero() -> String {
    "0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryCashinOutput {
    pub transaction_id: i64,
    pub deposit_tx_hash: String,
    pub created: bool,
    pub deposit_at: DateTime<Utc>,
}

async fn treasury_cashin_flow(
    mut ctx: FlowContext,
    input: TreasuryCashinInput,
) -> BridgeResult<TreasuryCashinOutput> {
    let lookup = TreasuryLookup {
        from_address: input.from_address.clone(),
        token_address: input.token_address.clone(),
        amount: input.amount.clone(),
    };
    let deposit: TreasuryDeposit = ctx
        .execute_activity(GET_UNCONFIRMED_TREASURY_DEPOSIT, &lookup)
        .await?;
    let wel_token: String = ctx
        .execute_activity(MAP_ETH_TOKEN_TO_WEL, &deposit.token_address)
        .await?;

    let new = NewCashTransaction {
        direction: Direction::EthCashinWel,
        deposit_tx_hash: deposit.tx_id.clone(),
        treasury_tx_id: Some(deposit.tx_id.clone()),
        source_token_addr: deposit.token_address.clone(),
        dest_token_addr: wel_token,
        source_wallet_addr: deposit.from_address.clone(),
        dest_wallet_addr: input.receiver,
        network_id: input.network_id,
        amount: deposit.amount.clone(),
        fee: input.fee,
        deposit_status: DepositStatus::Confirmed,
        deposit_at: deposit.created_at,
    };
    let insertion: Insertion = ctx.execute_activity(CREATE_CASH_TRANSACTION, &new).await?;

    Ok(TreasuryCashinOutput {
        transaction_id: insertion.id,
        deposit_tx_hash: deposit.tx_id,
        created: insertion.created,
        deposit_at: deposit.created_at,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceOutput {
    pub tx_hash: String,
}

async fn governance_flow(
    mut ctx: FlowContext,
    request: GovernanceRequest,
) -> BridgeResult<GovernanceOutput> {
    let signer: String = ctx.execute_activity(CHECK_ADMIN_ACCOUNT, &()).await?;
    let tx_hash: String = ctx
        .execute_activity(INVOKE_GOVERNANCE, &GovernanceCall { request, signer })
        .await?;
    Ok(GovernanceOutput { tx_hash })
}

/// Register the bridge flows on their task queues.
pub fn register(builder: EngineBuilder, bridge_workers: usize, governance_workers: usize) -> EngineBuilder {
    builder
        .queue(BRIDGE_QUEUE, bridge_workers)
        .queue(GOVERNANCE_QUEUE, governance_workers)
        .flow(CASHIN_CLAIM_FLOW, BRIDGE_QUEUE, cashin_claim_flow)
        .flow(TREASURY_CASHIN_FLOW, BRIDGE_QUEUE, treasury_cashin_flow)
        .flow(GOVERNANCE_FLOW, GOVERNANCE_QUEUE, governance_flow)
}
