//! Claim protocol engine
//!
//! Decides whether a claim request may be issued for a deposit and closes
//! requests once their outcome is known. Checks run in a fixed order:
//! not found, already claimed, receiver address, then the pending/expired
//! decision, which the ledger makes under its row lock so that concurrent
//! requests for one transaction admit exactly one.
//!
//! Expiry is lazy. [`ClaimSweeper`] only tidies up for reporting.

use alloy::primitives::U256;
use bridge_chains::{abi::keccak256, same_address};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::{CashTransaction, ClaimOutcome, ClaimRequest, ClaimResolution, LedgerStore, NewClaimRequest};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics;
use crate::types::{ClaimRequestStatus, ClaimStatus, DepositStatus, Direction};

/// Default lifetime of a claim request, in seconds.
pub const DEFAULT_REQUEST_TTL_SECS: i64 = 180;

/// Fresh unguessable request id: keccak-256 of 32 random bytes as a decimal integer.
pub fn generate_request_id() -> String {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    U256::from_be_bytes(keccak256(&seed)).to_string()
}

/// Parse a request id back into the `uint256` the claim contract takes.
pub fn request_id_to_u256(request_id: &str) -> BridgeResult<U256> {
    U256::from_str_radix(request_id, 10)
        .map_err(|_| BridgeError::validation(format!("malformed request id {request_id}")))
}

/// Everything a flow needs to execute an issued claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTicket {
    pub request_id: String,
    pub transaction_id: i64,
    pub direction: Direction,
    pub deposit_tx_hash: String,
    pub claimant: String,
    /// Token released or minted on the destination chain
    pub token: String,
    pub amount: String,
    pub fee: String,
    pub expires_at: DateTime<Utc>,
}

impl ClaimTicket {
    fn new(
        request_id: String,
        direction: Direction,
        deposit_tx_hash: &str,
        tx: CashTransaction,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            transaction_id: tx.id,
            direction,
            deposit_tx_hash: deposit_tx_hash.to_string(),
            claimant: tx.dest_wallet_addr,
            token: tx.dest_token_addr,
            amount: tx.amount,
            fee: tx.fee,
            expires_at,
        }
    }
}

pub struct ClaimEngine {
    ledger: Arc<dyn LedgerStore>,
    request_ttl: Duration,
}

impl ClaimEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>, request_ttl: Duration) -> Self {
        Self {
            ledger,
            request_ttl,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn request_ttl(&self) -> Duration {
        self.request_ttl
    }

    /// Issue a claim request for a deposit on behalf of `claimant`.
    pub async fn request_claim(
        &self,
        direction: Direction,
        deposit_tx_hash: &str,
        claimant: &str,
    ) -> BridgeResult<ClaimTicket> {
        self.issue_claim(direction, deposit_tx_hash, claimant, generate_request_id())
            .await
    }

    /// Issue a claim request under a caller-chosen id. Issuing an id that is
    /// already recorded for this deposit returns the same ticket again.
    pub async fn issue_claim(
        &self,
        direction: Direction,
        deposit_tx_hash: &str,
        claimant: &str,
        request_id: String,
    ) -> BridgeResult<ClaimTicket> {
        let result = self
            .try_issue_claim(direction, deposit_tx_hash, claimant, request_id)
            .await;
        let outcome = match &result {
            Ok(_) => "issued",
            Err(e) => e.kind(),
        };
        metrics::record_claim_request(direction.as_str(), outcome);
        result
    }

    async fn try_issue_claim(
        &self,
        direction: Direction,
        deposit_tx_hash: &str,
        claimant: &str,
        request_id: String,
    ) -> BridgeResult<ClaimTicket> {
        let tx = self
            .ledger
            .select_by_deposit_hash(direction, deposit_tx_hash)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("deposit {deposit_tx_hash}")))?;

        if let Some(existing) = self.ledger.get_claim_request(&request_id).await? {
            if existing.tx_id != tx.id || !same_address(claimant, &tx.dest_wallet_addr) {
                return Err(BridgeError::validation(format!(
                    "claim request {request_id} belongs to another claim"
                )));
            }
            debug!(request_id = %request_id, "Claim request already issued");
            return Ok(ClaimTicket::new(
                request_id,
                direction,
                deposit_tx_hash,
                tx,
                existing.expires_at,
            ));
        }

        if tx.claim_status == ClaimStatus::Confirmed {
            warn!(%direction, hash = %deposit_tx_hash, "Claim requested for already claimed deposit");
            return Err(BridgeError::AlreadyClaimed);
        }

        if !same_address(claimant, &tx.dest_wallet_addr) {
            warn!(
                %direction,
                hash = %deposit_tx_hash,
                claimant = %claimant,
                "Claimant does not match recorded receiver"
            );
            return Err(BridgeError::AddressMismatch);
        }

        if tx.deposit_status != DepositStatus::Confirmed {
            return Err(BridgeError::validation(format!(
                "deposit {deposit_tx_hash} is not confirmed yet"
            )));
        }

        let expires_at = Utc::now() + self.request_ttl;
        let request = self
            .ledger
            .create_claim_request(&NewClaimRequest {
                request_id: request_id.clone(),
                tx_id: tx.id,
                expires_at,
            })
            .await?;

        info!(
            %direction,
            hash = %deposit_tx_hash,
            tx_id = tx.id,
            request_id = %request.request_id,
            expires_at = %request.expires_at,
            "Claim request issued"
        );

        Ok(ClaimTicket::new(
            request_id,
            direction,
            deposit_tx_hash,
            tx,
            request.expires_at,
        ))
    }

    /// A claim trigger is accepted only for a pending, unexpired request.
    pub async fn validate_trigger(&self, request_id: &str) -> BridgeResult<ClaimRequest> {
        let request = self
            .ledger
            .get_claim_request(request_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("claim request {request_id}")))?;

        match request.status {
            ClaimRequestStatus::Success | ClaimRequestStatus::DoubleClaimed => {
                Err(BridgeError::AlreadyClaimed)
            }
            ClaimRequestStatus::Expired => Err(BridgeError::validation(format!(
                "claim request {request_id} expired"
            ))),
            ClaimRequestStatus::Pending if !request.is_live(Utc::now()) => Err(
                BridgeError::validation(format!("claim request {request_id} expired")),
            ),
            ClaimRequestStatus::Pending => Ok(request),
        }
    }

    /// Close a pending request as expired. Returns false if it was already closed.
    pub async fn expire_request(&self, request_id: &str) -> BridgeResult<bool> {
        let expired = self
            .ledger
            .update_claim_request_status(
                request_id,
                ClaimRequestStatus::Pending,
                ClaimRequestStatus::Expired,
            )
            .await?;
        if expired {
            debug!(request_id, "Claim request expired");
        }
        Ok(expired)
    }

    pub async fn record_outcome(&self, outcome: &ClaimOutcome) -> BridgeResult<ClaimResolution> {
        let resolution = self.ledger.update_claim_outcome(outcome).await?;
        match resolution {
            ClaimResolution::Recorded => info!(
                tx_id = outcome.tx_id,
                request_id = %outcome.request_id,
                status = %outcome.request_status,
                claim_tx_hash = ?outcome.claim_tx_hash,
                "Claim outcome recorded"
            ),
            ClaimResolution::Unchanged => debug!(
                tx_id = outcome.tx_id,
                request_id = %outcome.request_id,
                "Claim outcome already recorded"
            ),
            ClaimResolution::DoubleClaimed => warn!(
                tx_id = outcome.tx_id,
                request_id = %outcome.request_id,
                "Double claim detected"
            ),
        }
        Ok(resolution)
    }

    /// Expire every elapsed pending request that has no signed claim.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> BridgeResult<u64> {
        let expired = self.ledger.expire_stale_requests(now).await?;
        metrics::set_stale_expired(expired);
        if let Ok(pending) = self
            .ledger
            .count_claim_requests(ClaimRequestStatus::Pending)
            .await
        {
            metrics::set_pending_requests(pending);
        }
        Ok(expired)
    }
}

/// Periodic stale-request sweep.
pub struct ClaimSweeper {
    engine: Arc<ClaimEngine>,
    interval: std::time::Duration,
}

impl ClaimSweeper {
    pub fn new(engine: Arc<ClaimEngine>, interval: std::time::Duration) -> Self {
        Self { engine, interval }
    }

    /// Sweep on every tick until shutdown.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Claim request sweeper starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Claim request sweeper shutdown");
                    break;
                }
                _ = interval.tick() => {
                    match self.engine.sweep_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(expired) => info!(expired, "Expired stale claim requests"),
                        Err(e) => warn!(error = %e, "Claim request sweep failed"),
                    }
                }
            }
        }
    }
}
