//! Named activities
//!
//! Every ledger, claim and chain operation a flow can issue. Each one is safe
//! to run again with the same input: ledger writes are idempotent on their
//! unique keys, and a claim is signed at most once per request: later
//! attempts re-broadcast the stored transaction.

use bridge_chains::{
    same_address, sign_claim_authorization, ChainAddress, ChainError, ContractCall, ContractCaller,
    SignedTransaction, TransactionInfo, U256,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::engine::EngineBuilder;
use super::retry::{ActivityClass, RetryPolicy};
use crate::claim::{request_id_to_u256, ClaimEngine, ClaimTicket};
use crate::db::{
    AccountStore, CashTransaction, ClaimOutcome, ClaimResolution, Insertion, LedgerStore,
    NewCashTransaction, TransactionFilter, TreasuryDeposit, TreasuryQuery,
};
use crate::error::{BridgeError, BridgeResult};
use crate::governance::{require_usable_account, GovernanceRequest, RoleAction, SignerCell};
use crate::metrics;
use crate::tokens::TokenMap;
use crate::types::{Chain, Direction};

pub const GET_CASH_TRANSACTION_BY_DEPOSIT_HASH: &str = "GetCashTransactionByDepositHash";
pub const LIST_CASH_TRANSACTIONS: &str = "ListCashTransactions";
pub const REQUEST_CLAIM: &str = "RequestClaim";
pub const EXPIRE_CLAIM_REQUEST: &str = "ExpireClaimRequest";
pub const SUBMIT_CLAIM: &str = "SubmitClaim";
pub const AWAIT_CLAIM_CONFIRMATION: &str = "AwaitClaimConfirmation";
pub const UPDATE_CLAIM_OUTCOME: &str = "UpdateClaimOutcome";
pub const GET_UNCONFIRMED_TREASURY_DEPOSIT: &str = "GetUnconfirmedTreasuryDeposit";
pub const GET_TREASURY_DEPOSIT_BY_TX_HASH: &str = "GetTreasuryDepositByTxHash";
pub const GET_TREASURY_DEPOSITS_BY_SENDER: &str = "GetTreasuryDepositsBySender";
pub const CREATE_CASH_TRANSACTION: &str = "CreateCashTransaction";
pub const CONFIRM_DEPOSIT: &str = "ConfirmDeposit";
pub const MAP_ETH_TOKEN_TO_WEL: &str = "MapEthTokenToWel";
pub const MAP_WEL_TOKEN_TO_ETH: &str = "MapWelTokenToEth";
pub const CHECK_ADMIN_ACCOUNT: &str = "CheckAdminAccount";
pub const INVOKE_GOVERNANCE: &str = "InvokeGovernance";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRef {
    pub direction: Direction,
    pub deposit_tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimInput {
    pub direction: Direction,
    pub deposit_tx_hash: String,
    pub claimant: String,
    /// Chosen before the flow starts so a replayed `RequestClaim` finds its own request
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSubmission {
    pub claim_tx_hash: String,
    /// An earlier attempt's transaction was reused instead of signing a new one
    pub reconciled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationInput {
    pub chain: Chain,
    pub tx_hash: String,
}

/// Treasury deposit match; the treasury address comes from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryLookup {
    pub from_address: String,
    pub token_address: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceCall {
    pub request: GovernanceRequest,
    /// Account checked by `CheckAdminAccount`; must still be the installed signer
    pub signer: String,
}

/// Contract callers for both chains.
#[derive(Clone)]
pub struct ChainCallers {
    pub eth_bridge: ContractCaller,
    pub eth_governance: ContractCaller,
    pub wel_bridge: ContractCaller,
    pub wel_governance: ContractCaller,
    /// base58check version byte of the wallet-API chain
    pub wel_address_prefix: u8,
}

impl ChainCallers {
    pub fn bridge(&self, chain: Chain) -> &ContractCaller {
        match chain {
            Chain::Eth => &self.eth_bridge,
            Chain::Wel => &self.wel_bridge,
        }
    }

    pub fn governance(&self, chain: Chain) -> &ContractCaller {
        match chain {
            Chain::Eth => &self.eth_governance,
            Chain::Wel => &self.wel_governance,
        }
    }

    pub fn parse_address(&self, chain: Chain, address: &str) -> BridgeResult<ChainAddress> {
        let parsed = match chain {
            Chain::Eth => ChainAddress::parse_hex(address)?,
            Chain::Wel => ChainAddress::parse(address, self.wel_address_prefix)?,
        };
        Ok(parsed)
    }
}

/// Count a broadcast by chain, labelled `accepted` or with the error kind.
fn record_broadcast_outcome<T>(chain: Chain, result: Result<T, ChainError>) -> BridgeResult<T> {
    let result = result.map_err(BridgeError::from);
    let outcome = match &result {
        Ok(_) => "accepted",
        Err(e) => e.kind(),
    };
    metrics::record_broadcast(chain.as_str(), outcome);
    result
}

fn parse_amount(amount: &str) -> BridgeResult<U256> {
    U256::from_str_radix(amount, 10)
        .map_err(|_| BridgeError::validation(format!("malformed amount {amount}")))
}

/// Shared dependencies of all activities.
pub struct BridgeActivities {
    claims: Arc<ClaimEngine>,
    accounts: Arc<dyn AccountStore>,
    tokens: Arc<TokenMap>,
    chains: ChainCallers,
    signer: Arc<SignerCell>,
    eth_treasury: String,
}

impl BridgeActivities {
    pub fn new(
        claims: Arc<ClaimEngine>,
        accounts: Arc<dyn AccountStore>,
        tokens: Arc<TokenMap>,
        chains: ChainCallers,
        signer: Arc<SignerCell>,
        eth_treasury: String,
    ) -> Self {
        Self {
            claims,
            accounts,
            tokens,
            chains,
            signer,
            eth_treasury,
        }
    }

    fn ledger(&self) -> &Arc<dyn LedgerStore> {
        self.claims.ledger()
    }

    /// Register every named activity with its class's retry policy.
    pub fn register(self: Arc<Self>, builder: EngineBuilder) -> EngineBuilder {
        self.register_with_policy(builder, RetryPolicy::for_class)
    }

    /// Register every named activity, choosing each class's policy.
    pub fn register_with_policy(
        self: Arc<Self>,
        builder: EngineBuilder,
        policy_for: impl Fn(ActivityClass) -> RetryPolicy,
    ) -> EngineBuilder {
        macro_rules! activity {
            ($builder:expr, $this:expr, $name:expr, $class:expr, $method:ident) => {{
                let this = $this.clone();
                $builder.activity($name, policy_for($class), move |input| {
                    let this = this.clone();
                    async move { this.$method(input).await }
                })
            }};
        }

        let builder = activity!(
            builder,
            self,
            GET_CASH_TRANSACTION_BY_DEPOSIT_HASH,
            ActivityClass::Storage,
            get_cash_transaction
        );
        let builder = activity!(
            builder,
            self,
            LIST_CASH_TRANSACTIONS,
            ActivityClass::Storage,
            list_cash_transactions
        );
        let builder = activity!(
            builder,
            self,
            REQUEST_CLAIM,
            ActivityClass::Storage,
            request_claim
        );
        let builder = activity!(
            builder,
            self,
            EXPIRE_CLAIM_REQUEST,
            ActivityClass::Storage,
            expire_claim_request
        );
        let builder = activity!(
            builder,
            self,
            SUBMIT_CLAIM,
            ActivityClass::Rpc,
            submit_claim
        );
        let builder = activity!(
            builder,
            self,
            AWAIT_CLAIM_CONFIRMATION,
            ActivityClass::Confirmation,
            await_claim_confirmation
        );
        let builder = activity!(
            builder,
            self,
            UPDATE_CLAIM_OUTCOME,
            ActivityClass::Storage,
            update_claim_outcome
        );
        let builder = activity!(
            builder,
            self,
            GET_UNCONFIRMED_TREASURY_DEPOSIT,
            ActivityClass::Storage,
            get_unconfirmed_treasury_deposit
        );
        let builder = activity!(
            builder,
            self,
            GET_TREASURY_DEPOSIT_BY_TX_HASH,
            ActivityClass::Storage,
            get_treasury_deposit_by_tx
        );
        let builder = activity!(
            builder,
            self,
            GET_TREASURY_DEPOSITS_BY_SENDER,
            ActivityClass::Storage,
            get_treasury_deposits_by_sender
        );
        let builder = activity!(
            builder,
            self,
            CREATE_CASH_TRANSACTION,
            ActivityClass::Storage,
            create_cash_transaction
        );
        let builder = activity!(
            builder,
            self,
            CONFIRM_DEPOSIT,
            ActivityClass::Storage,
            confirm_deposit
        );
        let builder = activity!(
            builder,
            self,
            MAP_ETH_TOKEN_TO_WEL,
            ActivityClass::Validation,
            map_eth_token_to_wel
        );
        let builder = activity!(
            builder,
            self,
            MAP_WEL_TOKEN_TO_ETH,
            ActivityClass::Validation,
            map_wel_token_to_eth
        );
        let builder = activity!(
            builder,
            self,
            CHECK_ADMIN_ACCOUNT,
            ActivityClass::Storage,
            check_admin_account
        );
        activity!(
            builder,
            self,
            INVOKE_GOVERNANCE,
            ActivityClass::Rpc,
            invoke_governance
        )
    }

    pub async fn get_cash_transaction(&self, input: DepositRef) -> BridgeResult<Option<CashTransaction>> {
        self.ledger()
            .select_by_deposit_hash(input.direction, &input.deposit_tx_hash)
            .await
    }

    pub async fn list_cash_transactions(
        &self,
        filter: TransactionFilter,
    ) -> BridgeResult<Vec<CashTransaction>> {
        self.ledger().select_transactions(&filter).await
    }

    pub async fn request_claim(&self, input: ClaimInput) -> BridgeResult<ClaimTicket> {
        self.claims
            .issue_claim(
                input.direction,
                &input.deposit_tx_hash,
                &input.claimant,
                input.request_id,
            )
            .await
    }

    pub async fn expire_claim_request(&self, request_id: String) -> BridgeResult<bool> {
        self.claims.expire_request(&request_id).await
    }

    /// Sign and broadcast the claim for a triggered request.
    ///
    /// The signed transaction is stored before broadcast. Once one is stored for
    /// the request it is never signed again: a replay re-broadcasts the same
    /// bytes, which the node reports as a duplicate if it already holds them.
    pub async fn submit_claim(&self, ticket: ClaimTicket) -> BridgeResult<ClaimSubmission> {
        let chain = ticket.direction.dest_chain();
        let caller = self.chains.bridge(chain);

        let tx = self
            .ledger()
            .select_by_id(ticket.transaction_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("cash transaction {}", ticket.transaction_id)))?;
        if tx.request_id.as_deref() == Some(ticket.request_id.as_str()) {
            if let Some(recorded) = &tx.claim_tx_hash {
                return self.resume_claim_submission(caller, &ticket, recorded).await;
            }
        }

        let signer = self.signer.current().await?;
        let token = self.chains.parse_address(chain, &ticket.token)?;
        let account = self.chains.parse_address(chain, &ticket.claimant)?;
        let request_id = request_id_to_u256(&ticket.request_id)?;
        let amount = parse_amount(&ticket.amount)?;

        let authorization = sign_claim_authorization(&signer, &token, &account, request_id, amount)?;
        let call = ContractCall::claim(token, account, request_id, amount, authorization);
        let signed = caller.prepare(&signer, &call).await?;

        let body = serde_json::to_value(&signed)
            .map_err(|e| BridgeError::storage(format!("encode signed claim: {e}")))?;
        self.ledger()
            .record_claim_submission(ticket.transaction_id, &ticket.request_id, &signed.tx_id, &body)
            .await?;
        debug!(request_id = %ticket.request_id, claim_tx_hash = %signed.tx_id, "Claim transaction recorded");

        let receipt = record_broadcast_outcome(chain, caller.broadcast(signed).await)?;
        info!(
            %chain,
            request_id = %ticket.request_id,
            claim_tx_hash = %receipt.tx_id,
            already_known = receipt.already_known,
            "Claim broadcast"
        );
        Ok(ClaimSubmission {
            claim_tx_hash: receipt.tx_id,
            reconciled: false,
        })
    }

    /// Continue a submission an earlier attempt already recorded.
    async fn resume_claim_submission(
        &self,
        caller: &ContractCaller,
        ticket: &ClaimTicket,
        recorded: &str,
    ) -> BridgeResult<ClaimSubmission> {
        let chain = ticket.direction.dest_chain();
        let reconciled = || ClaimSubmission {
            claim_tx_hash: recorded.to_string(),
            reconciled: true,
        };

        if caller.rpc().transaction_info(recorded).await?.is_some() {
            info!(
                request_id = %ticket.request_id,
                claim_tx_hash = %recorded,
                "Claim already on chain, skipping broadcast"
            );
            return Ok(reconciled());
        }

        let Some(body) = self.ledger().claim_submission(&ticket.request_id).await? else {
            // Hash without a body: the transaction may still land, so only wait for it
            warn!(
                request_id = %ticket.request_id,
                claim_tx_hash = %recorded,
                "No signed body stored for recorded claim, awaiting confirmation"
            );
            return Ok(reconciled());
        };
        let signed: SignedTransaction = serde_json::from_value(body)
            .map_err(|e| BridgeError::storage(format!("decode signed claim: {e}")))?;

        match record_broadcast_outcome(chain, caller.broadcast(signed).await) {
            Ok(receipt) => {
                info!(
                    %chain,
                    request_id = %ticket.request_id,
                    claim_tx_hash = %recorded,
                    already_known = receipt.already_known,
                    "Recorded claim re-broadcast"
                );
                Ok(reconciled())
            }
            Err(e @ BridgeError::BroadcastRejected { .. }) => {
                // A mined transaction is rejected on re-broadcast (nonce already used)
                if caller.rpc().transaction_info(recorded).await?.is_some() {
                    return Ok(reconciled());
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until the claim transaction is included. Retried while pending.
    pub async fn await_claim_confirmation(
        &self,
        input: ConfirmationInput,
    ) -> BridgeResult<TransactionInfo> {
        let info = self
            .chains
            .bridge(input.chain)
            .rpc()
            .transaction_info(&input.tx_hash)
            .await?
            .ok_or_else(|| BridgeError::NotYetConfirmed(input.tx_hash.clone()))?;

        if !info.success {
            warn!(
                chain = %input.chain,
                tx_hash = %input.tx_hash,
                message = ?info.message,
                "Claim transaction failed on chain"
            );
            return Err(BridgeError::ClaimFailedOnChain(input.tx_hash));
        }
        Ok(info)
    }

    pub async fn update_claim_outcome(&self, outcome: ClaimOutcome) -> BridgeResult<ClaimResolution> {
        self.claims.record_outcome(&outcome).await
    }

    /// The oldest unconsumed deposit into the configured treasury matching the lookup.
    pub async fn get_unconfirmed_treasury_deposit(
        &self,
        lookup: TreasuryLookup,
    ) -> BridgeResult<TreasuryDeposit> {
        let query = TreasuryQuery {
            from_address: lookup.from_address,
            treasury_address: self.eth_treasury.clone(),
            token_address: lookup.token_address,
            amount: lookup.amount,
        };
        let deposit = self
            .ledger()
            .unconfirmed_treasury_deposit(&query)
            .await?
            .ok_or_else(|| {
                BridgeError::NotFound(format!(
                    "unconfirmed treasury deposit from {} of {} {}",
                    query.from_address, query.amount, query.token_address
                ))
            })?;

        if !same_address(&deposit.treasury_address, &self.eth_treasury) {
            return Err(BridgeError::validation(format!(
                "deposit {} was not sent to the bridge treasury",
                deposit.tx_id
            )));
        }
        Ok(deposit)
    }

    pub async fn get_treasury_deposit_by_tx(
        &self,
        tx_id: String,
    ) -> BridgeResult<Option<TreasuryDeposit>> {
        self.ledger().treasury_deposit_by_tx(&tx_id).await
    }

    pub async fn get_treasury_deposits_by_sender(
        &self,
        sender: String,
    ) -> BridgeResult<Vec<TreasuryDeposit>> {
        self.ledger().treasury_deposits_by_sender(&sender).await
    }

    pub async fn create_cash_transaction(&self, new: NewCashTransaction) -> BridgeResult<Insertion> {
        let insertion = self.ledger().create_cash_transaction(&new).await?;
        if insertion.created {
            info!(
                id = insertion.id,
                direction = %new.direction,
                hash = %new.deposit_tx_hash,
                amount = %new.amount,
                "Cash transaction recorded"
            );
        }
        Ok(insertion)
    }

    pub async fn confirm_deposit(&self, input: DepositRef) -> BridgeResult<()> {
        self.ledger()
            .confirm_deposit(input.direction, &input.deposit_tx_hash)
            .await
    }

    pub async fn map_eth_token_to_wel(&self, token: String) -> BridgeResult<String> {
        self.tokens.eth_to_wel(&token).map(str::to_string)
    }

    pub async fn map_wel_token_to_eth(&self, token: String) -> BridgeResult<String> {
        self.tokens.wel_to_eth(&token).map(str::to_string)
    }

    /// Address of the installed administrative signer, whose account must be `ok`.
    pub async fn check_admin_account(&self, _: ()) -> BridgeResult<String> {
        let address = self
            .signer
            .address()
            .await
            .ok_or_else(|| BridgeError::Signing("no administrative signer configured".to_string()))?
            .to_hex();
        let account = require_usable_account(self.accounts.as_ref(), &address).await?;
        Ok(account.address)
    }

    pub async fn invoke_governance(&self, call: GovernanceCall) -> BridgeResult<String> {
        let signer = self.signer.current().await?;
        if !same_address(&signer.address().to_hex(), &call.signer) {
            return Err(BridgeError::validation(
                "administrative signer changed after the account check",
            ));
        }

        let request = &call.request;
        let account = self.chains.parse_address(request.chain, &request.account)?;
        let contract_call = match request.action {
            RoleAction::Grant => ContractCall::grant_role(&request.role, account),
            RoleAction::Revoke => ContractCall::revoke_role(&request.role, account),
        };

        let result = self
            .chains
            .governance(request.chain)
            .invoke(&signer, &contract_call)
            .await;
        let receipt = record_broadcast_outcome(request.chain, result)?;

        info!(
            chain = %request.chain,
            action = %request.action,
            role = %request.role,
            account = %request.account,
            tx_hash = %receipt.tx_id,
            "Governance transaction broadcast"
        );
        Ok(receipt.tx_id)
    }
}
