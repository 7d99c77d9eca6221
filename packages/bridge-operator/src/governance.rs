//! Governance sub-flow
//!
//! Holds the current administrative signer and the off-chain registry of
//! governance accounts. Role grants and revocations run as `GovernanceFlow`
//! on the governance task queue.

use bridge_chains::{ChainAddress, TxSigner};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::db::{account_key, AccountStore, AdminAccount};
use crate::error::{BridgeError, BridgeResult};
use crate::orchestrator::flows::{GovernanceOutput, GOVERNANCE_FLOW};
use crate::orchestrator::Orchestration;
use crate::types::{AccountStatus, Chain};

/// Registry role required to become the administrative signer.
pub const AUTHENTICATOR_ROLE: &str = "authenticator";

/// Lock-guarded administrative signing key. Reads and updates both take the lock.
pub struct SignerCell {
    current: Mutex<Option<TxSigner>>,
}

impl SignerCell {
    pub fn new(initial: Option<TxSigner>) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// The installed signer, or a signing error when none is configured.
    pub async fn current(&self) -> BridgeResult<TxSigner> {
        self.current
            .lock()
            .await
            .clone()
            .ok_or_else(|| BridgeError::Signing("no administrative signer configured".to_string()))
    }

    pub async fn address(&self) -> Option<ChainAddress> {
        self.current.lock().await.as_ref().map(TxSigner::address)
    }

    /// Install a new administrative key. The derived account must be
    /// registered, `ok`, and hold the authenticator role.
    pub async fn set_current_authenticator(
        &self,
        accounts: &dyn AccountStore,
        private_key: &str,
    ) -> BridgeResult<ChainAddress> {
        let signer = TxSigner::from_hex(private_key)?;
        let address = signer.address();

        let mut current = self.current.lock().await;
        let account = require_usable_account(accounts, &address.to_hex()).await?;
        if !account.has_role(AUTHENTICATOR_ROLE) {
            return Err(BridgeError::validation(format!(
                "account {} lacks the {AUTHENTICATOR_ROLE} role",
                account.address
            )));
        }
        *current = Some(signer);

        info!(address = %address.to_hex(), "Administrative signer updated");
        Ok(address)
    }
}

/// Look up a registered account and require status `ok`.
pub(crate) async fn require_usable_account(
    accounts: &dyn AccountStore,
    address: &str,
) -> BridgeResult<AdminAccount> {
    let account = accounts
        .get_account(address)
        .await?
        .ok_or_else(|| BridgeError::NotFound(format!("admin account {address}")))?;
    match account.status {
        AccountStatus::Ok => Ok(account),
        AccountStatus::Locked => Err(BridgeError::AccountLocked(account.address)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleAction {
    Grant,
    Revoke,
}

impl fmt::Display for RoleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleAction::Grant => write!(f, "grant"),
            RoleAction::Revoke => write!(f, "revoke"),
        }
    }
}

/// Input of `GovernanceFlow`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceRequest {
    pub chain: Chain,
    pub action: RoleAction,
    pub role: String,
    pub account: String,
}

impl GovernanceRequest {
    /// Identical requests share a flow id, so concurrent duplicates collapse.
    pub fn flow_id(&self) -> String {
        format!(
            "governance:{}:{}:{}:{}",
            self.chain,
            self.action,
            self.role,
            account_key(&self.account)
        )
    }
}

pub struct Governance {
    accounts: Arc<dyn AccountStore>,
    orchestration: Arc<dyn Orchestration>,
    signer: Arc<SignerCell>,
}

impl Governance {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        orchestration: Arc<dyn Orchestration>,
        signer: Arc<SignerCell>,
    ) -> Self {
        Self {
            accounts,
            orchestration,
            signer,
        }
    }

    pub fn signer(&self) -> &Arc<SignerCell> {
        &self.signer
    }

    pub async fn set_current_authenticator(&self, private_key: &str) -> BridgeResult<ChainAddress> {
        self.signer
            .set_current_authenticator(self.accounts.as_ref(), private_key)
            .await
    }

    pub async fn add_account(&self, address: &str) -> BridgeResult<()> {
        self.accounts.add_account(address, AccountStatus::Ok).await?;
        info!(address, "Admin account added");
        Ok(())
    }

    pub async fn remove_account(&self, address: &str) -> BridgeResult<()> {
        self.accounts.remove_account(address).await?;
        info!(address, "Admin account removed");
        Ok(())
    }

    pub async fn lock_account(&self, address: &str) -> BridgeResult<()> {
        self.accounts
            .set_account_status(address, AccountStatus::Locked)
            .await?;
        info!(address, "Admin account locked");
        Ok(())
    }

    pub async fn unlock_account(&self, address: &str) -> BridgeResult<()> {
        self.accounts
            .set_account_status(address, AccountStatus::Ok)
            .await
    }

    pub async fn assign_role(&self, address: &str, role: &str) -> BridgeResult<()> {
        self.accounts.assign_role(address, role).await
    }

    pub async fn accounts_with_role(
        &self,
        role: &str,
        offset: i64,
        limit: i64,
    ) -> BridgeResult<Vec<AdminAccount>> {
        self.accounts.accounts_with_role(role, offset, limit).await
    }

    pub async fn list_accounts(&self, offset: i64, limit: i64) -> BridgeResult<Vec<AdminAccount>> {
        self.accounts.list_accounts(offset, limit).await
    }

    /// Role names currently assigned to at least one account.
    pub async fn list_roles(&self) -> BridgeResult<Vec<String>> {
        self.accounts.list_roles().await
    }

    /// Grant a contract role on `chain`; returns the transaction hash.
    pub async fn grant_role(&self, chain: Chain, role: &str, account: &str) -> BridgeResult<String> {
        self.run(GovernanceRequest {
            chain,
            action: RoleAction::Grant,
            role: role.to_string(),
            account: account.to_string(),
        })
        .await
    }

    /// Revoke a contract role on `chain`; returns the transaction hash.
    pub async fn revoke_role(&self, chain: Chain, role: &str, account: &str) -> BridgeResult<String> {
        self.run(GovernanceRequest {
            chain,
            action: RoleAction::Revoke,
            role: role.to_string(),
            account: account.to_string(),
        })
        .await
    }

    async fn run(&self, request: GovernanceRequest) -> BridgeResult<String> {
        let handle = self
            .orchestration
            .start_flow(GOVERNANCE_FLOW, &request.flow_id(), json!(request))
            .await?;
        let output: GovernanceOutput =
            serde_json::from_value(self.orchestration.flow_result(&handle).await?)?;
        Ok(output.tx_hash)
    }
}
