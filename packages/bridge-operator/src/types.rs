//! Closed status and direction types shared by the ledger, claim engine and flows
//!
//! Every status column in the ledger maps to one of these enums; transition
//! rules live next to the type so each mutation site checks the same table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// The two bridged ledgers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Chain A, EVM
    Eth,
    /// Chain B, wallet API
    Wel,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Eth => "eth",
            Chain::Wel => "wel",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a movement wraps an original asset or redeems a wrapped one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Cashin,
    Cashout,
}

/// Direction tag of a cash transaction. One ledger shape serves all four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// WEL-native asset deposited on WEL, wrapped on ETH
    WelCashinEth,
    /// Wrapped asset burned on ETH, released on WEL
    EthCashoutWel,
    /// ETH-native asset deposited to the treasury, wrapped on WEL
    EthCashinWel,
    /// Wrapped asset burned on WEL, released on ETH
    WelCashoutEth,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::WelCashinEth,
        Direction::EthCashoutWel,
        Direction::EthCashinWel,
        Direction::WelCashoutEth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::WelCashinEth => "wel_cashin_eth",
            Direction::EthCashoutWel => "eth_cashout_wel",
            Direction::EthCashinWel => "eth_cashin_wel",
            Direction::WelCashoutEth => "wel_cashout_eth",
        }
    }

    /// Chain the deposit is observed on.
    pub fn source_chain(&self) -> Chain {
        match self {
            Direction::WelCashinEth | Direction::WelCashoutEth => Chain::Wel,
            Direction::EthCashoutWel | Direction::EthCashinWel => Chain::Eth,
        }
    }

    /// Chain the claim executes on.
    pub fn dest_chain(&self) -> Chain {
        match self.source_chain() {
            Chain::Wel => Chain::Eth,
            Chain::Eth => Chain::Wel,
        }
    }

    pub fn kind(&self) -> TransferKind {
        match self {
            Direction::WelCashinEth | Direction::EthCashinWel => TransferKind::Cashin,
            Direction::EthCashoutWel | Direction::WelCashoutEth => TransferKind::Cashout,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Direction::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| BridgeError::validation(format!("unknown direction {s}")))
    }
}

/// Source-chain finality of a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Unconfirmed,
    Pending,
    Confirmed,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Unconfirmed => "unconfirmed",
            DepositStatus::Pending => "pending",
            DepositStatus::Confirmed => "confirmed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DepositStatus::Unconfirmed => 0,
            DepositStatus::Pending => 1,
            DepositStatus::Confirmed => 2,
        }
    }

    /// Forward-only; staying put is allowed.
    pub fn can_advance_to(&self, next: DepositStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Destination-chain claim progress of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Unconfirmed,
    Pending,
    Confirmed,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Unconfirmed => "unconfirmed",
            ClaimStatus::Pending => "pending",
            ClaimStatus::Confirmed => "confirmed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ClaimStatus::Unconfirmed => 0,
            ClaimStatus::Pending => 1,
            ClaimStatus::Confirmed => 2,
        }
    }

    /// Forward-only; staying put is allowed.
    pub fn can_advance_to(&self, next: ClaimStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a single claim request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ClaimRequestStatus {
    Pending,
    Success,
    Expired,
    DoubleClaimed,
}

impl ClaimRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimRequestStatus::Pending => "pending",
            ClaimRequestStatus::Success => "success",
            ClaimRequestStatus::Expired => "expired",
            ClaimRequestStatus::DoubleClaimed => "doubleclaimed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ClaimRequestStatus::Pending)
    }

    /// Pending closes exactly once; a success may later be flagged double-claimed.
    pub fn can_transition_to(&self, next: ClaimRequestStatus) -> bool {
        use ClaimRequestStatus::*;
        matches!(
            (self, next),
            (Pending, Success)
                | (Pending, Expired)
                | (Pending, DoubleClaimed)
                | (Success, DoubleClaimed)
        )
    }
}

impl fmt::Display for ClaimRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a raw treasury deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum TreasuryStatus {
    #[sqlx(rename = "unconfirmed")]
    #[serde(rename = "unconfirmed")]
    Unconfirmed,
    #[sqlx(rename = "isCashin")]
    #[serde(rename = "isCashin")]
    IsCashin,
    #[sqlx(rename = "expired")]
    #[serde(rename = "expired")]
    Expired,
}

impl TreasuryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreasuryStatus::Unconfirmed => "unconfirmed",
            TreasuryStatus::IsCashin => "isCashin",
            TreasuryStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TreasuryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Administrative lock state of a governance account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Ok,
    Locked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Ok => "ok",
            AccountStatus::Locked => "locked",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_chains() {
        assert_eq!(Direction::WelCashinEth.source_chain(), Chain::Wel);
        assert_eq!(Direction::WelCashinEth.dest_chain(), Chain::Eth);
        assert_eq!(Direction::EthCashinWel.source_chain(), Chain::Eth);
        assert_eq!(Direction::EthCashinWel.dest_chain(), Chain::Wel);
        assert_eq!(Direction::EthCashoutWel.kind(), TransferKind::Cashout);
        assert_eq!(Direction::EthCashinWel.kind(), TransferKind::Cashin);
    }

    #[test]
    fn test_direction_parse() {
        for d in Direction::ALL {
            assert_eq!(d.as_str().parse::<Direction>().unwrap(), d);
        }
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_claim_status_forward_only() {
        assert!(ClaimStatus::Unconfirmed.can_advance_to(ClaimStatus::Pending));
        assert!(ClaimStatus::Pending.can_advance_to(ClaimStatus::Confirmed));
        assert!(ClaimStatus::Confirmed.can_advance_to(ClaimStatus::Confirmed));
        assert!(!ClaimStatus::Confirmed.can_advance_to(ClaimStatus::Pending));
        assert!(!ClaimStatus::Pending.can_advance_to(ClaimStatus::Unconfirmed));
        assert!(!DepositStatus::Confirmed.can_advance_to(DepositStatus::Unconfirmed));
    }

    #[test]
    fn test_request_transitions() {
        use ClaimRequestStatus::*;
        assert!(Pending.can_transition_to(Success));
        assert!(Pending.can_transition_to(Expired));
        assert!(Success.can_transition_to(DoubleClaimed));
        assert!(!Success.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Success));
        assert!(!Expired.can_transition_to(Pending));
        assert!(Expired.is_terminal());
        assert!(!Pending.is_terminal());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TreasuryStatus::IsCashin.as_str(), "isCashin");
        assert_eq!(ClaimRequestStatus::DoubleClaimed.as_str(), "doubleclaimed");
        assert_eq!(
            serde_json::to_value(TreasuryStatus::IsCashin).unwrap(),
            serde_json::json!("isCashin")
        );
        assert_eq!(
            serde_json::to_value(ClaimRequestStatus::DoubleClaimed).unwrap(),
            serde_json::json!("doubleclaimed")
        );
    }
}
