//! Common types for settlement records
//!
//! Status, asset and kind enums with sqlx integration so they can be bound
//! and decoded directly against the `settlements` table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of fractional digits stored for source-chain amounts
pub const AMOUNT_SCALE: u32 = 9;

/// Number of fractional digits of ZEC (1 ZEC = 10^8 zatoshi)
pub const ZEC_DECIMALS: u32 = 8;

/// Lifecycle status of a settlement record
///
/// Ordering is by progression: `Pending < Submitted < {Sent, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Submitted,
    Sent,
    Failed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Pending,
        Status::Submitted,
        Status::Sent,
        Status::Failed,
    ];

    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Submitted => "submitted",
            Status::Sent => "sent",
            Status::Failed => "failed",
        }
    }

    /// Terminal records are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Sent | Status::Failed)
    }

    /// Whether `self -> next` is a legal status change
    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Submitted)
                | (Status::Pending, Status::Failed)
                | (Status::Submitted, Status::Sent)
                | (Status::Submitted, Status::Failed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source-chain assets accepted for settlement into ZEC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Sol,
    Usdc,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Sol => "SOL",
            Asset::Usdc => "USDC",
        }
    }

    /// Decimals of the asset's minimal on-chain unit (lamports, micro-USDC)
    pub fn decimals(&self) -> u32 {
        match self {
            Asset::Sol => 9,
            Asset::Usdc => 6,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SOL" => Ok(Asset::Sol),
            "USDC" => Ok(Asset::Usdc),
            other => Err(format!("unsupported asset: {}", other)),
        }
    }
}

/// Direction of a settlement
///
/// Withdrawals are submitted to the shielded chain at intake. Deposits wait
/// for the source-chain transaction to be attached before submitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SettlementKind {
    #[default]
    Deposit,
    Withdrawal,
}

impl SettlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementKind::Deposit => "deposit",
            SettlementKind::Withdrawal => "withdrawal",
        }
    }
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_as_str() {
        assert_eq!(Status::Pending.as_str(), "pending");
        assert_eq!(Status::Submitted.as_str(), "submitted");
        assert_eq!(Status::Sent.as_str(), "sent");
        assert_eq!(Status::Failed.as_str(), "failed");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", Status::Pending), "pending");
        assert_eq!(format!("{}", Status::Sent), "sent");
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [Status::Sent, Status::Failed] {
            assert!(from.is_terminal());
            for to in Status::ALL {
                assert!(!from.can_transition_to(to), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn test_only_forward_transitions_are_legal() {
        let legal: Vec<(Status, Status)> = Status::ALL
            .into_iter()
            .flat_map(|from| Status::ALL.into_iter().map(move |to| (from, to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(
            legal,
            vec![
                (Status::Pending, Status::Submitted),
                (Status::Pending, Status::Failed),
                (Status::Submitted, Status::Sent),
                (Status::Submitted, Status::Failed),
            ]
        );
    }

    #[test]
    fn test_pending_cannot_skip_to_sent() {
        assert!(!Status::Pending.can_transition_to(Status::Sent));
        assert!(Status::Pending.can_transition_to(Status::Failed));
    }

    #[test]
    fn test_asset_parsing() {
        assert_eq!("SOL".parse::<Asset>().unwrap(), Asset::Sol);
        assert_eq!("usdc".parse::<Asset>().unwrap(), Asset::Usdc);
        assert!("ZEC".parse::<Asset>().is_err());
    }

    #[test]
    fn test_asset_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Asset::Usdc).unwrap(), "\"USDC\"");
        let kind: SettlementKind = serde_json::from_str("\"withdrawal\"").unwrap();
        assert_eq!(kind, SettlementKind::Withdrawal);
    }
}
