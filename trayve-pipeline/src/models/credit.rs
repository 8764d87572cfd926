//! Credit ledger records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Feature tag for generation debits
pub const FEATURE_GENERATION: &str = "generation";
/// Feature tag for compensating refunds
pub const FEATURE_REFUND: &str = "refund";
/// Feature tag for the onboarding grant
pub const FEATURE_WELCOME: &str = "welcome";

/// Point-in-time balance of one credit account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    /// Lifetime granted credits
    pub total: i64,
    /// Lifetime consumed credits
    pub used: i64,
    /// `total - used`, never negative
    pub available: i64,
}

impl CreditBalance {
    pub fn new(total: i64, used: i64) -> Self {
        Self {
            total,
            used,
            available: (total - used).max(0),
        }
    }
}

/// Direction of a ledger mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Credit,
    Debit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Credit => "credit",
            TransactionKind::Debit => "debit",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(TransactionKind::Credit),
            "debit" => Ok(TransactionKind::Debit),
            other => Err(format!("Unknown transaction kind: {}", other)),
        }
    }
}

/// Immutable ledger log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub description: String,
    pub feature_type: String,
    /// Originating execution for debits and refunds
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}
