//! Shared types for the ACCRUAL engine.
//!
//! These types form the data model used across the engine, the ledger and
//! the cycle driver. Everything the engine produces (commission events,
//! cycle results, audit records) is immutable once built.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of an account in the ledger.
pub type AccountId = Uuid;

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Snapshot of an account, limited to the fields the engine reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Decimal,
    /// Weak reference to the referring account. Resolved by lookup, never owned.
    pub referred_by: Option<AccountId>,
    pub bot_active: bool,
    /// Hex-encoded BLAKE3 digest of the withdrawal credential.
    pub credential_hash: String,
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} balance={:.2} bot={}",
            self.id,
            self.balance,
            if self.bot_active { "active" } else { "inactive" },
        )?;
        if let Some(referrer) = self.referred_by {
            write!(f, " referred_by={referrer}")?;
        }
        Ok(())
    }
}

impl Account {
    /// A fresh account with no referrer and an inactive bot.
    pub fn new(id: AccountId, balance: Decimal, credential_hash: impl Into<String>) -> Self {
        Self {
            id,
            balance,
            referred_by: None,
            bot_active: false,
            credential_hash: credential_hash.into(),
        }
    }

    pub fn with_referrer(mut self, referrer: AccountId) -> Self {
        self.referred_by = Some(referrer);
        self
    }

    pub fn with_bot_active(mut self, active: bool) -> Self {
        self.bot_active = active;
        self
    }
}

// ---------------------------------------------------------------------------
// Commission
// ---------------------------------------------------------------------------

/// The monetary event a commission is paid on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommissionKind {
    Deposit,
    Profit,
}

impl fmt::Display for CommissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommissionKind::Deposit => write!(f, "DEPOSIT"),
            CommissionKind::Profit => write!(f, "PROFIT"),
        }
    }
}

impl std::str::FromStr for CommissionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEPOSIT" => Ok(CommissionKind::Deposit),
            "PROFIT" => Ok(CommissionKind::Profit),
            _ => Err(anyhow::anyhow!("Unknown commission kind: {s}")),
        }
    }
}

/// Immutable record of a single computed referral reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionEvent {
    pub id: Uuid,
    pub source_account_id: AccountId,
    pub referrer_account_id: AccountId,
    pub base_amount: Decimal,
    pub kind: CommissionKind,
    pub rate: Decimal,
    pub commission_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for CommissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} commission {:.2} ({}% of {:.2}) {} -> {}",
            self.kind,
            self.commission_amount,
            self.rate * Decimal::ONE_HUNDRED,
            self.base_amount,
            self.source_account_id,
            self.referrer_account_id,
        )
    }
}

// ---------------------------------------------------------------------------
// Cycle result
// ---------------------------------------------------------------------------

/// Profit credited to one account for one trading cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub account_id: AccountId,
    pub balance_before: Decimal,
    pub profit_amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl CycleResult {
    pub fn balance_after(&self) -> Decimal {
        self.balance_before + self.profit_amount
    }
}

impl fmt::Display for CycleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} +{:.4} ({:.2} -> {:.2})",
            self.timestamp.to_rfc3339(),
            self.account_id,
            self.profit_amount,
            self.balance_before,
            self.balance_after(),
        )
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// Kind of balance mutation recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Activation,
    Profit,
    Commission,
}

impl TransactionKind {
    pub const ALL: &'static [TransactionKind] = &[
        TransactionKind::Deposit,
        TransactionKind::Withdrawal,
        TransactionKind::Activation,
        TransactionKind::Profit,
        TransactionKind::Commission,
    ];
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Deposit => write!(f, "DEPOSIT"),
            TransactionKind::Withdrawal => write!(f, "WITHDRAWAL"),
            TransactionKind::Activation => write!(f, "ACTIVATION"),
            TransactionKind::Profit => write!(f, "PROFIT"),
            TransactionKind::Commission => write!(f, "COMMISSION"),
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("Unknown transaction kind: {s}"))
    }
}

/// One immutable row of the per-account audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub account_id: AccountId,
    pub kind: TransactionKind,
    /// Always positive; the direction follows from `kind`.
    pub amount: Decimal,
    pub balance_after: Decimal,
    /// Withdrawal address or commission event id, when there is one.
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(
        account_id: AccountId,
        kind: TransactionKind,
        amount: Decimal,
        balance_after: Decimal,
        reference: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            kind,
            amount,
            balance_after,
            reference,
            created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A withdrawal as submitted by the account holder.
///
/// The credential stays wrapped in a `SecretString` so it never reaches
/// logs or serialized output.
#[derive(Debug)]
pub struct WithdrawalRequest {
    pub amount: Decimal,
    pub address: String,
    pub credential: SecretString,
}

impl WithdrawalRequest {
    pub fn new(amount: Decimal, address: impl Into<String>, credential: &str) -> Self {
        Self {
            amount,
            address: address.into(),
            credential: SecretString::new(credential.to_string()),
        }
    }
}

/// Earnings overview for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account: Account,
    pub total_profit: Decimal,
    pub total_commission: Decimal,
    pub cycles: u64,
}

impl fmt::Display for AccountSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | profit={:.2} over {} cycles | commission={:.2}",
            self.account, self.total_profit, self.cycles, self.total_commission,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Malformed or out-of-range input. Nothing is mutated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("Withdrawal of {amount} is below the minimum of {minimum}")]
    BelowMinimumWithdrawal { amount: Decimal, minimum: Decimal },

    #[error("Deposit of {amount} is below the minimum of {minimum}")]
    BelowMinimumDeposit { amount: Decimal, minimum: Decimal },

    #[error("Withdrawal address is empty")]
    EmptyAddress,

    #[error("Cycle at {attempted} falls in a slot already settled (last cycle at {previous})")]
    CycleAlreadySettled {
        previous: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    #[error("Invalid tier table: {0}")]
    InvalidTierTable(String),

    #[error("Invalid rate {rate} for {name}: must be within [0, 1]")]
    InvalidRate { name: String, rate: Decimal },

    #[error("Cycles per day must be positive")]
    InvalidSchedule,
}

/// The request is well-formed but the account state does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("Insufficient funds: need {needed:.2}, have {available:.2}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("Bot is already active")]
    BotAlreadyActive,

    #[error("Bot is not active")]
    BotInactive,

    #[error("Credential does not match")]
    InvalidCredential,
}

/// Everything the engine and the ledger can fail with.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Corrupt ledger record: {0}")]
    CorruptRecord(String),
}

impl EngineError {
    /// Whether the error is the caller's to fix (as opposed to infrastructure).
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::Precondition(_)
                | EngineError::AccountNotFound(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
