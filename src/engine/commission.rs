//! Referral commission.
//!
//! A referrer earns a fixed share of every deposit and every profit
//! distribution of the accounts they referred. Missing referrers are a soft
//! no-op: the primary action proceeds and no event is produced.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};
use uuid::Uuid;

use super::cycle::round_cents;
use crate::types::{Account, CommissionEvent, CommissionKind, ValidationError};

/// Commission rates per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionPolicy {
    deposit_rate: Decimal,
    profit_rate: Decimal,
}

impl Default for CommissionPolicy {
    fn default() -> Self {
        Self {
            deposit_rate: dec!(0.05), // 5% of deposits
            profit_rate: dec!(0.20),  // 20% of profit distributions
        }
    }
}

impl CommissionPolicy {
    pub fn new(deposit_rate: Decimal, profit_rate: Decimal) -> Result<Self, ValidationError> {
        for (name, rate) in [("deposit_rate", deposit_rate), ("profit_rate", profit_rate)] {
            if rate < Decimal::ZERO || rate > Decimal::ONE {
                return Err(ValidationError::InvalidRate {
                    name: name.to_string(),
                    rate,
                });
            }
        }
        Ok(Self {
            deposit_rate,
            profit_rate,
        })
    }

    pub fn rate(&self, kind: CommissionKind) -> Decimal {
        match kind {
            CommissionKind::Deposit => self.deposit_rate,
            CommissionKind::Profit => self.profit_rate,
        }
    }

    /// Commission on `base_amount`, rounded to cents. Non-positive bases pay nothing.
    pub fn commission(&self, base_amount: Decimal, kind: CommissionKind) -> Decimal {
        if base_amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        round_cents(base_amount * self.rate(kind))
    }

    /// Build the commission event for a monetary event on `source`, if any is owed.
    ///
    /// `referrer` is the result of looking up `source.referred_by`; `None`
    /// there means the lookup found nothing.
    pub fn assess(
        &self,
        source: &Account,
        referrer: Option<&Account>,
        base_amount: Decimal,
        kind: CommissionKind,
        at: DateTime<Utc>,
    ) -> Option<CommissionEvent> {
        let referrer_id = source.referred_by?;

        let referrer = match referrer {
            Some(r) if r.id == referrer_id => r,
            Some(r) => {
                warn!(
                    account = %source.id,
                    expected = %referrer_id,
                    got = %r.id,
                    "Referrer lookup returned a different account, skipping commission"
                );
                return None;
            }
            None => {
                warn!(
                    account = %source.id,
                    referrer = %referrer_id,
                    "Referrer not found, skipping commission"
                );
                return None;
            }
        };

        if referrer.id == source.id {
            warn!(account = %source.id, "Account refers itself, skipping commission");
            return None;
        }

        let amount = self.commission(base_amount, kind);
        if amount.is_zero() {
            debug!(
                account = %source.id,
                base = %base_amount,
                %kind,
                "Commission rounds to zero"
            );
            return None;
        }

        Some(CommissionEvent {
            id: Uuid::new_v4(),
            source_account_id: source.id,
            referrer_account_id: referrer.id,
            base_amount,
            kind,
            rate: self.rate(kind),
            commission_amount: amount,
            created_at: at,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
