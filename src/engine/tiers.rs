//! Profit tier table and the balance → daily profit interpolation.
//!
//! The schedule is piecewise linear: a ramp from zero up to the first tier,
//! straight segments between consecutive tiers, and a flat profit/balance
//! ratio (taken from the top tier) above the last threshold.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::ValidationError;

/// One (balance threshold, daily profit) point of the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfitTier {
    pub threshold: Decimal,
    pub daily_profit: Decimal,
}

impl ProfitTier {
    pub const fn new(threshold: Decimal, daily_profit: Decimal) -> Self {
        Self {
            threshold,
            daily_profit,
        }
    }
}

/// Ordered, validated, immutable tier schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    tiers: Vec<ProfitTier>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self::canonical()
    }
}

impl TierTable {
    /// Build a table, checking that thresholds and profits both strictly increase.
    pub fn new(tiers: Vec<ProfitTier>) -> Result<Self, ValidationError> {
        let first = tiers
            .first()
            .ok_or_else(|| ValidationError::InvalidTierTable("table is empty".into()))?;

        if first.threshold <= Decimal::ZERO {
            return Err(ValidationError::InvalidTierTable(format!(
                "first threshold must be positive, got {}",
                first.threshold
            )));
        }
        if let Some(tier) = tiers.iter().find(|t| t.daily_profit < Decimal::ZERO) {
            return Err(ValidationError::InvalidTierTable(format!(
                "negative daily profit {} at threshold {}",
                tier.daily_profit, tier.threshold
            )));
        }
        for pair in tiers.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if hi.threshold <= lo.threshold {
                return Err(ValidationError::InvalidTierTable(format!(
                    "thresholds not strictly increasing: {} then {}",
                    lo.threshold, hi.threshold
                )));
            }
            if hi.daily_profit <= lo.daily_profit {
                return Err(ValidationError::InvalidTierTable(format!(
                    "daily profit not strictly increasing: {} then {}",
                    lo.daily_profit, hi.daily_profit
                )));
            }
        }

        Ok(Self { tiers })
    }

    /// The production schedule.
    pub fn canonical() -> Self {
        Self {
            tiers: vec![
                ProfitTier::new(dec!(20), dec!(3.00)),
                ProfitTier::new(dec!(99), dec!(16.83)),
                ProfitTier::new(dec!(458), dec!(91.60)),
                ProfitTier::new(dec!(1288), dec!(283.36)),
                ProfitTier::new(dec!(4388), dec!(1097.00)),
                ProfitTier::new(dec!(10888), dec!(3048.64)),
                ProfitTier::new(dec!(25888), dec!(8284.16)),
            ],
        }
    }

    pub fn tiers(&self) -> &[ProfitTier] {
        &self.tiers
    }

    fn first(&self) -> ProfitTier {
        self.tiers[0]
    }

    fn last(&self) -> ProfitTier {
        self.tiers[self.tiers.len() - 1]
    }

    /// Unrounded daily profit for a balance.
    ///
    /// Non-positive balances earn nothing.
    pub fn daily_profit(&self, balance: Decimal) -> Decimal {
        if balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let first = self.first();
        if balance <= first.threshold {
            return first.daily_profit * balance / first.threshold;
        }

        for pair in self.tiers.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if balance <= hi.threshold {
                let progress = (balance - lo.threshold) / (hi.threshold - lo.threshold);
                return lo.daily_profit + progress * (hi.daily_profit - lo.daily_profit);
            }
        }

        let last = self.last();
        let ratio = last.daily_profit / last.threshold;
        debug!(%balance, %ratio, "Balance above top tier, using flat ratio");
        balance * ratio
    }

    /// Number of tiers the balance has reached (0 below the first threshold).
    pub fn level(&self, balance: Decimal) -> usize {
        self.tiers.iter().take_while(|t| balance >= t.threshold).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
