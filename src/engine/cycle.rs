//! Cycle profit derivation.
//!
//! The daily figure is rounded to cents once, then split evenly across the
//! day's cycles without further rounding. Display code rounds again.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use super::tiers::TierTable;
use crate::types::ValidationError;

/// One cycle every two hours.
pub const DEFAULT_CYCLES_PER_DAY: u32 = 12;

/// Round half-up (away from zero) to two decimal places.
pub fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// How many profit distributions happen per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSchedule {
    cycles_per_day: u32,
}

impl Default for CycleSchedule {
    fn default() -> Self {
        Self {
            cycles_per_day: DEFAULT_CYCLES_PER_DAY,
        }
    }
}

impl CycleSchedule {
    pub fn new(cycles_per_day: u32) -> Result<Self, ValidationError> {
        if cycles_per_day == 0 {
            return Err(ValidationError::InvalidSchedule);
        }
        Ok(Self { cycles_per_day })
    }

    pub fn cycles_per_day(&self) -> u32 {
        self.cycles_per_day
    }

    /// Wall-clock spacing between cycles.
    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(86_400_000 / i64::from(self.cycles_per_day))
    }

    /// Index of the cycle slot containing `at`, counted from the Unix epoch.
    ///
    /// Slots are aligned to UTC midnight, so slot `n` and `n + cycles_per_day`
    /// are the same cycle of consecutive days. An account settles at most
    /// once per slot.
    pub fn slot(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp_millis()
            .div_euclid(self.interval().num_milliseconds())
    }

    /// Daily profit rounded to cents.
    pub fn rounded_daily_profit(&self, tiers: &TierTable, balance: Decimal) -> Decimal {
        round_cents(tiers.daily_profit(balance))
    }

    /// Profit credited for a single cycle.
    pub fn cycle_profit(&self, tiers: &TierTable, balance: Decimal) -> Decimal {
        self.rounded_daily_profit(tiers, balance) / Decimal::from(self.cycles_per_day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_cents_half_up() {
        assert_eq!(round_cents(dec!(0.125)), dec!(0.13));
        assert_eq!(round_cents(dec!(2.675)), dec!(2.68));
        assert_eq!(round_cents(dec!(2.674)), dec!(2.67));
        assert_eq!(round_cents(dec!(9.915)), dec!(9.92));
    }

    #[test]
    fn test_default_schedule() {
        let schedule = CycleSchedule::default();
        assert_eq!(schedule.cycles_per_day(), 12);
        assert_eq!(schedule.interval(), chrono::Duration::hours(2));
    }

    #[test]
    fn test_slots_follow_interval() {
        let schedule = CycleSchedule::default();
        let midnight = DateTime::from_timestamp(1_700_006_400, 0).unwrap();
        let slot = schedule.slot(midnight);
        assert_eq!(schedule.slot(midnight + chrono::Duration::seconds(1)), slot);
        assert_eq!(schedule.slot(midnight + chrono::Duration::minutes(119)), slot);
        assert_eq!(schedule.slot(midnight + chrono::Duration::hours(2)), slot + 1);
        assert_eq!(schedule.slot(midnight + chrono::Duration::days(1)), slot + 12);
        assert_eq!(schedule.slot(midnight - chrono::Duration::milliseconds(1)), slot - 1);
    }

    #[test]
    fn test_interval_for_uneven_schedule() {
        let schedule = CycleSchedule::new(7).unwrap();
        assert_eq!(schedule.interval(), chrono::Duration::milliseconds(12_342_857));
    }

    #[test]
    fn test_rejects_zero_cycles() {
        assert_eq!(CycleSchedule::new(0), Err(ValidationError::InvalidSchedule));
    }

    #[test]
    fn test_cycle_profit_at_first_tier() {
        let tiers = TierTable::canonical();
        let schedule = CycleSchedule::default();
        assert_eq!(schedule.cycle_profit(&tiers, dec!(20)), dec!(0.25));
        assert_eq!(schedule.cycle_profit(&tiers, Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_rounds_daily_before_dividing() {
        let tiers = TierTable::canonical();
        let schedule = CycleSchedule::default();
        // 9.915 rounds to 9.92 before the split
        assert_eq!(schedule.rounded_daily_profit(&tiers, dec!(59.5)), dec!(9.92));
        let day_of_cycles = schedule.cycle_profit(&tiers, dec!(59.5)) * dec!(12);
        assert!((day_of_cycles - dec!(9.92)).abs() < dec!(0.000001));
    }

    #[test]
    fn test_twelve_cycles_match_daily_profit() {
        let tiers = TierTable::canonical();
        let schedule = CycleSchedule::default();
        for balance in [dec!(3.33), dec!(57), dec!(100), dec!(777.77), dec!(5000), dec!(123456.78)] {
            let daily = tiers.daily_profit(balance);
            let day_of_cycles = schedule.cycle_profit(&tiers, balance) * dec!(12);
            let drift = (day_of_cycles - daily).abs();
            assert!(drift <= dec!(0.06), "balance {balance}: drift {drift}");
        }
    }

    #[test]
    fn test_custom_schedule() {
        let tiers = TierTable::canonical();
        let schedule = CycleSchedule::new(24).unwrap();
        assert_eq!(schedule.interval(), chrono::Duration::hours(1));
        assert_eq!(schedule.cycle_profit(&tiers, dec!(99)), dec!(0.70125));
    }
}
