//! Core engine: tier interpolation, cycle profit, commission and guards.
//!
//! `Engine` bundles the immutable policies and turns an account snapshot
//! into a settlement plan. Planning is pure: the ledger applies the primary
//! credit and the commission of a plan in one transaction.

pub mod commission;
pub mod cycle;
pub mod guards;
pub mod tiers;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::AppConfig;
use crate::types::{
    Account, AccountId, CommissionEvent, CommissionKind, CycleResult, EngineError,
    PreconditionError,
};
use commission::CommissionPolicy;
use cycle::CycleSchedule;
use guards::GuardPolicy;
use tiers::TierTable;

// ---------------------------------------------------------------------------
// Settlement plans
// ---------------------------------------------------------------------------

/// Everything a deposit changes: the depositor's credit and the referrer's cut.
#[derive(Debug, Clone, PartialEq)]
pub struct DepositSettlement {
    pub account_id: AccountId,
    pub credit: Decimal,
    pub commission: Option<CommissionEvent>,
}

/// Everything one profit cycle changes for one account.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSettlement {
    pub result: CycleResult,
    pub commission: Option<CommissionEvent>,
}

impl CycleSettlement {
    pub fn commission_amount(&self) -> Decimal {
        self.commission
            .as_ref()
            .map(|c| c.commission_amount)
            .unwrap_or(Decimal::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Immutable, process-wide profit and commission engine.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    tiers: TierTable,
    schedule: CycleSchedule,
    commission: CommissionPolicy,
    guards: GuardPolicy,
}

impl Engine {
    pub fn new(
        tiers: TierTable,
        schedule: CycleSchedule,
        commission: CommissionPolicy,
        guards: GuardPolicy,
    ) -> Self {
        Self {
            tiers,
            schedule,
            commission,
            guards,
        }
    }

    /// Build and validate the engine from loaded configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, EngineError> {
        let tiers = TierTable::new(config.engine.tiers.clone())?;
        let schedule = CycleSchedule::new(config.engine.cycles_per_day)?;
        let commission =
            CommissionPolicy::new(config.commission.deposit_rate, config.commission.profit_rate)?;
        let guards = GuardPolicy {
            activation_fee: config.guards.activation_fee,
            min_withdrawal: config.guards.min_withdrawal,
            min_deposit: config.guards.min_deposit,
        };
        Ok(Self::new(tiers, schedule, commission, guards))
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn schedule(&self) -> &CycleSchedule {
        &self.schedule
    }

    pub fn commission(&self) -> &CommissionPolicy {
        &self.commission
    }

    pub fn guards(&self) -> &GuardPolicy {
        &self.guards
    }

    pub fn daily_profit(&self, balance: Decimal) -> Decimal {
        self.tiers.daily_profit(balance)
    }

    pub fn cycle_profit(&self, balance: Decimal) -> Decimal {
        self.schedule.cycle_profit(&self.tiers, balance)
    }

    /// Plan a deposit: validated credit plus the referrer's deposit commission.
    pub fn plan_deposit(
        &self,
        account: &Account,
        referrer: Option<&Account>,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<DepositSettlement, EngineError> {
        self.guards.check_deposit(amount)?;
        let commission =
            self.commission
                .assess(account, referrer, amount, CommissionKind::Deposit, at);

        Ok(DepositSettlement {
            account_id: account.id,
            credit: amount,
            commission,
        })
    }

    /// Plan one profit cycle for a bot-active account.
    pub fn plan_cycle(
        &self,
        account: &Account,
        referrer: Option<&Account>,
        at: DateTime<Utc>,
    ) -> Result<CycleSettlement, EngineError> {
        if !account.bot_active {
            return Err(PreconditionError::BotInactive.into());
        }

        let profit = self.cycle_profit(account.balance);
        let commission =
            self.commission
                .assess(account, referrer, profit, CommissionKind::Profit, at);

        debug!(
            account = %account.id,
            balance = %account.balance,
            level = self.tiers.level(account.balance),
            profit = %profit,
            "Cycle planned"
        );

        Ok(CycleSettlement {
            result: CycleResult {
                account_id: account.id,
                balance_before: account.balance,
                profit_amount: profit,
                timestamp: at,
            },
            commission,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
