//! Cycle driver: one profit distribution over every bot-active account.
//!
//! Each account settles in its own ledger transaction. A failure on one
//! account is recorded in the batch report and never blocks the others.
//! Accounts already settled for the current slot (after a restart, say) are
//! reported as skipped rather than failed.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::cycle::round_cents;
use crate::engine::CycleSettlement;
use crate::storage::Ledger;
use crate::types::{AccountId, EngineError, ValidationError};

// ---------------------------------------------------------------------------
// Batch report
// ---------------------------------------------------------------------------

/// Outcome of one cycle across all active accounts.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub cycle_at: DateTime<Utc>,
    pub settled: Vec<CycleSettlement>,
    pub failed: Vec<FailedSettlement>,
    /// Accounts whose slot was already settled.
    pub skipped: Vec<AccountId>,
    pub total_profit: Decimal,
    pub total_commission: Decimal,
}

#[derive(Debug, Clone)]
pub struct FailedSettlement {
    pub account_id: AccountId,
    pub reason: String,
}

impl BatchReport {
    fn new(cycle_at: DateTime<Utc>) -> Self {
        Self {
            cycle_at,
            settled: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            total_profit: Decimal::ZERO,
            total_commission: Decimal::ZERO,
        }
    }

    pub fn accounts_seen(&self) -> usize {
        self.settled.len() + self.failed.len() + self.skipped.len()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct CycleDriver {
    ledger: Arc<dyn Ledger>,
    max_concurrency: usize,
}

impl CycleDriver {
    pub fn new(ledger: Arc<dyn Ledger>, max_concurrency: usize) -> Self {
        Self {
            ledger,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Settle one cycle at `at` for every bot-active account.
    ///
    /// Only a failure to list the accounts is returned as an error.
    pub async fn run_once(&self, at: DateTime<Utc>) -> Result<BatchReport, EngineError> {
        let accounts = self.ledger.active_accounts().await?;
        let mut report = BatchReport::new(at);

        if accounts.is_empty() {
            info!("No active bots, nothing to settle");
            return Ok(report);
        }

        info!(count = accounts.len(), cycle_at = %at.to_rfc3339(), "Settling cycle");

        let ledger = &self.ledger;
        let outcomes: Vec<(AccountId, Result<CycleSettlement, EngineError>)> =
            stream::iter(accounts)
                .map(|id| async move { (id, ledger.settle_cycle(id, at).await) })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

        for (account_id, outcome) in outcomes {
            match outcome {
                Ok(settlement) => {
                    report.total_profit += settlement.result.profit_amount;
                    report.total_commission += settlement.commission_amount();
                    report.settled.push(settlement);
                }
                Err(EngineError::Validation(ValidationError::CycleAlreadySettled { .. })) => {
                    debug!(account = %account_id, "Slot already settled, skipping");
                    report.skipped.push(account_id);
                }
                Err(e) => {
                    if e.is_user_facing() {
                        warn!(account = %account_id, error = %e, "Cycle settlement rejected");
                    } else {
                        error!(account = %account_id, error = %e, "Cycle settlement failed");
                    }
                    report.failed.push(FailedSettlement {
                        account_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            settled = report.settled.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            profit = %round_cents(report.total_profit),
            commission = %round_cents(report.total_commission),
            "Cycle complete"
        );

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
