//! Ledger integration tests.
//!
//! Each test opens its own SQLite file in the temp dir and drives the
//! engine through the `Ledger` trait, the same way request handlers and the
//! cycle driver do.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use std::sync::Arc;

use accrual::driver::CycleDriver;
use accrual::engine::Engine;
use accrual::storage::{Ledger, SqliteLedger};
use accrual::types::*;

const CREDENTIAL: &str = "wallet-pin-4821";
const ADDRESS: &str = "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE";

struct TestLedger {
    ledger: Arc<SqliteLedger>,
    url: String,
    path: std::path::PathBuf,
}

impl Drop for TestLedger {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut p = self.path.clone().into_os_string();
            p.push(suffix);
            let _ = std::fs::remove_file(p);
        }
    }
}

async fn ledger() -> TestLedger {
    ledger_with_connections(4).await
}

async fn ledger_with_connections(max_connections: u32) -> TestLedger {
    let mut path = std::env::temp_dir();
    path.push(format!("accrual_test_{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    let ledger = SqliteLedger::connect(&url, max_connections, Arc::new(Engine::default()))
        .await
        .unwrap();
    TestLedger {
        ledger: Arc::new(ledger),
        url,
        path,
    }
}

/// Run raw SQL against the test database through a separate connection.
async fn execute_raw(t: &TestLedger, sql: &str) {
    let pool = sqlx::SqlitePool::connect(&t.url).await.unwrap();
    sqlx::query(sql).execute(&pool).await.unwrap();
    pool.close().await;
}

fn credential() -> SecretString {
    SecretString::new(CREDENTIAL.to_string())
}

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

async fn funded(ledger: &SqliteLedger, amount: Decimal, referrer: Option<AccountId>) -> Account {
    let account = ledger.open_account(&credential(), referrer).await.unwrap();
    ledger.deposit(account.id, amount).await.unwrap();
    ledger.account(account.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_open_account_starts_empty() {
    let t = ledger().await;
    let account = t.ledger.open_account(&credential(), None).await.unwrap();
    let stored = t.ledger.account(account.id).await.unwrap().unwrap();
    assert_eq!(stored.balance, Decimal::ZERO);
    assert!(!stored.bot_active);
    assert!(stored.referred_by.is_none());
    assert_eq!(stored.credential_hash.len(), 64);
}

#[tokio::test]
async fn test_unknown_referrer_is_dropped() {
    let t = ledger().await;
    let account = t
        .ledger
        .open_account(&credential(), Some(uuid::Uuid::new_v4()))
        .await
        .unwrap();
    assert!(account.referred_by.is_none());
}

#[tokio::test]
async fn test_deposit_credits_referrer_atomically() {
    let t = ledger().await;
    let referrer = t.ledger.open_account(&credential(), None).await.unwrap();
    let account = t
        .ledger
        .open_account(&credential(), Some(referrer.id))
        .await
        .unwrap();

    let plan = t.ledger.deposit(account.id, dec!(1000)).await.unwrap();
    assert_eq!(plan.credit, dec!(1000));
    assert_eq!(plan.commission.as_ref().unwrap().commission_amount, dec!(50));

    let account = t.ledger.account(account.id).await.unwrap().unwrap();
    let referrer_after = t.ledger.account(referrer.id).await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(1000));
    assert_eq!(referrer_after.balance, dec!(50));

    let events = t.ledger.commissions_for(referrer.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, CommissionKind::Deposit);
    assert_eq!(events[0].source_account_id, account.id);
    assert_eq!(events[0].rate, dec!(0.05));

    let log = t.ledger.transactions_for(referrer.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, TransactionKind::Commission);
    assert_eq!(log[0].reference.as_deref(), Some(events[0].id.to_string().as_str()));
}

#[tokio::test]
async fn test_deposit_without_referrer() {
    let t = ledger().await;
    let account = funded(&t.ledger, dec!(250), None).await;
    assert_eq!(account.balance, dec!(250));

    let log = t.ledger.transactions_for(account.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, TransactionKind::Deposit);
    assert_eq!(log[0].balance_after, dec!(250));
}

#[tokio::test]
async fn test_deposit_rejects_non_positive() {
    let t = ledger().await;
    let account = t.ledger.open_account(&credential(), None).await.unwrap();
    let err = t.ledger.deposit(account.id, dec!(-5)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::NonPositiveAmount(_))));
    assert!(t.ledger.transactions_for(account.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deposit_unknown_account() {
    let t = ledger().await;
    let missing = uuid::Uuid::new_v4();
    let err = t.ledger.deposit(missing, dec!(10)).await.unwrap_err();
    assert!(matches!(err, EngineError::AccountNotFound(id) if id == missing));
}

#[tokio::test]
async fn test_withdrawal_insufficient_funds_leaves_balance() {
    let t = ledger().await;
    let account = funded(&t.ledger, dec!(100), None).await;

    let request = WithdrawalRequest::new(dec!(150), ADDRESS, CREDENTIAL);
    let err = t.ledger.withdraw(account.id, &request).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::InsufficientFunds { .. })
    ));

    let after = t.ledger.account(account.id).await.unwrap().unwrap();
    assert_eq!(after.balance, dec!(100));
    assert_eq!(t.ledger.transactions_for(account.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_withdrawal_wrong_credential() {
    let t = ledger().await;
    let account = funded(&t.ledger, dec!(100), None).await;
    let request = WithdrawalRequest::new(dec!(20), ADDRESS, "guess");
    let err = t.ledger.withdraw(account.id, &request).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::InvalidCredential)
    ));
    assert_eq!(t.ledger.account(account.id).await.unwrap().unwrap().balance, dec!(100));
}

#[tokio::test]
async fn test_withdrawal_recorded() {
    let t = ledger().await;
    let account = funded(&t.ledger, dec!(100), None).await;
    let request = WithdrawalRequest::new(dec!(30), ADDRESS, CREDENTIAL);
    let after = t.ledger.withdraw(account.id, &request).await.unwrap();
    assert_eq!(after.balance, dec!(70));

    let log = t.ledger.transactions_for(account.id).await.unwrap();
    let withdrawal = log.last().unwrap();
    assert_eq!(withdrawal.kind, TransactionKind::Withdrawal);
    assert_eq!(withdrawal.amount, dec!(30));
    assert_eq!(withdrawal.balance_after, dec!(70));
    assert_eq!(withdrawal.reference.as_deref(), Some(ADDRESS));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_withdrawals_cannot_double_spend() {
    let t = ledger().await;
    let account = funded(&t.ledger, dec!(100), None).await;

    let id = account.id;
    let spawn_withdrawal = move |ledger: Arc<SqliteLedger>| {
        tokio::spawn(async move {
            let request = WithdrawalRequest::new(dec!(60), ADDRESS, CREDENTIAL);
            ledger.withdraw(id, &request).await
        })
    };
    let first = spawn_withdrawal(t.ledger.clone());
    let second = spawn_withdrawal(t.ledger.clone());
    let (first, second) = (first.await.unwrap(), second.await.unwrap());

    let outcomes = [first, second];
    let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
    let rejected = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                Err(EngineError::Precondition(PreconditionError::InsufficientFunds { .. }))
            )
        })
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(rejected, 1);

    let after = t.ledger.account(account.id).await.unwrap().unwrap();
    assert_eq!(after.balance, dec!(40));
}

#[tokio::test]
async fn test_activation_guards() {
    let t = ledger().await;
    let account = funded(&t.ledger, dec!(3), None).await;

    let err = t.ledger.activate_bot(account.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::InsufficientFunds { .. })
    ));
    assert!(!t.ledger.account(account.id).await.unwrap().unwrap().bot_active);

    t.ledger.deposit(account.id, dec!(7)).await.unwrap();
    let active = t.ledger.activate_bot(account.id).await.unwrap();
    assert_eq!(active.balance, dec!(5));
    assert!(active.bot_active);

    let stored = t.ledger.account(account.id).await.unwrap().unwrap();
    assert_eq!(stored.balance, dec!(5));
    assert!(stored.bot_active);

    let err = t.ledger.activate_bot(account.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Precondition(PreconditionError::BotAlreadyActive)
    ));
}

#[tokio::test]
async fn test_cycle_requires_active_bot() {
    let t = ledger().await;
    let account = funded(&t.ledger, dec!(100), None).await;
    let err = t.ledger.settle_cycle(account.id, t0()).await.unwrap_err();
    assert!(matches!(err, EngineError::Precondition(PreconditionError::BotInactive)));
    assert!(t.ledger.cycles_for(account.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cycles_accrue_profit_and_commission() {
    let t = ledger().await;
    let referrer = t.ledger.open_account(&credential(), None).await.unwrap();
    let account = funded(&t.ledger, dec!(1000), Some(referrer.id)).await;
    t.ledger.activate_bot(account.id).await.unwrap();

    // Balance 995: daily 215.666.. -> 215.67, per cycle 17.9725
    let first = t.ledger.settle_cycle(account.id, t0()).await.unwrap();
    assert_eq!(first.result.balance_before, dec!(995));
    assert_eq!(first.result.profit_amount, dec!(17.9725));
    assert_eq!(first.commission_amount(), dec!(3.59));

    let second_at = t0() + Duration::hours(2);
    let second = t.ledger.settle_cycle(account.id, second_at).await.unwrap();
    assert_eq!(second.result.balance_before, dec!(1012.9725));
    assert_eq!(second.commission_amount(), dec!(3.66));

    let cycles = t.ledger.cycles_for(account.id).await.unwrap();
    assert_eq!(cycles.len(), 2);
    assert!(cycles[0].timestamp < cycles[1].timestamp);

    // 50 deposit commission + two profit commissions
    let referrer_after = t.ledger.account(referrer.id).await.unwrap().unwrap();
    assert_eq!(referrer_after.balance, dec!(57.25));

    let summary = t.ledger.summary(account.id).await.unwrap();
    assert_eq!(summary.cycles, 2);
    assert_eq!(
        summary.total_profit,
        first.result.profit_amount + second.result.profit_amount
    );
    assert!((summary.account.balance - (dec!(995) + summary.total_profit)).abs() < dec!(0.0000001));

    let referrer_summary = t.ledger.summary(referrer.id).await.unwrap();
    assert_eq!(referrer_summary.total_commission, dec!(57.25));
    assert_eq!(referrer_summary.cycles, 0);
}

#[tokio::test]
async fn test_cycle_settles_once_per_slot() {
    let t = ledger().await;
    let account = funded(&t.ledger, dec!(1000), None).await;
    t.ledger.activate_bot(account.id).await.unwrap();

    t.ledger.settle_cycle(account.id, t0()).await.unwrap();
    let balance = t.ledger.account(account.id).await.unwrap().unwrap().balance;
    assert_eq!(balance, dec!(1012.9725));

    // t0 sits 800s into its two-hour slot; everything up to the next slot
    // boundary, and anything earlier, is the same or an older cycle.
    let mut attempts: Vec<DateTime<Utc>> = (1..24).map(|s| t0() + Duration::seconds(s)).collect();
    attempts.extend([
        t0(),
        t0() + Duration::minutes(106),
        t0() - Duration::hours(2),
    ]);
    for at in attempts {
        let err = t.ledger.settle_cycle(account.id, at).await.unwrap_err();
        assert!(
            matches!(err, EngineError::Validation(ValidationError::CycleAlreadySettled { .. })),
            "settled twice at {at}"
        );
    }
    assert_eq!(t.ledger.account(account.id).await.unwrap().unwrap().balance, balance);
    assert_eq!(t.ledger.cycles_for(account.id).await.unwrap().len(), 1);

    // First instant of the next slot.
    let next = t0() + Duration::minutes(106) + Duration::seconds(40);
    t.ledger.settle_cycle(account.id, next).await.unwrap();
    assert_eq!(t.ledger.cycles_for(account.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_commission_rolls_back_deposit() {
    let t = ledger().await;
    let referrer = t.ledger.open_account(&credential(), None).await.unwrap();
    let account = t
        .ledger
        .open_account(&credential(), Some(referrer.id))
        .await
        .unwrap();

    // Fails the commission insert, after the depositor's balance and
    // audit row have been written inside the same transaction.
    execute_raw(
        &t,
        "CREATE TRIGGER reject_commission BEFORE INSERT ON commission_events \
         BEGIN SELECT RAISE(ABORT, 'commission rejected'); END",
    )
    .await;

    let err = t.ledger.deposit(account.id, dec!(1000)).await.unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));

    let account_after = t.ledger.account(account.id).await.unwrap().unwrap();
    let referrer_after = t.ledger.account(referrer.id).await.unwrap().unwrap();
    assert_eq!(account_after.balance, Decimal::ZERO);
    assert_eq!(referrer_after.balance, Decimal::ZERO);
    assert!(t.ledger.transactions_for(account.id).await.unwrap().is_empty());
    assert!(t.ledger.transactions_for(referrer.id).await.unwrap().is_empty());

    // The connection is usable again once the trigger is gone.
    execute_raw(&t, "DROP TRIGGER reject_commission").await;
    t.ledger.deposit(account.id, dec!(1000)).await.unwrap();
    assert_eq!(t.ledger.account(referrer.id).await.unwrap().unwrap().balance, dec!(50));
}

#[tokio::test]
async fn test_cancelled_request_releases_connection() {
    let t = ledger_with_connections(1).await;
    let account = t.ledger.open_account(&credential(), None).await.unwrap();

    let mut pending = Box::pin(t.ledger.deposit(account.id, dec!(5)));
    for _ in 0..3 {
        let _ = futures::poll!(pending.as_mut());
    }
    drop(pending);

    t.ledger.deposit(account.id, dec!(7)).await.unwrap();
    let balance = t.ledger.account(account.id).await.unwrap().unwrap().balance;
    // The cancelled deposit either committed in full or not at all.
    assert!(balance == dec!(7) || balance == dec!(12), "balance {balance}");
}

#[tokio::test]
async fn test_driver_settles_every_active_account() {
    let t = ledger().await;
    let mut active = Vec::new();
    for amount in [dec!(20), dec!(105), dec!(30005)] {
        let account = funded(&t.ledger, amount, None).await;
        t.ledger.activate_bot(account.id).await.unwrap();
        active.push(account.id);
    }
    let idle = funded(&t.ledger, dec!(500), None).await;

    let driver = CycleDriver::new(t.ledger.clone(), 2);
    let report = driver.run_once(t0()).await.unwrap();

    assert_eq!(report.settled.len(), 3);
    assert!(report.failed.is_empty());
    // 15 -> 2.25/12, 100 -> 17.04/12, 30000 -> 9600/12
    assert_eq!(report.settled.iter().filter(|s| s.result.account_id == idle.id).count(), 0);
    let expected = (dec!(2.25) + dec!(17.04) + dec!(9600)) / dec!(12);
    assert!((report.total_profit - expected).abs() < dec!(0.0000001));

    // A restart inside the same slot settles nothing twice.
    let rerun = driver.run_once(t0() + Duration::minutes(30)).await.unwrap();
    assert!(rerun.settled.is_empty());
    assert!(rerun.failed.is_empty());
    assert_eq!(rerun.skipped.len(), 3);
    assert_eq!(rerun.total_profit, Decimal::ZERO);
}
