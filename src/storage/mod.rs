//! Persistence layer.
//!
//! `Ledger` is the seam between the pure engine and storage. `SqliteLedger`
//! applies engine plans inside a single `BEGIN IMMEDIATE` transaction per
//! request: the account row is re-read under the write lock, the plan is
//! computed from that snapshot, and every balance change plus its audit rows
//! commit together or not at all.
//!
//! Decimals are stored as exact text, timestamps as epoch milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::guards::hash_credential;
use crate::engine::{CycleSettlement, DepositSettlement, Engine};
use crate::types::{
    Account, AccountId, AccountSummary, CommissionEvent, CommissionKind, CycleResult,
    EngineError, TransactionKind, TransactionRecord, ValidationError, WithdrawalRequest,
};

/// How long a writer waits for the database lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id              TEXT PRIMARY KEY,
        balance         TEXT NOT NULL,
        referred_by     TEXT,
        bot_active      INTEGER NOT NULL DEFAULT 0,
        credential_hash TEXT NOT NULL,
        last_cycle_at   INTEGER,
        created_at      INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS commission_events (
        id                  TEXT PRIMARY KEY,
        source_account_id   TEXT NOT NULL,
        referrer_account_id TEXT NOT NULL,
        base_amount         TEXT NOT NULL,
        kind                TEXT NOT NULL,
        rate                TEXT NOT NULL,
        commission_amount   TEXT NOT NULL,
        created_at          INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cycle_results (
        account_id     TEXT NOT NULL,
        balance_before TEXT NOT NULL,
        profit_amount  TEXT NOT NULL,
        timestamp      INTEGER NOT NULL,
        slot           INTEGER NOT NULL,
        PRIMARY KEY (account_id, slot)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id            TEXT PRIMARY KEY,
        account_id    TEXT NOT NULL,
        kind          TEXT NOT NULL,
        amount        TEXT NOT NULL,
        balance_after TEXT NOT NULL,
        reference     TEXT,
        created_at    INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_commission_referrer ON commission_events (referrer_account_id)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions (account_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_accounts_bot ON accounts (bot_active)",
];

// ---------------------------------------------------------------------------
// Ledger trait
// ---------------------------------------------------------------------------

/// Transactional store of accounts, balances and their audit trail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Open an account with a zero balance. An unknown referrer is dropped.
    async fn open_account(
        &self,
        credential: &SecretString,
        referred_by: Option<AccountId>,
    ) -> Result<Account, EngineError>;

    async fn account(&self, id: AccountId) -> Result<Option<Account>, EngineError>;

    /// Ids of every account whose bot is active.
    async fn active_accounts(&self) -> Result<Vec<AccountId>, EngineError>;

    async fn deposit(&self, id: AccountId, amount: Decimal)
        -> Result<DepositSettlement, EngineError>;

    async fn withdraw(
        &self,
        id: AccountId,
        request: &WithdrawalRequest,
    ) -> Result<Account, EngineError>;

    async fn activate_bot(&self, id: AccountId) -> Result<Account, EngineError>;

    /// Credit one cycle of profit. `at` must be after the account's previous cycle.
    async fn settle_cycle(
        &self,
        id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<CycleSettlement, EngineError>;

    async fn commissions_for(&self, referrer: AccountId)
        -> Result<Vec<CommissionEvent>, EngineError>;

    async fn cycles_for(&self, id: AccountId) -> Result<Vec<CycleResult>, EngineError>;

    async fn transactions_for(&self, id: AccountId)
        -> Result<Vec<TransactionRecord>, EngineError>;

    async fn summary(&self, id: AccountId) -> Result<AccountSummary, EngineError>;
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

struct StoredAccount {
    account: Account,
    last_cycle_at: Option<DateTime<Utc>>,
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, EngineError> {
    Decimal::from_str(raw)
        .map_err(|e| EngineError::CorruptRecord(format!("{field}={raw}: {e}")))
}

fn parse_id(raw: &str, field: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(raw).map_err(|e| EngineError::CorruptRecord(format!("{field}={raw}: {e}")))
}

fn parse_time(millis: i64, field: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| EngineError::CorruptRecord(format!("{field}={millis}: out of range")))
}

fn account_from_row(row: &SqliteRow) -> Result<StoredAccount, EngineError> {
    let referred_by = row
        .try_get::<Option<String>, _>("referred_by")?
        .map(|raw| parse_id(&raw, "referred_by"))
        .transpose()?;
    let last_cycle_at = row
        .try_get::<Option<i64>, _>("last_cycle_at")?
        .map(|ms| parse_time(ms, "last_cycle_at"))
        .transpose()?;

    Ok(StoredAccount {
        account: Account {
            id: parse_id(&row.try_get::<String, _>("id")?, "id")?,
            balance: parse_decimal(&row.try_get::<String, _>("balance")?, "balance")?,
            referred_by,
            bot_active: row.try_get::<bool, _>("bot_active")?,
            credential_hash: row.try_get("credential_hash")?,
        },
        last_cycle_at,
    })
}

fn commission_from_row(row: &SqliteRow) -> Result<CommissionEvent, EngineError> {
    let kind: String = row.try_get("kind")?;
    Ok(CommissionEvent {
        id: parse_id(&row.try_get::<String, _>("id")?, "id")?,
        source_account_id: parse_id(
            &row.try_get::<String, _>("source_account_id")?,
            "source_account_id",
        )?,
        referrer_account_id: parse_id(
            &row.try_get::<String, _>("referrer_account_id")?,
            "referrer_account_id",
        )?,
        base_amount: parse_decimal(&row.try_get::<String, _>("base_amount")?, "base_amount")?,
        kind: CommissionKind::from_str(&kind)
            .map_err(|e| EngineError::CorruptRecord(e.to_string()))?,
        rate: parse_decimal(&row.try_get::<String, _>("rate")?, "rate")?,
        commission_amount: parse_decimal(
            &row.try_get::<String, _>("commission_amount")?,
            "commission_amount",
        )?,
        created_at: parse_time(row.try_get("created_at")?, "created_at")?,
    })
}

fn cycle_from_row(row: &SqliteRow) -> Result<CycleResult, EngineError> {
    Ok(CycleResult {
        account_id: parse_id(&row.try_get::<String, _>("account_id")?, "account_id")?,
        balance_before: parse_decimal(
            &row.try_get::<String, _>("balance_before")?,
            "balance_before",
        )?,
        profit_amount: parse_decimal(&row.try_get::<String, _>("profit_amount")?, "profit_amount")?,
        timestamp: parse_time(row.try_get("timestamp")?, "timestamp")?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<TransactionRecord, EngineError> {
    let kind: String = row.try_get("kind")?;
    Ok(TransactionRecord {
        id: parse_id(&row.try_get::<String, _>("id")?, "id")?,
        account_id: parse_id(&row.try_get::<String, _>("account_id")?, "account_id")?,
        kind: TransactionKind::from_str(&kind)
            .map_err(|e| EngineError::CorruptRecord(e.to_string()))?,
        amount: parse_decimal(&row.try_get::<String, _>("amount")?, "amount")?,
        balance_after: parse_decimal(&row.try_get::<String, _>("balance_after")?, "balance_after")?,
        reference: row.try_get("reference")?,
        created_at: parse_time(row.try_get("created_at")?, "created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Statement helpers (all run on a connection that holds the write lock)
// ---------------------------------------------------------------------------

async fn fetch_account(
    conn: &mut SqliteConnection,
    id: AccountId,
) -> Result<Option<StoredAccount>, EngineError> {
    let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(account_from_row).transpose()
}

async fn require_account(
    conn: &mut SqliteConnection,
    id: AccountId,
) -> Result<StoredAccount, EngineError> {
    fetch_account(conn, id)
        .await?
        .ok_or(EngineError::AccountNotFound(id))
}

/// Look up the referrer of `account`, if it has one and it still exists.
async fn fetch_referrer(
    conn: &mut SqliteConnection,
    account: &Account,
) -> Result<Option<Account>, EngineError> {
    match account.referred_by {
        Some(referrer_id) => Ok(fetch_account(conn, referrer_id).await?.map(|s| s.account)),
        None => Ok(None),
    }
}

async fn write_balance(
    conn: &mut SqliteConnection,
    id: AccountId,
    balance: Decimal,
) -> Result<(), EngineError> {
    sqlx::query("UPDATE accounts SET balance = ? WHERE id = ?")
        .bind(balance.to_string())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn append_transaction(
    conn: &mut SqliteConnection,
    record: &TransactionRecord,
) -> Result<(), EngineError> {
    sqlx::query(
        "INSERT INTO transactions (id, account_id, kind, amount, balance_after, reference, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.id.to_string())
    .bind(record.account_id.to_string())
    .bind(record.kind.to_string())
    .bind(record.amount.to_string())
    .bind(record.balance_after.to_string())
    .bind(record.reference.clone())
    .bind(record.created_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Credit the referrer and append the commission event plus its audit row.
async fn apply_commission(
    conn: &mut SqliteConnection,
    event: &CommissionEvent,
) -> Result<(), EngineError> {
    let referrer = require_account(conn, event.referrer_account_id).await?;
    let balance_after = referrer.account.balance + event.commission_amount;
    write_balance(conn, referrer.account.id, balance_after).await?;

    sqlx::query(
        "INSERT INTO commission_events \
         (id, source_account_id, referrer_account_id, base_amount, kind, rate, commission_amount, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.id.to_string())
    .bind(event.source_account_id.to_string())
    .bind(event.referrer_account_id.to_string())
    .bind(event.base_amount.to_string())
    .bind(event.kind.to_string())
    .bind(event.rate.to_string())
    .bind(event.commission_amount.to_string())
    .bind(event.created_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;

    append_transaction(
        conn,
        &TransactionRecord::new(
            referrer.account.id,
            TransactionKind::Commission,
            event.commission_amount,
            balance_after,
            Some(event.id.to_string()),
            event.created_at,
        ),
    )
    .await?;

    info!(
        referrer = %event.referrer_account_id,
        source = %event.source_account_id,
        kind = %event.kind,
        amount = %event.commission_amount,
        "Commission credited"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// SQLite ledger
// ---------------------------------------------------------------------------

/// SQLite-backed ledger applying plans from a shared `Engine`.
pub struct SqliteLedger {
    pool: SqlitePool,
    engine: Arc<Engine>,
}

impl SqliteLedger {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        engine: Arc<Engine>,
    ) -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let ledger = Self { pool, engine };
        ledger.migrate().await?;
        info!(url, max_connections, "Ledger connected");
        Ok(ledger)
    }

    /// Create tables and indexes if they don't exist.
    pub async fn migrate(&self) -> Result<(), EngineError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Ledger schema ready");
        Ok(())
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Open a write transaction holding the database lock from the start.
    ///
    /// The returned guard rolls back when dropped without `commit`, including
    /// when the caller's future is cancelled mid-request.
    async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>, EngineError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn deposit_locked(
        &self,
        conn: &mut SqliteConnection,
        id: AccountId,
        amount: Decimal,
    ) -> Result<DepositSettlement, EngineError> {
        let stored = require_account(conn, id).await?;
        let referrer = fetch_referrer(conn, &stored.account).await?;
        let now = Utc::now();

        let plan = self
            .engine
            .plan_deposit(&stored.account, referrer.as_ref(), amount, now)?;

        let balance_after = stored.account.balance + plan.credit;
        write_balance(conn, id, balance_after).await?;
        append_transaction(
            conn,
            &TransactionRecord::new(id, TransactionKind::Deposit, plan.credit, balance_after, None, now),
        )
        .await?;

        if let Some(event) = &plan.commission {
            apply_commission(conn, event).await?;
        }

        info!(account = %id, amount = %amount, balance = %balance_after, "Deposit credited");
        Ok(plan)
    }

    async fn withdraw_locked(
        &self,
        conn: &mut SqliteConnection,
        id: AccountId,
        request: &WithdrawalRequest,
    ) -> Result<Account, EngineError> {
        let stored = require_account(conn, id).await?;
        let debited = self.engine.guards().withdraw(&stored.account, request)?;

        write_balance(conn, id, debited.balance).await?;
        append_transaction(
            conn,
            &TransactionRecord::new(
                id,
                TransactionKind::Withdrawal,
                request.amount,
                debited.balance,
                Some(request.address.clone()),
                Utc::now(),
            ),
        )
        .await?;

        info!(
            account = %id,
            amount = %request.amount,
            address = %request.address,
            balance = %debited.balance,
            "Withdrawal accepted"
        );
        Ok(debited)
    }

    async fn activate_locked(
        &self,
        conn: &mut SqliteConnection,
        id: AccountId,
    ) -> Result<Account, EngineError> {
        let stored = require_account(conn, id).await?;
        let activated = self.engine.guards().activate(&stored.account)?;

        sqlx::query("UPDATE accounts SET balance = ?, bot_active = 1 WHERE id = ?")
            .bind(activated.balance.to_string())
            .bind(id.to_string())
            .execute(&mut *conn)
            .await?;
        append_transaction(
            conn,
            &TransactionRecord::new(
                id,
                TransactionKind::Activation,
                self.engine.guards().activation_fee,
                activated.balance,
                None,
                Utc::now(),
            ),
        )
        .await?;

        info!(account = %id, balance = %activated.balance, "Bot activated");
        Ok(activated)
    }

    async fn settle_locked(
        &self,
        conn: &mut SqliteConnection,
        id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<CycleSettlement, EngineError> {
        let stored = require_account(conn, id).await?;
        let schedule = self.engine.schedule();
        let slot = schedule.slot(at);
        if let Some(previous) = stored.last_cycle_at {
            if slot <= schedule.slot(previous) {
                return Err(ValidationError::CycleAlreadySettled {
                    previous,
                    attempted: at,
                }
                .into());
            }
        }

        let referrer = fetch_referrer(conn, &stored.account).await?;
        let plan = self.engine.plan_cycle(&stored.account, referrer.as_ref(), at)?;
        let result = &plan.result;
        let balance_after = result.balance_after();

        sqlx::query("UPDATE accounts SET balance = ?, last_cycle_at = ? WHERE id = ?")
            .bind(balance_after.to_string())
            .bind(at.timestamp_millis())
            .bind(id.to_string())
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            "INSERT INTO cycle_results (account_id, balance_before, profit_amount, timestamp, slot) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(result.balance_before.to_string())
        .bind(result.profit_amount.to_string())
        .bind(at.timestamp_millis())
        .bind(slot)
        .execute(&mut *conn)
        .await?;

        if !result.profit_amount.is_zero() {
            append_transaction(
                conn,
                &TransactionRecord::new(
                    id,
                    TransactionKind::Profit,
                    result.profit_amount,
                    balance_after,
                    None,
                    at,
                ),
            )
            .await?;
        }

        if let Some(event) = &plan.commission {
            apply_commission(conn, event).await?;
        }

        debug!(account = %id, slot, profit = %result.profit_amount, balance = %balance_after, "Cycle settled");
        Ok(plan)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn open_account(
        &self,
        credential: &SecretString,
        referred_by: Option<AccountId>,
    ) -> Result<Account, EngineError> {
        let referred_by = match referred_by {
            Some(referrer) if self.account(referrer).await?.is_some() => Some(referrer),
            Some(referrer) => {
                warn!(referrer = %referrer, "Unknown referrer, opening account without one");
                None
            }
            None => None,
        };

        let account = Account {
            id: Uuid::new_v4(),
            balance: Decimal::ZERO,
            referred_by,
            bot_active: false,
            credential_hash: hash_credential(credential),
        };

        sqlx::query(
            "INSERT INTO accounts (id, balance, referred_by, bot_active, credential_hash, created_at) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(account.id.to_string())
        .bind(account.balance.to_string())
        .bind(account.referred_by.map(|r| r.to_string()))
        .bind(account.credential_hash.clone())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        info!(account = %account.id, referred_by = ?account.referred_by, "Account opened");
        Ok(account)
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, EngineError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .as_ref()
            .map(account_from_row)
            .transpose()?
            .map(|stored| stored.account))
    }

    async fn active_accounts(&self) -> Result<Vec<AccountId>, EngineError> {
        let rows = sqlx::query("SELECT id FROM accounts WHERE bot_active = 1 ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| parse_id(&row.try_get::<String, _>("id")?, "id"))
            .collect()
    }

    async fn deposit(
        &self,
        id: AccountId,
        amount: Decimal,
    ) -> Result<DepositSettlement, EngineError> {
        // Reject malformed amounts before taking the write lock.
        self.engine.guards().check_deposit(amount)?;
        let mut tx = self.begin_immediate().await?;
        let outcome = self.deposit_locked(&mut *tx, id, amount).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn withdraw(
        &self,
        id: AccountId,
        request: &WithdrawalRequest,
    ) -> Result<Account, EngineError> {
        let mut tx = self.begin_immediate().await?;
        let outcome = self.withdraw_locked(&mut *tx, id, request).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn activate_bot(&self, id: AccountId) -> Result<Account, EngineError> {
        let mut tx = self.begin_immediate().await?;
        let outcome = self.activate_locked(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn settle_cycle(
        &self,
        id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<CycleSettlement, EngineError> {
        let mut tx = self.begin_immediate().await?;
        let outcome = self.settle_locked(&mut *tx, id, at).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn commissions_for(
        &self,
        referrer: AccountId,
    ) -> Result<Vec<CommissionEvent>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM commission_events WHERE referrer_account_id = ? ORDER BY created_at, rowid",
        )
        .bind(referrer.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(commission_from_row).collect()
    }

    async fn cycles_for(&self, id: AccountId) -> Result<Vec<CycleResult>, EngineError> {
        let rows = sqlx::query("SELECT * FROM cycle_results WHERE account_id = ? ORDER BY timestamp")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(cycle_from_row).collect()
    }

    async fn transactions_for(
        &self,
        id: AccountId,
    ) -> Result<Vec<TransactionRecord>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE account_id = ? ORDER BY created_at, rowid",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn summary(&self, id: AccountId) -> Result<AccountSummary, EngineError> {
        let account = self
            .account(id)
            .await?
            .ok_or(EngineError::AccountNotFound(id))?;
        let cycles = self.cycles_for(id).await?;
        let commissions = self.commissions_for(id).await?;

        Ok(AccountSummary {
            account,
            total_profit: cycles.iter().map(|c| c.profit_amount).sum(),
            total_commission: commissions.iter().map(|c| c.commission_amount).sum(),
            cycles: cycles.len() as u64,
        })
    }
}
