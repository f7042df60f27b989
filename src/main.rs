//! ACCRUAL — tiered profit accrual and referral commission engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the ledger and runs the profit cycle on a fixed cadence with
//! graceful shutdown.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use accrual::config::AppConfig;
use accrual::driver::{BatchReport, CycleDriver};
use accrual::engine::cycle::round_cents;
use accrual::engine::Engine;
use accrual::storage::SqliteLedger;

const BANNER: &str = r#"
    _    ____ ____ ____  _   _   _    _
   / \  / ___/ ___|  _ \| | | | / \  | |
  / _ \| |  | |   | |_) | | | |/ _ \ | |
 / ___ \ |__| |___|  _ <| |_| / ___ \| |___
/_/   \_\____\____|_| \_\\___/_/   \_\_____|

  Tiered profit accrual & referral commission engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("ACCRUAL_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = if Path::new(&config_path).exists() {
        AppConfig::load(&config_path)?
    } else {
        AppConfig::default()
    };

    init_logging();

    println!("{BANNER}");

    let engine = Arc::new(Engine::from_config(&cfg).context("Invalid engine configuration")?);
    let cadence = cfg.cycle_interval(engine.schedule());
    let interval_secs = cadence.as_secs();
    info!(
        config = %config_path,
        tiers = engine.tiers().tiers().len(),
        cycles_per_day = engine.schedule().cycles_per_day(),
        interval_secs,
        "ACCRUAL starting up"
    );

    let database_url = cfg.storage.resolved_url();
    let ledger = Arc::new(
        SqliteLedger::connect(&database_url, cfg.storage.max_connections, engine.clone())
            .await
            .with_context(|| format!("Failed to open ledger at {database_url}"))?,
    );
    let driver = CycleDriver::new(ledger.clone(), cfg.driver.max_concurrency);

    // -- Main loop -------------------------------------------------------

    // The first tick fires immediately; accounts already settled for the
    // current slot come back as skipped.
    let mut interval = tokio::time::interval(cadence);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(interval_secs, "Entering cycle loop. Press Ctrl+C to stop.");

    let mut cycles_run: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match driver.run_once(chrono::Utc::now()).await {
                    Ok(report) => {
                        cycles_run += 1;
                        log_batch_report(cycles_run, &report);
                    }
                    Err(e) => {
                        error!(error = %e, "Cycle failed, continuing to next");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    ledger.close().await;
    info!(cycles = cycles_run, "ACCRUAL shut down cleanly.");

    Ok(())
}

/// Log a human-readable cycle summary.
fn log_batch_report(cycle: u64, report: &BatchReport) {
    info!(
        cycle,
        cycle_at = %report.cycle_at.to_rfc3339(),
        accounts = report.accounts_seen(),
        settled = report.settled.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        profit = %round_cents(report.total_profit),
        commission = %round_cents(report.total_commission),
        "Batch summary"
    );
    for failure in &report.failed {
        error!(account = %failure.account_id, reason = %failure.reason, "Account not settled");
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("accrual=info"));

    let json_logging = std::env::var("ACCRUAL_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
