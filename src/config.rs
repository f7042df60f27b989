//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section is optional; missing values fall back to the canonical
//! production configuration. The database URL may be overridden by an
//! env var named in the config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::cycle::{CycleSchedule, DEFAULT_CYCLES_PER_DAY};
use crate::engine::tiers::{ProfitTier, TierTable};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub commission: CommissionConfig,
    pub guards: GuardsConfig,
    pub driver: DriverConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub cycles_per_day: u32,
    /// Tier schedule in increasing order.
    pub tiers: Vec<ProfitTier>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycles_per_day: DEFAULT_CYCLES_PER_DAY,
            tiers: TierTable::canonical().tiers().to_vec(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CommissionConfig {
    pub deposit_rate: Decimal,
    pub profit_rate: Decimal,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            deposit_rate: dec!(0.05),
            profit_rate: dec!(0.20),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GuardsConfig {
    pub activation_fee: Decimal,
    pub min_withdrawal: Decimal,
    pub min_deposit: Decimal,
}

impl Default for GuardsConfig {
    fn default() -> Self {
        Self {
            activation_fee: dec!(5),
            min_withdrawal: dec!(10),
            min_deposit: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DriverConfig {
    /// Seconds between cycle runs. Defaults to the schedule's interval.
    pub cycle_interval_secs: Option<u64>,
    /// Accounts settled concurrently within one cycle.
    pub max_concurrency: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: None,
            max_concurrency: 8,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    /// Env var that, when set, overrides `database_url`.
    pub database_url_env: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://accrual.db".to_string(),
            database_url_env: Some("ACCRUAL_DATABASE_URL".to_string()),
            max_connections: 5,
        }
    }
}

impl StorageConfig {
    /// The database URL after applying the env override, if any.
    pub fn resolved_url(&self) -> String {
        self.database_url_env
            .as_deref()
            .and_then(|env| AppConfig::resolve_env(env).ok())
            .unwrap_or_else(|| self.database_url.clone())
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Time between driver runs, falling back to the schedule's interval.
    pub fn cycle_interval(&self, schedule: &CycleSchedule) -> Duration {
        match self.driver.cycle_interval_secs {
            Some(secs) => Duration::from_secs(secs.max(1)),
            None => schedule
                .interval()
                .to_std()
                .unwrap_or(Duration::from_secs(86_400)),
        }
    }
}
