//! Engine configuration.
//!
//! Loading order:
//! 1. Defaults in code
//! 2. An optional file (`config/orderflow.toml` or any format the `config` crate reads)
//! 3. Environment overrides: `ORDERFLOW__SECTION__KEY`, e.g. `ORDERFLOW__SWEEP__INTERVAL_SECS`

use std::time::Duration;

pub use config::ConfigError;
use config::{Config, Environment, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use orderflow_core::{OrderKind, OrderResult};
use orderflow_orders::ReferencePattern;

pub const ENV_PREFIX: &str = "ORDERFLOW";
pub const DEFAULT_CONFIG_FILE: &str = "config/orderflow";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub references: ReferenceConfig,
    pub locking: LockingConfig,
    pub orders: OrderPolicy,
    pub loans: LoanPolicy,
    pub sweep: SweepConfig,
    pub database: DatabaseConfig,
}

impl EngineConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        load_settings(DEFAULT_CONFIG_FILE)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> OrderResult<()> {
        self.references.patterns()?;
        if self.references.max_attempts == 0 {
            return Err(orderflow_core::OrderError::validation(
                "references.max_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Deserialize any settings struct from `file_stem` plus `ORDERFLOW__*` variables.
pub fn load_settings<T: DeserializeOwned>(file_stem: &str) -> Result<T, ConfigError> {
    Config::builder()
        .add_source(File::with_name(file_stem).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub purchase: String,
    pub sales: String,
    pub build: String,
    pub loan: String,
    pub max_attempts: u32,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            purchase: "PO-{seq:04d}".into(),
            sales: "SO-{seq:04d}".into(),
            build: "BO-{seq:04d}".into(),
            loan: "LO-{seq:04d}".into(),
            max_attempts: 5,
        }
    }
}

impl ReferenceConfig {
    pub fn pattern_for(&self, kind: OrderKind) -> &str {
        match kind {
            OrderKind::Purchase => &self.purchase,
            OrderKind::Sales => &self.sales,
            OrderKind::Build => &self.build,
            OrderKind::Loan => &self.loan,
        }
    }

    pub fn patterns(&self) -> OrderResult<ReferencePatterns> {
        Ok(ReferencePatterns {
            purchase: ReferencePattern::parse(&self.purchase)?,
            sales: ReferencePattern::parse(&self.sales)?,
            build: ReferencePattern::parse(&self.build)?,
            loan: ReferencePattern::parse(&self.loan)?,
        })
    }
}

/// Parsed reference pattern per kind.
#[derive(Debug, Clone)]
pub struct ReferencePatterns {
    purchase: ReferencePattern,
    sales: ReferencePattern,
    build: ReferencePattern,
    loan: ReferencePattern,
}

impl ReferencePatterns {
    pub fn get(&self, kind: OrderKind) -> &ReferencePattern {
        match kind {
            OrderKind::Purchase => &self.purchase,
            OrderKind::Sales => &self.sales,
            OrderKind::Build => &self.build,
            OrderKind::Loan => &self.loan,
        }
    }

    pub fn set(&mut self, kind: OrderKind, pattern: ReferencePattern) {
        match kind {
            OrderKind::Purchase => self.purchase = pattern,
            OrderKind::Sales => self.sales = pattern,
            OrderKind::Build => self.build = pattern,
            OrderKind::Loan => self.loan = pattern,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Longest wait for a row lock before failing with `Busy`.
    pub wait_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self { wait_ms: 5000 }
    }
}

impl LockingConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrderPolicy {
    /// Allow line edits on orders in a complete or cancelled state.
    pub edit_completed_orders: bool,
    /// Orders need a responsible user before they are placed or issued.
    pub require_responsible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoanPolicy {
    pub auto_complete_on_return: bool,
}

impl Default for LoanPolicy {
    fn default() -> Self {
        Self {
            auto_complete_on_return: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub due_soon_days: u32,
    pub remind_due_soon: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
            due_soon_days: 7,
            remind_due_soon: true,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/orderflow".into(),
            max_connections: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.references.pattern_for(OrderKind::Loan), "LO-{seq:04d}");
        assert_eq!(cfg.references.max_attempts, 5);
        assert_eq!(cfg.locking.wait(), Duration::from_secs(5));
        assert!(!cfg.orders.edit_completed_orders);
        assert!(!cfg.orders.require_responsible);
        assert!(cfg.loans.auto_complete_on_return);
        assert_eq!(cfg.sweep.interval_secs, 86_400);
        assert_eq!(cfg.sweep.due_soon_days, 7);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg: EngineConfig = load_settings("config/does-not-exist").unwrap();
        assert_eq!(cfg.references, ReferenceConfig::default());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg: EngineConfig = Config::builder()
            .set_override("sweep.due_soon_days", 3)
            .unwrap()
            .set_override("references.loan", "LOAN-{seq}")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.sweep.due_soon_days, 3);
        assert_eq!(cfg.sweep.interval_secs, 86_400);
        assert_eq!(cfg.references.loan, "LOAN-{seq}");
        assert_eq!(cfg.references.sales, "SO-{seq:04d}");
    }

    #[test]
    fn invalid_pattern_fails_validation() {
        let mut cfg = EngineConfig::default();
        cfg.references.build = "BO-fixed".into();
        assert!(cfg.validate().is_err());
        cfg.references.build = "BO-{seq}".into();
        cfg.references.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }
}
