//! Application configuration management.

use chrono::TimeDelta;
use serde::Deserialize;

use crate::types::{Currency, MAX_PRECISION, Money};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Ledger-wide settings.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Fine engine policy.
    #[serde(default)]
    pub fines: FineConfig,
    /// Inactivity cost engine policy.
    #[serde(default)]
    pub inactivity: InactivityConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

/// Ledger-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Currency every ledger amount is expressed in.
    #[serde(default = "default_currency")]
    pub currency: Currency,
    /// Minor-unit digits for the ledger currency.
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Attempts for a ledger write that hits a concurrency conflict.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_currency() -> Currency {
    Currency::Eur
}

fn default_precision() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            precision: default_precision(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl LedgerConfig {
    /// Builds a ledger amount from minor units.
    #[must_use]
    pub const fn money(&self, amount: i64) -> Money {
        Money::new(amount, self.currency, self.precision)
    }

    /// Zero in the ledger currency.
    #[must_use]
    pub const fn zero(&self) -> Money {
        self.money(0)
    }
}

/// Fine engine policy.
#[derive(Debug, Clone, Deserialize)]
pub struct FineConfig {
    /// Days a balance must stay negative before a fine is due.
    #[serde(default = "default_fine_threshold_days")]
    pub threshold_days: i64,
    /// Fine as a percentage of the absolute negative balance.
    #[serde(default = "default_fine_percentage")]
    pub percentage: i64,
    /// Fines are rounded down to a multiple of this many minor units.
    #[serde(default = "default_fine_rounding")]
    pub rounding: i64,
    /// Upper bound for one fine, in minor units.
    #[serde(default = "default_fine_cap")]
    pub cap: i64,
    /// Unpaid fines after which a user becomes a write-off candidate.
    #[serde(default = "default_write_off_candidate_fines")]
    pub write_off_candidate_fines: u32,
}

fn default_fine_threshold_days() -> i64 {
    30
}

fn default_fine_percentage() -> i64 {
    20
}

fn default_fine_rounding() -> i64 {
    10
}

fn default_fine_cap() -> i64 {
    500
}

fn default_write_off_candidate_fines() -> u32 {
    5
}

impl Default for FineConfig {
    fn default() -> Self {
        Self {
            threshold_days: default_fine_threshold_days(),
            percentage: default_fine_percentage(),
            rounding: default_fine_rounding(),
            cap: default_fine_cap(),
            write_off_candidate_fines: default_write_off_candidate_fines(),
        }
    }
}

impl FineConfig {
    /// How long a balance must stay negative before a fine is due.
    #[must_use]
    pub fn threshold(&self) -> TimeDelta {
        TimeDelta::days(self.threshold_days)
    }
}

/// Inactivity cost engine policy.
#[derive(Debug, Clone, Deserialize)]
pub struct InactivityConfig {
    /// Days without ledger activity before the cost is charged.
    #[serde(default = "default_inactivity_threshold_days")]
    pub threshold_days: i64,
    /// Administrative cost in minor units.
    #[serde(default = "default_inactivity_cost")]
    pub cost: i64,
}

fn default_inactivity_threshold_days() -> i64 {
    3 * 365
}

fn default_inactivity_cost() -> i64 {
    1000
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            threshold_days: default_inactivity_threshold_days(),
            cost: default_inactivity_cost(),
        }
    }
}

impl InactivityConfig {
    /// How long a user must be inactive before the cost is charged.
    #[must_use]
    pub fn threshold(&self) -> TimeDelta {
        TimeDelta::days(self.threshold_days)
    }
}

impl AppConfig {
    /// Loads configuration from environment and config files.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(
                config::Environment::with_prefix("TABKEEPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the ledger cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`config::ConfigError::Message`] naming the offending key.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.ledger.precision > MAX_PRECISION {
            return Err(config::ConfigError::Message(format!(
                "ledger.precision must be at most {MAX_PRECISION}, got {}",
                self.ledger.precision
            )));
        }
        if self.ledger.max_attempts == 0 {
            return Err(config::ConfigError::Message(
                "ledger.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.fines.rounding <= 0 || self.fines.cap < 0 || self.fines.percentage < 0 {
            return Err(config::ConfigError::Message(
                "fines.rounding must be positive, fines.cap and fines.percentage non-negative"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_when_only_database_is_set() {
        temp_env::with_vars(
            [
                ("TABKEEPER__DATABASE__URL", Some("postgres://localhost/tabkeeper")),
                ("RUN_MODE", Some("test-defaults")),
            ],
            || {
                let config = AppConfig::load().unwrap();
                assert_eq!(config.database.url, "postgres://localhost/tabkeeper");
                assert_eq!(config.database.max_connections, 10);
                assert_eq!(config.ledger.currency, Currency::Eur);
                assert_eq!(config.ledger.precision, 2);
                assert_eq!(config.ledger.max_attempts, 3);
                assert_eq!(config.fines.percentage, 20);
                assert_eq!(config.fines.cap, 500);
                assert_eq!(config.inactivity.threshold_days, 1095);
            },
        );
    }

    #[test]
    fn test_environment_overrides_policy() {
        temp_env::with_vars(
            [
                ("TABKEEPER__DATABASE__URL", Some("postgres://localhost/tabkeeper")),
                ("TABKEEPER__FINES__THRESHOLD_DAYS", Some("7")),
                ("TABKEEPER__INACTIVITY__COST", Some("250")),
                ("RUN_MODE", Some("test-overrides")),
            ],
            || {
                let config = AppConfig::load().unwrap();
                assert_eq!(config.fines.threshold_days, 7);
                assert_eq!(config.fines.threshold(), TimeDelta::days(7));
                assert_eq!(config.inactivity.cost, 250);
            },
        );
    }

    #[test]
    fn test_precision_out_of_range_is_rejected() {
        temp_env::with_vars(
            [
                ("TABKEEPER__DATABASE__URL", Some("postgres://localhost/tabkeeper")),
                ("TABKEEPER__LEDGER__PRECISION", Some("29")),
                ("RUN_MODE", Some("test-precision")),
            ],
            || {
                let err = AppConfig::load().unwrap_err();
                assert!(err.to_string().contains("ledger.precision"));
            },
        );
    }

    #[test]
    fn test_ledger_money_helpers() {
        let ledger = LedgerConfig::default();
        assert_eq!(ledger.money(1300), Money::new(1300, Currency::Eur, 2));
        assert!(ledger.zero().is_zero());
    }
}
