use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tensorgrid_common::error::ConfigurationError;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub directory: DirectoryConfig,
    pub scheduler: SchedulerConfig,
    pub billing: BillingConfig,
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub environment: String,
    pub log_level: String,
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub call_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Redelivery window for unacked submissions.
    pub ack_wait_seconds: u64,
    pub fetch_batch_size: i64,
    pub fetch_interval_ms: u64,
    pub dispatch_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub registry_url: String,
    pub query_timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    /// Attempts after which a failing job stops being retried.
    pub retry_ceiling: u32,
    pub registry_error_delay_seconds: u64,
    pub no_provider_delay_seconds: u64,
    pub store_error_delay_seconds: u64,
    pub watchdog_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub minimum_balance: Decimal,
    pub low_balance_threshold: Decimal,
    /// Re-lock cadence, not the sample interval.
    pub billing_interval_seconds: u64,
    pub insufficient_funds_grace_seconds: u64,
    /// Accrued-to-locked ratio (percent) at which another hour is locked.
    pub relock_threshold_percent: Decimal,
    pub max_transaction_amount: Decimal,
    pub daily_withdrawal_limit: Decimal,
    pub minimum_payout_amount: Decimal,
    pub payout_fee_percent: Decimal,
    pub settlement_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// GPU model -> base hourly rate.
    pub base_rates: HashMap<String, Decimal>,
    pub vram_rate_per_gb: Decimal,
    pub power_rate_per_kw: Decimal,
    pub platform_fee_percent: Decimal,
    pub quote_validity_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "tensorgrid-broker".to_string(),
                environment: "development".to_string(),
                log_level: "info".to_string(),
                service_id: Uuid::new_v4().to_string(),
            },
            database: DatabaseConfig {
                path: "tensorgrid.db".to_string(),
                max_connections: 16,
                call_timeout_seconds: 10,
            },
            bus: BusConfig {
                ack_wait_seconds: 60,
                fetch_batch_size: 16,
                fetch_interval_ms: 250,
                dispatch_timeout_seconds: 5,
            },
            directory: DirectoryConfig {
                registry_url: "http://localhost:8500".to_string(),
                query_timeout_seconds: 5,
                cache_ttl_seconds: 30,
            },
            scheduler: SchedulerConfig {
                max_workers: 4,
                retry_ceiling: 5,
                registry_error_delay_seconds: 30,
                no_provider_delay_seconds: 60,
                store_error_delay_seconds: 10,
                watchdog_interval_seconds: 60,
            },
            billing: BillingConfig {
                minimum_balance: dec!(0.1),
                low_balance_threshold: dec!(1.0),
                billing_interval_seconds: 60,
                insufficient_funds_grace_seconds: 120,
                relock_threshold_percent: dec!(80),
                max_transaction_amount: dec!(100000),
                daily_withdrawal_limit: dec!(10000),
                minimum_payout_amount: dec!(0.5),
                payout_fee_percent: dec!(0),
                settlement_timeout_seconds: 30,
            },
            pricing: PricingConfig {
                base_rates: HashMap::from([
                    ("RTX 4090".to_string(), dec!(0.5)),
                    ("RTX 3090".to_string(), dec!(0.35)),
                    ("A100".to_string(), dec!(1.8)),
                    ("H100".to_string(), dec!(3.2)),
                ]),
                vram_rate_per_gb: dec!(0.02),
                power_rate_per_kw: dec!(1.0),
                platform_fee_percent: dec!(5),
                quote_validity_seconds: 300,
            },
        }
    }
}

impl BrokerConfig {
    pub fn load(path_override: Option<PathBuf>) -> Result<BrokerConfig, ConfigurationError> {
        let default_config = BrokerConfig::default();

        let mut figment = Figment::from(Serialized::defaults(default_config));

        if let Some(path) = path_override {
            if path.exists() {
                figment = figment.merge(Toml::file(&path));
            }
        } else {
            let default_path = PathBuf::from("broker.toml");
            if default_path.exists() {
                figment = figment.merge(Toml::file(default_path));
            }
        }

        figment = figment.merge(Env::prefixed("TENSORGRID_").split("__"));

        figment
            .extract()
            .map_err(|e| ConfigurationError::ParseError {
                details: e.to_string(),
            })
    }

    pub fn load_from_file(path: &Path) -> Result<BrokerConfig, ConfigurationError> {
        Self::load(Some(path.to_path_buf()))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.path.is_empty() {
            return Err(ConfigurationError::InvalidValue {
                key: "database.path".to_string(),
                value: String::new(),
                reason: "Database path cannot be empty".to_string(),
            });
        }

        if self.scheduler.max_workers == 0 {
            return Err(ConfigurationError::ValidationFailed {
                details: "scheduler.max_workers must be non-zero".to_string(),
            });
        }

        if self.bus.fetch_batch_size <= 0 {
            return Err(ConfigurationError::ValidationFailed {
                details: "bus.fetch_batch_size must be positive".to_string(),
            });
        }

        if self.pricing.base_rates.is_empty() {
            return Err(ConfigurationError::ValidationFailed {
                details: "pricing.base_rates must contain at least one GPU model".to_string(),
            });
        }

        if self.pricing.platform_fee_percent < Decimal::ZERO
            || self.pricing.platform_fee_percent > dec!(100)
        {
            return Err(ConfigurationError::ValidationFailed {
                details: format!(
                    "pricing.platform_fee_percent must be within 0..=100, got {}",
                    self.pricing.platform_fee_percent
                ),
            });
        }

        if self.billing.relock_threshold_percent <= Decimal::ZERO
            || self.billing.relock_threshold_percent > dec!(100)
        {
            return Err(ConfigurationError::ValidationFailed {
                details: "billing.relock_threshold_percent must be within (0, 100]".to_string(),
            });
        }

        if self.billing.minimum_balance < Decimal::ZERO {
            return Err(ConfigurationError::ValidationFailed {
                details: "billing.minimum_balance must not be negative".to_string(),
            });
        }

        if self.billing.max_transaction_amount <= Decimal::ZERO {
            return Err(ConfigurationError::ValidationFailed {
                details: "billing.max_transaction_amount must be positive".to_string(),
            });
        }

        if self.billing.daily_withdrawal_limit < Decimal::ZERO {
            return Err(ConfigurationError::ValidationFailed {
                details: "billing.daily_withdrawal_limit must not be negative".to_string(),
            });
        }

        Ok(())
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.service.environment == "production" && self.database.path.starts_with(":memory:") {
            warnings.push("In-memory database in production environment".to_string());
        }

        if self.billing.payout_fee_percent.is_zero() {
            warnings.push("Payout fee is zero - provider payouts carry no fee".to_string());
        }

        warnings
    }

    pub fn ack_wait(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.bus.ack_wait_seconds as i64)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.bus.fetch_interval_ms)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory.query_timeout_seconds)
    }

    pub fn directory_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.directory.cache_ttl_seconds)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.watchdog_interval_seconds)
    }

    pub fn registry_error_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.scheduler.registry_error_delay_seconds as i64)
    }

    pub fn no_provider_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.scheduler.no_provider_delay_seconds as i64)
    }

    pub fn store_error_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.scheduler.store_error_delay_seconds as i64)
    }

    pub fn insufficient_funds_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.billing.insufficient_funds_grace_seconds as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_validate() {
        let config = BrokerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.retry_ceiling, 5);
        assert_eq!(config.billing.relock_threshold_percent, dec!(80));
        assert_eq!(config.pricing.base_rates["RTX 4090"], dec!(0.5));
    }

    #[test]
    fn test_validation_rejects_empty_rate_table() {
        let mut config = BrokerConfig::default();
        config.pricing.base_rates.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_fee_above_hundred() {
        let mut config = BrokerConfig::default();
        config.pricing.platform_fee_percent = dec!(101);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = BrokerConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: BrokerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.billing.minimum_balance, config.billing.minimum_balance);
        assert_eq!(parsed.pricing.base_rates, config.pricing.base_rates);
    }
}
