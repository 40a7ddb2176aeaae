use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    /// Exchanges orders may be routed to
    #[serde(default)]
    pub exchanges: Vec<ExchangeEntry>,
    #[serde(default)]
    pub balance_gate: BalanceGateConfig,
    #[serde(default)]
    pub funding: FundingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// One configured exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeEntry {
    /// Name allocations and orders reference (e.g. "binance")
    pub name: String,
    /// Reserve/quote asset orders are denominated in (e.g. "EUR")
    pub quote_asset_ticker: String,
    /// Starting reserve balance for the paper exchange in dry-run mode
    #[serde(default)]
    pub paper_balance: Decimal,
}

/// Balance admission gate thresholds.
///
/// The buffer percentages and decision TTLs are policy, not code: operators
/// tune them per deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceGateConfig {
    /// Safety buffer applied on top of the required amount when requesting
    /// funds to cover a shortfall (e.g. 0.05 = 5%)
    #[serde(default = "default_safety_buffer_pct")]
    pub safety_buffer_pct: Decimal,
    /// Factor above the required amount under which the balance is treated
    /// as "sufficient but low" (e.g. 1.2)
    #[serde(default = "default_low_balance_factor")]
    pub low_balance_factor: Decimal,
    /// TTL for cached positive admission decisions (seconds)
    #[serde(default = "default_granted_ttl_secs")]
    pub granted_ttl_secs: u64,
    /// TTL for cached negative admission decisions (seconds)
    #[serde(default = "default_insufficient_ttl_secs")]
    pub insufficient_ttl_secs: u64,
    /// TTL for cached exchange balance reads (seconds)
    #[serde(default = "default_balance_ttl_secs")]
    pub balance_ttl_secs: u64,
}

fn default_safety_buffer_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_low_balance_factor() -> Decimal {
    Decimal::new(12, 1) // 1.2
}

fn default_granted_ttl_secs() -> u64 {
    60
}

fn default_insufficient_ttl_secs() -> u64 {
    30
}

fn default_balance_ttl_secs() -> u64 {
    60
}

impl Default for BalanceGateConfig {
    fn default() -> Self {
        Self {
            safety_buffer_pct: default_safety_buffer_pct(),
            low_balance_factor: default_low_balance_factor(),
            granted_ttl_secs: default_granted_ttl_secs(),
            insufficient_ttl_secs: default_insufficient_ttl_secs(),
            balance_ttl_secs: default_balance_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundingConfig {
    /// Cooldown window for deduplicating funding requests (seconds)
    #[serde(default = "default_funding_dedup_secs")]
    pub dedup_window_secs: u64,
    /// Capacity of the funding work queue
    #[serde(default = "default_funding_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_funding_dedup_secs() -> u64 {
    900 // 15 minutes
}

fn default_funding_queue_capacity() -> usize {
    256
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_funding_dedup_secs(),
            queue_capacity: default_funding_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// TTL for stored idempotency results (seconds)
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    /// TTL for cached min-notional lookups (seconds)
    #[serde(default = "default_min_notional_ttl_secs")]
    pub min_notional_ttl_secs: u64,
    /// Batch size when draining unprocessed payment events
    #[serde(default = "default_event_batch_size")]
    pub event_batch_size: i64,
    /// Poll interval for the event drain loop (seconds)
    #[serde(default = "default_event_poll_secs")]
    pub event_poll_secs: u64,
}

fn default_idempotency_ttl_secs() -> u64 {
    86_400
}

fn default_min_notional_ttl_secs() -> u64 {
    3_600
}

fn default_event_batch_size() -> i64 {
    20
}

fn default_event_poll_secs() -> u64 {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            min_notional_ttl_secs: default_min_notional_ttl_secs(),
            event_batch_size: default_event_batch_size(),
            event_poll_secs: default_event_poll_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Interval between reconciliation cycles (seconds)
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Maximum retries before an order is terminally failed
    #[serde(default = "default_max_order_retries")]
    pub max_order_retries: u32,
    /// Maximum orders refreshed per cycle
    #[serde(default = "default_max_orders_per_cycle")]
    pub max_orders_per_cycle: usize,
    /// Age after which a Pending order with no exchange id is treated as a
    /// failed submission (seconds)
    #[serde(default = "default_orphan_threshold_secs")]
    pub orphan_threshold_secs: u64,
}

fn default_orphan_threshold_secs() -> u64 {
    300
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_max_order_retries() -> u32 {
    3
}

fn default_max_orders_per_cycle() -> usize {
    50
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            max_order_retries: default_max_order_retries(),
            max_orders_per_cycle: default_max_orders_per_cycle(),
            orphan_threshold_secs: default_orphan_threshold_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DryRunConfig {
    /// Enable dry run mode (in-memory stores, no real orders)
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("COINVEST_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (COINVEST_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("COINVEST")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.balance_gate.safety_buffer_pct < Decimal::ZERO
            || self.balance_gate.safety_buffer_pct >= Decimal::ONE
        {
            errors.push("balance_gate.safety_buffer_pct must be in [0, 1)".to_string());
        }

        if self.balance_gate.low_balance_factor <= Decimal::ONE {
            errors.push("balance_gate.low_balance_factor must be greater than 1".to_string());
        }

        if self.funding.queue_capacity == 0 {
            errors.push("funding.queue_capacity must be positive".to_string());
        }

        if self.reconciliation.max_orders_per_cycle == 0 {
            errors.push("reconciliation.max_orders_per_cycle must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> AppConfig {
        AppConfig {
            database: DatabaseConfig {
                url: "postgres://localhost/coinvest".to_string(),
                max_connections: 5,
            },
            exchanges: Vec::new(),
            balance_gate: BalanceGateConfig::default(),
            funding: FundingConfig::default(),
            pipeline: PipelineConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            dry_run: DryRunConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn default_thresholds_match_policy() {
        let config = base_config();
        assert_eq!(config.balance_gate.safety_buffer_pct, dec!(0.05));
        assert_eq!(config.balance_gate.low_balance_factor, dec!(1.2));
        assert_eq!(config.funding.dedup_window_secs, 900);
        assert_eq!(config.reconciliation.max_order_retries, 3);
    }

    #[test]
    fn validate_rejects_bad_buffer() {
        let mut config = base_config();
        config.balance_gate.safety_buffer_pct = dec!(1.5);
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("safety_buffer_pct")));
    }

    #[test]
    fn validate_rejects_low_balance_factor_below_one() {
        let mut config = base_config();
        config.balance_gate.low_balance_factor = dec!(0.9);
        assert!(config.validate().is_err());
    }
}
