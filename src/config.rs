use bigdecimal::BigDecimal;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::address;
use crate::conversion::{is_positive, parse_amount};
use crate::oracle::StaticRateOracle;
use crate::poller::PollerSettings;
use crate::retry::RetryConfig;
use crate::settlement::EngineSettings;
use crate::types::{Asset, ZEC_DECIMALS};

/// Main configuration for the operator
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub zcash: ZcashConfig,
    pub operator: OperatorConfig,
    pub rates: RateConfig,
    pub api: ApiConfig,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// zcashd connection and send parameters
#[derive(Clone, Deserialize)]
pub struct ZcashConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    /// Shielded address funds are sent from
    pub from_address: String,
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,
    /// `z_sendmany` fee in ZEC, as a decimal string
    #[serde(default = "default_fee")]
    pub fee: String,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

/// Custom Debug that redacts the RPC password to prevent accidental log leakage.
impl fmt::Debug for ZcashConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZcashConfig")
            .field("rpc_url", &self.rpc_url)
            .field("rpc_user", &self.rpc_user)
            .field("rpc_password", &"<redacted>")
            .field("from_address", &self.from_address)
            .field("min_confirmations", &self.min_confirmations)
            .field("fee", &self.fee)
            .field("rpc_timeout_secs", &self.rpc_timeout_secs)
            .finish()
    }
}

/// Polling, reconciliation and retry tuning
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    #[serde(default = "default_not_found_grace")]
    pub not_found_grace_secs: u64,
    #[serde(default = "default_max_concurrent_polls")]
    pub max_concurrent_polls: usize,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_outcome_cache_size")]
    pub outcome_cache_size: usize,
    #[serde(default = "default_outcome_cache_ttl")]
    pub outcome_cache_ttl_secs: u64,
}

/// Static exchange rates, ZEC per unit of source asset. Unset means the
/// asset cannot be settled until a rate is configured.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateConfig {
    #[serde(default)]
    pub sol_zec: Option<BigDecimal>,
    #[serde(default)]
    pub usdc_zec: Option<BigDecimal>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Default functions
fn default_min_confirmations() -> u32 {
    1
}

fn default_fee() -> String {
    "0.0001".to_string()
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_wait() -> u64 {
    300
}

fn default_not_found_grace() -> u64 {
    30
}

fn default_max_concurrent_polls() -> usize {
    8
}

fn default_reconcile_interval() -> u64 {
    15_000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    500
}

fn default_outcome_cache_size() -> usize {
    10_000
}

fn default_outcome_cache_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9090
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn optional_rate(name: &str) -> Result<Option<BigDecimal>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => BigDecimal::from_str(raw.trim())
            .map(Some)
            .map_err(|e| eyre!("{} must be a decimal number: {}", name, e)),
        _ => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let zcash = ZcashConfig {
            rpc_url: required("ZCASH_RPC_URL")?,
            rpc_user: required("ZCASH_RPC_USER")?,
            rpc_password: required("ZCASH_RPC_PASSWORD")?,
            from_address: required("ZCASH_FROM_ADDRESS")?,
            min_confirmations: optional("ZCASH_MIN_CONFIRMATIONS", default_min_confirmations()),
            fee: env::var("ZCASH_FEE").unwrap_or_else(|_| default_fee()),
            rpc_timeout_secs: optional("ZCASH_RPC_TIMEOUT_SECS", default_rpc_timeout()),
        };

        let operator = OperatorConfig {
            poll_interval_ms: optional("POLL_INTERVAL_MS", default_poll_interval()),
            max_wait_secs: optional("MAX_WAIT_SECS", default_max_wait()),
            not_found_grace_secs: optional("NOT_FOUND_GRACE_SECS", default_not_found_grace()),
            max_concurrent_polls: optional(
                "MAX_CONCURRENT_POLLS",
                default_max_concurrent_polls(),
            ),
            reconcile_interval_ms: optional(
                "RECONCILE_INTERVAL_MS",
                default_reconcile_interval(),
            ),
            retry_attempts: optional("RETRY_ATTEMPTS", default_retry_attempts()),
            retry_delay_ms: optional("RETRY_DELAY_MS", default_retry_delay()),
            outcome_cache_size: optional("OUTCOME_CACHE_SIZE", default_outcome_cache_size()),
            outcome_cache_ttl_secs: optional(
                "OUTCOME_CACHE_TTL_SECS",
                default_outcome_cache_ttl(),
            ),
        };

        let rates = RateConfig {
            sol_zec: optional_rate("SOL_ZEC_RATE")?,
            usdc_zec: optional_rate("USDC_ZEC_RATE")?,
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| default_bind_address()),
            port: optional("API_PORT", default_api_port()),
        };

        let config = Config {
            database,
            zcash,
            operator,
            rates,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.zcash.rpc_url.is_empty() {
            return Err(eyre!("zcash.rpc_url cannot be empty"));
        }

        // Funds must never leave from a transparent address
        if !address::is_shielded(&self.zcash.from_address) {
            return Err(eyre!(
                "zcash.from_address must be a shielded address (z... or u1...)"
            ));
        }

        parse_amount(&self.zcash.fee, ZEC_DECIMALS)
            .map_err(|e| eyre!("zcash.fee is not a valid ZEC amount: {}", e))?;

        if self.zcash.rpc_timeout_secs == 0 {
            return Err(eyre!("zcash.rpc_timeout_secs must be greater than 0"));
        }

        if self.operator.poll_interval_ms == 0 {
            return Err(eyre!("operator.poll_interval_ms must be greater than 0"));
        }

        if self.operator.max_wait_secs == 0 {
            return Err(eyre!("operator.max_wait_secs must be greater than 0"));
        }

        if self.operator.reconcile_interval_ms == 0 {
            return Err(eyre!("operator.reconcile_interval_ms must be greater than 0"));
        }

        if self.operator.max_concurrent_polls == 0 {
            return Err(eyre!("operator.max_concurrent_polls must be greater than 0"));
        }

        if self.operator.retry_attempts == 0 {
            return Err(eyre!("operator.retry_attempts must be at least 1"));
        }

        for (pair, rate) in [
            ("SOL/ZEC", &self.rates.sol_zec),
            ("USDC/ZEC", &self.rates.usdc_zec),
        ] {
            if let Some(rate) = rate {
                if !is_positive(rate) {
                    return Err(eyre!("{} rate must be positive, got {}", pair, rate));
                }
            }
        }

        Ok(())
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.operator.retry_attempts,
            initial_backoff: Duration::from_millis(self.operator.retry_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            poll_interval: Duration::from_millis(self.operator.poll_interval_ms),
            max_wait: Duration::from_secs(self.operator.max_wait_secs),
            not_found_grace: Duration::from_secs(self.operator.not_found_grace_secs),
            retry: self.retry(),
            outcome_cache_size: self.operator.outcome_cache_size,
            outcome_cache_ttl: Duration::from_secs(self.operator.outcome_cache_ttl_secs),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            from_address: self.zcash.from_address.clone(),
            min_confirmations: self.zcash.min_confirmations,
            fee: self.zcash.fee.clone(),
            max_concurrent_polls: self.operator.max_concurrent_polls,
            reconcile_interval: Duration::from_millis(self.operator.reconcile_interval_ms),
        }
    }

    pub fn oracle(&self) -> StaticRateOracle {
        let mut oracle = StaticRateOracle::new();
        oracle.set_rate(Asset::Sol, self.rates.sol_zec.clone());
        oracle.set_rate(Asset::Usdc, self.rates.usdc_zec.clone());
        oracle
    }
}
