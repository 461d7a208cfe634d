//! Configuration management for the annotation market.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `DEV_MODE` - Optional. Trust `x-user-id` / `x-user-role` headers instead of JWTs. Defaults to `false`.
//! - `JWT_SECRET` - Required unless `DEV_MODE=true`. HS256 secret for bearer tokens.
//! - `STORE_TYPE` - Optional. `sqlite` or `memory`. Defaults to `sqlite`.
//! - `DATA_DIR` - Optional. Directory for the SQLite database. Defaults to `./data`.
//! - `USDC_NETWORK` - Optional. Payout network. Defaults to `base-sepolia`.
//! - `MAX_PAYMENT_USDC` - Optional. Largest single payout. Defaults to `10000`.
//! - `DEFAULT_TASK_PRICE_USDC` - Optional. Task price when a project has no budget. Defaults to `5.00`.
//! - `PLATFORM_FEE_RATE` - Optional. Fraction recorded as platform fee. Defaults to `0.10`.
//! - `SETTLEMENT_MAX_RETRIES` - Optional. Transfer attempts per settlement. Defaults to `3`.
//! - `TRANSFER_TIMEOUT_SECS` - Optional. Timeout for one transfer call. Defaults to `30`.
//! - `TRANSFER_GATEWAY_URL` - Optional. Payment gateway base URL. Dry-run transfers when unset.
//! - `TRANSFER_GATEWAY_TOKEN` - Optional. Bearer token for the payment gateway.
//! - `SOURCE_TIMEOUT_SECS` - Optional. Timeout for labeling-tool requests. Defaults to `30`.
//! - `RECONCILE_INTERVAL_SECS` - Optional. Reconciler period, `0` disables it. Defaults to `60`.
//! - `RECONCILE_AFTER_SECS` - Optional. Age before a pending settlement is reconciled. Defaults to `120`.

use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::market::MarketSettings;
use crate::money::Usdc;
use crate::settlement::SettlementPolicy;
use crate::store::StoreType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Payment gateway endpoint.
#[derive(Debug, Clone)]
pub struct TransferGateway {
    pub url: String,
    pub token: Option<String>,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Trust identity headers instead of verifying JWTs
    pub dev_mode: bool,

    /// HS256 secret for bearer tokens
    pub jwt_secret: Option<String>,

    pub store_type: StoreType,

    /// Directory holding `market.db`
    pub data_dir: PathBuf,

    /// Settlement policy and pricing defaults
    pub market: MarketSettings,

    /// `None` means transfers are simulated
    pub transfer_gateway: Option<TransferGateway>,

    pub source_timeout: Duration,

    /// Zero disables the background reconciler
    pub reconcile_interval: Duration,

    pub reconcile_after: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `JWT_SECRET` is not set outside
    /// dev mode, and `ConfigError::InvalidValue` for unparseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = var("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = parse_or(&var, "PORT", 3000u16)?;

        let dev_mode = match var("DEV_MODE") {
            Some(v) => parse_bool("DEV_MODE", &v)?,
            None => false,
        };
        let jwt_secret = var("JWT_SECRET");
        if !dev_mode && jwt_secret.is_none() {
            return Err(ConfigError::MissingEnvVar("JWT_SECRET".to_string()));
        }

        let store_type = var("STORE_TYPE")
            .map(|s| StoreType::from_str(&s))
            .unwrap_or_default();
        let data_dir = var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let max_amount: Usdc = parse_or(&var, "MAX_PAYMENT_USDC", Usdc::from_whole(10_000))?;
        if !max_amount.is_positive() {
            return Err(invalid("MAX_PAYMENT_USDC", "must be greater than zero"));
        }
        let default_task_price: Usdc = parse_or(&var, "DEFAULT_TASK_PRICE_USDC", Usdc::from_whole(5))?;
        if !default_task_price.is_positive() {
            return Err(invalid("DEFAULT_TASK_PRICE_USDC", "must be greater than zero"));
        }
        let fee_rate: Decimal = parse_or(&var, "PLATFORM_FEE_RATE", Decimal::new(10, 2))?;
        if fee_rate < Decimal::ZERO || fee_rate > Decimal::ONE {
            return Err(invalid("PLATFORM_FEE_RATE", "must be between 0 and 1"));
        }
        let max_attempts: u32 = parse_or(&var, "SETTLEMENT_MAX_RETRIES", 3)?;
        if max_attempts == 0 {
            return Err(invalid("SETTLEMENT_MAX_RETRIES", "must be at least 1"));
        }
        let transfer_timeout = Duration::from_secs(parse_or(&var, "TRANSFER_TIMEOUT_SECS", 30u64)?.max(1));

        let transfer_gateway = match var("TRANSFER_GATEWAY_URL") {
            Some(url) => {
                url::Url::parse(&url).map_err(|e| invalid("TRANSFER_GATEWAY_URL", e))?;
                Some(TransferGateway {
                    url,
                    token: var("TRANSFER_GATEWAY_TOKEN"),
                })
            }
            None => None,
        };

        let market = MarketSettings {
            settlement: SettlementPolicy {
                network: var("USDC_NETWORK").unwrap_or_else(|| "base-sepolia".to_string()),
                max_amount,
                fee_rate,
                max_attempts,
                transfer_timeout,
            },
            default_task_price,
        };

        Ok(Self {
            host,
            port,
            dev_mode,
            jwt_secret,
            store_type,
            data_dir,
            market,
            transfer_gateway,
            source_timeout: Duration::from_secs(parse_or(&var, "SOURCE_TIMEOUT_SECS", 30u64)?.max(1)),
            reconcile_interval: Duration::from_secs(parse_or(&var, "RECONCILE_INTERVAL_SECS", 60u64)?),
            reconcile_after: Duration::from_secs(parse_or(&var, "RECONCILE_AFTER_SECS", 120u64)?),
        })
    }

    /// Create a dev-mode config with in-memory storage (useful for testing).
    pub fn new_dev() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            dev_mode: true,
            jwt_secret: None,
            store_type: StoreType::Memory,
            data_dir: PathBuf::from("./data"),
            market: MarketSettings::default(),
            transfer_gateway: None,
            source_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::ZERO,
            reconcile_after: Duration::from_secs(120),
        }
    }
}

fn invalid(name: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue(name.to_string(), reason.to_string())
}

fn parse_or<T, F>(var: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw.parse().map_err(|e| invalid(name, e)),
        None => Ok(default),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        other => Err(invalid(name, format!("expected a boolean, got '{}'", other))),
    }
}
