//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! API keys are referenced by env-var name in the config and resolved at
//! startup into [`Credentials`], whose secret half never reaches a log line.
//! Decimal settings are written as strings so they parse exactly.

use std::fmt;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;

use crate::types::{ConfirmPolicy, CycleConfig, OrderType, RetryPolicy};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub bot: BotConfig,
    #[serde(default)]
    pub confirm: ConfirmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default = "ExchangeKeysConfig::bybit")]
    pub bybit: ExchangeKeysConfig,
    #[serde(default = "ExchangeKeysConfig::binance")]
    pub binance: ExchangeKeysConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    /// `bybit` or `binance`.
    pub exchange: String,
    pub symbol: String,
    /// Bybit product category (`linear`).
    #[serde(default = "default_category")]
    pub category: String,
    /// Bybit wallet account type (`UNIFIED` or `CONTRACT`).
    #[serde(default = "default_account_type")]
    pub account_type: String,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Base-asset quantity per leg, e.g. `"0.001"`.
    pub order_qty: String,
    #[serde(default = "default_order_type")]
    pub order_type: String,
    pub interval_sec: u64,
    #[serde(default = "default_recv_window")]
    pub recv_window: u64,
    pub fill_delay_ms: u64,
    /// Volume budget in quote currency. `"0"` runs without a cap.
    pub max_volume_usdt: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_true")]
    pub check_balance: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfirmConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub max_polls: u32,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            timeout_ms: 10_000,
            max_polls: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SafetyConfig {
    /// Consecutive failed cycles before halting. `0` disables the breaker.
    pub max_consecutive_failures: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
        }
    }
}

/// Names of the env vars holding one exchange's API key pair.
#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeKeysConfig {
    pub api_key_env: String,
    pub api_secret_env: String,
}

impl ExchangeKeysConfig {
    fn bybit() -> Self {
        Self {
            api_key_env: "BYBIT_API_KEY".to_string(),
            api_secret_env: "BYBIT_API_SECRET".to_string(),
        }
    }

    fn binance() -> Self {
        Self {
            api_key_env: "BINANCE_API_KEY".to_string(),
            api_secret_env: "BINANCE_API_SECRET".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Optional log file, appended to.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

fn default_category() -> String {
    "linear".to_string()
}

fn default_account_type() -> String {
    "UNIFIED".to_string()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_order_type() -> String {
    "market".to_string()
}

fn default_recv_window() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Exchange selection and credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Bybit,
    Binance,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Bybit => write!(f, "bybit"),
            ExchangeKind::Binance => write!(f, "binance"),
        }
    }
}

/// API key pair for the selected exchange.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: SecretString,
}

impl Credentials {
    /// Empty key pair. Only public endpoints will succeed with it.
    pub fn anonymous() -> Self {
        Self {
            api_key: String::new(),
            api_secret: SecretString::new(String::new()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Keep the last four characters of a key for log lines.
fn mask(key: &str) -> String {
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{tail}")
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Invalid or missing configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Unknown exchange `{0}` (expected bybit or binance)")]
    UnknownExchange(String),

    #[error("Missing credential: environment variable {0} is not set")]
    MissingCredential(String),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse_decimal_field(field: &'static str, value: &str) -> Result<Decimal, ConfigError> {
    value
        .trim()
        .parse::<Decimal>()
        .map_err(|e| invalid(field, format!("{value:?} is not a decimal ({e})")))
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    pub fn exchange_kind(&self) -> Result<ExchangeKind, ConfigError> {
        match self.bot.exchange.trim().to_lowercase().as_str() {
            "bybit" => Ok(ExchangeKind::Bybit),
            "binance" => Ok(ExchangeKind::Binance),
            other => Err(ConfigError::UnknownExchange(other.to_string())),
        }
    }

    /// Env-var names for the selected exchange's key pair.
    pub fn keys(&self) -> Result<&ExchangeKeysConfig, ConfigError> {
        Ok(match self.exchange_kind()? {
            ExchangeKind::Bybit => &self.bybit,
            ExchangeKind::Binance => &self.binance,
        })
    }

    /// Resolve the selected exchange's API key pair from the environment.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let keys = self.keys()?;
        let resolve = |name: &str| {
            Self::resolve_env(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingCredential(name.to_string()))
        };
        Ok(Credentials {
            api_key: resolve(&keys.api_key_env)?,
            api_secret: SecretString::new(resolve(&keys.api_secret_env)?),
        })
    }

    /// Check every field the engine depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cycle_config().map(|_| ())
    }

    /// Build the immutable engine parameters for one run.
    pub fn cycle_config(&self) -> Result<CycleConfig, ConfigError> {
        self.exchange_kind()?;
        let bot = &self.bot;

        let symbol = bot.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(invalid("bot.symbol", "must not be empty"));
        }
        if bot.quote_asset.trim().is_empty() {
            return Err(invalid("bot.quote_asset", "must not be empty"));
        }

        let order_qty = parse_decimal_field("bot.order_qty", &bot.order_qty)?;
        if order_qty <= Decimal::ZERO {
            return Err(invalid("bot.order_qty", "must be greater than zero"));
        }

        let max_volume_usdt = parse_decimal_field("bot.max_volume_usdt", &bot.max_volume_usdt)?;
        if max_volume_usdt < Decimal::ZERO {
            return Err(invalid("bot.max_volume_usdt", "must not be negative"));
        }

        let order_type: OrderType = bot
            .order_type
            .parse()
            .map_err(|e: String| invalid("bot.order_type", e))?;

        if bot.recv_window == 0 {
            return Err(invalid("bot.recv_window", "must be greater than zero"));
        }
        if self.confirm.poll_interval_ms == 0 {
            return Err(invalid("confirm.poll_interval_ms", "must be greater than zero"));
        }
        if self.confirm.timeout_ms == 0 {
            return Err(invalid("confirm.timeout_ms", "must be greater than zero"));
        }
        if self.confirm.max_polls == 0 {
            return Err(invalid("confirm.max_polls", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms", "must be >= retry.base_delay_ms"));
        }

        Ok(CycleConfig {
            symbol,
            order_qty,
            order_type,
            interval: Duration::from_secs(bot.interval_sec),
            fill_delay: Duration::from_millis(bot.fill_delay_ms),
            max_volume_usdt,
            dry_run: bot.dry_run,
            quote_asset: bot.quote_asset.trim().to_uppercase(),
            check_balance: bot.check_balance,
            confirm: ConfirmPolicy {
                poll_interval: Duration::from_millis(self.confirm.poll_interval_ms),
                timeout: Duration::from_millis(self.confirm.timeout_ms),
                max_polls: self.confirm.max_polls,
            },
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            max_consecutive_failures: self.safety.max_consecutive_failures,
        })
    }
}
