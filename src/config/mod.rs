//! Configuration management.
//!
//! Loads settings from a config file and environment variables (prefix
//! `FH`, separator `__`). The kill switch is deliberately not part of this
//! struct: `EMERGENCY_STOP` is re-read from the environment every
//! supervisor tick so it can be engaged on a running process.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Exchange connection
    pub exchange: ExchangeConfig,
    /// Position sizing and limits
    pub trading: TradingConfig,
    /// Entry criteria
    pub scanner: ScannerConfig,
    /// Exit triggers
    pub exit: ExitConfig,
    /// Margin rebalancing thresholds
    pub margin: MarginConfig,
    /// Loop periods
    pub timing: TimingConfig,
    /// SQLite file holding the positions table
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Which venue to target (selects the gateway implementation)
    #[serde(default = "default_exchange_name")]
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Quote side of eligible pairs
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    /// Quote units committed per entry
    #[serde(default = "default_notional_per_entry")]
    pub notional_per_entry: Decimal,
    /// Hard cap on concurrently open positions
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Simulate fills instead of sending real orders
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Minimum predicted funding rate for the next interval
    #[serde(default = "default_min_funding_rate")]
    pub min_funding_rate: Decimal,
    /// Minimum 24h quote volume
    #[serde(default = "default_min_volume_24h")]
    pub min_volume_24h: Decimal,
    /// Minimum perp-over-spot premium
    #[serde(default = "default_min_spread")]
    pub min_spread: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// Funding rate at or below which a sample qualifies for exit
    #[serde(default = "default_exit_funding_rate")]
    pub exit_funding_rate: Decimal,
    /// Spread at or below which backwardation profit-take fires
    #[serde(default = "default_exit_spread")]
    pub exit_spread: Decimal,
    /// Consecutive qualifying samples required for the funding-rate exit
    #[serde(default = "default_negative_fr_debounce")]
    pub negative_fr_debounce: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarginConfig {
    /// Margin usage that triggers rebalancing
    #[serde(default = "default_margin_usage_high")]
    pub margin_usage_high: Decimal,
    /// Margin usage a rebalance aims for
    #[serde(default = "default_margin_usage_target")]
    pub margin_usage_target: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_scanner_period_s")]
    pub scanner_period_s: u64,
    #[serde(default = "default_guardian_period_s")]
    pub guardian_period_s: u64,
    #[serde(default = "default_supervisor_period_s")]
    pub supervisor_period_s: u64,
}

fn default_exchange_name() -> String {
    "binance".to_string()
}

fn default_quote_currency() -> String {
    "USDT".to_string()
}

fn default_notional_per_entry() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_max_open_positions() -> usize {
    3
}

fn default_dry_run() -> bool {
    true
}

fn default_min_funding_rate() -> Decimal {
    Decimal::new(3, 4) // 0.0003 (0.03% per 8h)
}

fn default_min_volume_24h() -> Decimal {
    Decimal::new(10_000_000, 0)
}

fn default_min_spread() -> Decimal {
    Decimal::new(2, 3) // 0.002
}

fn default_exit_funding_rate() -> Decimal {
    Decimal::new(5, 5) // 0.00005
}

fn default_exit_spread() -> Decimal {
    Decimal::new(-1, 2) // -0.01
}

fn default_negative_fr_debounce() -> u32 {
    3
}

fn default_margin_usage_high() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_margin_usage_target() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_scanner_period_s() -> u64 {
    60
}

fn default_guardian_period_s() -> u64 {
    10
}

fn default_supervisor_period_s() -> u64 {
    5
}

fn default_database_path() -> String {
    "harvester.db".to_string()
}

impl Config {
    /// Load configuration from `config.*` and `FH__`-prefixed environment
    /// variables, `.env` included.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("FH"))
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values before any component sees them.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.scanner.min_funding_rate > Decimal::ZERO,
            "min_funding_rate must be positive"
        );
        anyhow::ensure!(
            self.scanner.min_spread > Decimal::ZERO,
            "min_spread must be positive (entries require contango)"
        );
        anyhow::ensure!(
            self.exit.exit_spread < Decimal::ZERO,
            "exit_spread must be negative (backwardation)"
        );
        anyhow::ensure!(
            self.exit.negative_fr_debounce >= 1,
            "negative_fr_debounce must be at least 1"
        );
        anyhow::ensure!(
            self.trading.max_open_positions >= 1,
            "max_open_positions must be at least 1"
        );
        anyhow::ensure!(
            self.trading.notional_per_entry > Decimal::ZERO,
            "notional_per_entry must be positive"
        );
        anyhow::ensure!(
            self.margin.margin_usage_target > Decimal::ZERO
                && self.margin.margin_usage_target < self.margin.margin_usage_high
                && self.margin.margin_usage_high < Decimal::ONE,
            "margin thresholds must satisfy 0 < target < high < 1"
        );
        anyhow::ensure!(
            self.timing.scanner_period_s > 0
                && self.timing.guardian_period_s > 0
                && self.timing.supervisor_period_s > 0,
            "loop periods must be positive"
        );
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig {
                name: default_exchange_name(),
                api_key: String::new(),
                api_secret: String::new(),
                testnet: true,
            },
            trading: TradingConfig {
                quote_currency: default_quote_currency(),
                notional_per_entry: default_notional_per_entry(),
                max_open_positions: default_max_open_positions(),
                dry_run: default_dry_run(),
            },
            scanner: ScannerConfig {
                min_funding_rate: default_min_funding_rate(),
                min_volume_24h: default_min_volume_24h(),
                min_spread: default_min_spread(),
            },
            exit: ExitConfig {
                exit_funding_rate: default_exit_funding_rate(),
                exit_spread: default_exit_spread(),
                negative_fr_debounce: default_negative_fr_debounce(),
            },
            margin: MarginConfig {
                margin_usage_high: default_margin_usage_high(),
                margin_usage_target: default_margin_usage_target(),
            },
            timing: TimingConfig {
                scanner_period_s: default_scanner_period_s(),
                guardian_period_s: default_guardian_period_s(),
                supervisor_period_s: default_supervisor_period_s(),
            },
            database_path: default_database_path(),
        }
    }
}

/// Whether the kill switch is engaged via the environment. Re-read every
/// supervisor tick, not cached.
pub fn emergency_stop_engaged() -> bool {
    std::env::var("EMERGENCY_STOP")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
