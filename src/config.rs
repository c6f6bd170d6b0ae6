//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section falls back to the engine defaults, so a minimal file only needs
//! the values that differ. Secrets (API keys, bot tokens) are referenced by
//! env-var name in the config and resolved at runtime.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub broker: BrokerConfig,
    pub instrument: InstrumentConfig,
    pub signal: SignalConfig,
    pub strategy: StrategyConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
    pub market_data: MarketDataConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    /// IANA zone of the venue's trading day.
    pub time_zone: String,
    /// Contracts per leg.
    pub unit_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "THETA-001".to_string(),
            time_zone: "US/Eastern".to_string(),
            unit_size: 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    /// Only "paper" ships with the crate.
    pub mode: String,
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    /// Chain fixture served by the paper broker.
    pub paper_chain_path: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: "paper".to_string(),
            host: "127.0.0.1".to_string(),
            port: 4002,
            client_id: 0,
            paper_chain_path: "fixtures/paper_chain.json".to_string(),
        }
    }
}

/// The traded underlying and its option class.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub exchange: String,
    pub primary_exchange: String,
    pub currency: String,
    pub trading_class: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: "SPX".to_string(),
            exchange: "SMART".to_string(),
            primary_exchange: "CBOE".to_string(),
            currency: "USD".to_string(),
            trading_class: "SPXW".to_string(),
        }
    }
}

/// Market-data tickers feeding the regime and expected-move computations.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignalConfig {
    /// Volatility proxy (1-day VIX).
    pub vol_ticker: String,
    /// Trend proxy.
    pub trend_ticker: String,
    /// Spot of the traded index.
    pub spot_ticker: String,
    /// Calendar days of daily history requested for the moving averages.
    pub history_days: i64,
    /// Intraday anchor, "HH:MM" local.
    pub anchor_time: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            vol_ticker: "I:VIX1D".to_string(),
            trend_ticker: "SPY".to_string(),
            spot_ticker: "I:SPX".to_string(),
            history_days: 180,
            anchor_time: "09:35".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StrategyConfig {
    /// Multiple of the expected move used as the short-strike distance.
    pub distance_factor: f64,
    /// Strike distance between the legs.
    pub spread_width: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            distance_factor: 0.5,
            spread_width: dec!(5),
        }
    }
}

/// Daily wall-clock triggers, "HH:MM" in `engine.time_zone`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    pub pre_open: String,
    pub entry: String,
    pub exit: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            pre_open: "09:00".to_string(),
            entry: "09:37".to_string(),
            exit: "17:00".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub connect_attempts: u32,
    pub connect_delay_secs: u64,
    pub chain_attempts: u32,
    pub chain_delay_secs: u64,
    pub resubmit_attempts: u32,
    pub market_data_attempts: u32,
    pub market_data_delay_secs: u64,
    pub ack_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            connect_delay_secs: 30,
            chain_attempts: 3,
            chain_delay_secs: 30,
            resubmit_attempts: 3,
            market_data_attempts: 3,
            market_data_delay_secs: 5,
            ack_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub api_key_env: String,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.polygon.io".to_string(),
            api_key_env: "POLYGON_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConfig {
    pub telegram_bot_token_env: Option<String>,
    pub telegram_chat_id_env: Option<String>,
    pub sink_timeout_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token_env: None,
            telegram_chat_id_env: None,
            sink_timeout_secs: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.strategy.spread_width <= Decimal::ZERO {
            anyhow::bail!("strategy.spread_width must be positive");
        }
        if !(self.strategy.distance_factor > 0.0) {
            anyhow::bail!("strategy.distance_factor must be positive");
        }
        if self.engine.unit_size == 0 {
            anyhow::bail!("engine.unit_size must be at least 1");
        }
        if self.retry.connect_attempts == 0
            || self.retry.chain_attempts == 0
            || self.retry.market_data_attempts == 0
        {
            anyhow::bail!("retry attempt counts must be at least 1");
        }

        self.time_zone()?;
        let anchor = self.anchor_time()?;
        let (pre_open, entry, exit) = self.trigger_times()?;
        if !(pre_open < entry && entry < exit) {
            anyhow::bail!("schedule must satisfy pre_open < entry < exit");
        }
        // Entry samples prices at the anchor, so the anchor bar must exist by then.
        if anchor >= entry {
            anyhow::bail!(
                "signal.anchor_time ({}) must be earlier than schedule.entry ({})",
                self.signal.anchor_time,
                self.schedule.entry
            );
        }
        Ok(())
    }

    /// The venue's trading time zone.
    pub fn time_zone(&self) -> Result<Tz> {
        self.engine
            .time_zone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Unknown time zone {}: {e}", self.engine.time_zone))
    }

    pub fn anchor_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.signal.anchor_time)
    }

    /// Pre-open, entry and exit trigger times.
    pub fn trigger_times(&self) -> Result<(NaiveTime, NaiveTime, NaiveTime)> {
        Ok((
            parse_hhmm(&self.schedule.pre_open)?,
            parse_hhmm(&self.schedule.entry)?,
            parse_hhmm(&self.schedule.exit)?,
        ))
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Resolve a secret by env-var name.
    pub fn resolve_secret(env_name: &str) -> Result<SecretString> {
        Self::resolve_env(env_name).map(SecretString::new)
    }
}

impl RetryConfig {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_secs(self.connect_delay_secs)
    }

    pub fn chain_delay(&self) -> Duration {
        Duration::from_secs(self.chain_delay_secs)
    }

    pub fn market_data_delay(&self) -> Duration {
        Duration::from_secs(self.market_data_delay_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

impl MonitorConfig {
    /// Mark interval, never shorter than a second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .with_context(|| format!("Expected HH:MM time, got {value:?}"))
}
