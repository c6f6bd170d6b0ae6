//! Market-data provider abstraction.
//!
//! Historical bars feed the regime classifier, intraday bars feed the
//! expected-move anchor, and quotes feed spread monitoring. The engine only
//! sees the `MarketDataProvider` trait; `polygon` is the REST implementation.

pub mod polygon;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{DailyBar, IntradayBar, OptionRight};

/// Intraday bar size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Minute,
    Hour,
}

impl Granularity {
    pub fn as_timespan(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
        }
    }
}

/// Reference data for one listed option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionReference {
    pub ticker: String,
    pub underlying: String,
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiration: NaiveDate,
}

/// Median bid/ask over a time range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteMedian {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl QuoteMedian {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / dec!(2)
    }
}

/// Latest quote mid and when it was printed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatestQuote {
    pub timestamp: DateTime<Utc>,
    pub mid: Decimal,
}

/// Market-data ticker of an option, e.g. `O:SPXW240517P05200000`, from its
/// broker local symbol.
pub fn option_ticker(local_symbol: &str) -> String {
    let compact: String = local_symbol.split_whitespace().collect();
    format!("O:{compact}")
}

/// Source of historical and live market data.
///
/// Every call may fail with a transient network error; callers bound their
/// own retries.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Daily bars between two dates, inclusive, oldest first.
    async fn get_daily_bars(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>>;

    /// Intraday bars for one session, oldest first.
    async fn get_intraday_bars(
        &self,
        ticker: &str,
        date: NaiveDate,
        granularity: Granularity,
    ) -> Result<Vec<IntradayBar>>;

    /// Option contracts listed as of a date for one expiration.
    async fn get_option_contracts_as_of(
        &self,
        underlying: &str,
        right: OptionRight,
        as_of: NaiveDate,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionReference>>;

    /// Median bid and ask over `[from, to)`.
    async fn get_quote_median(
        &self,
        ticker: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<QuoteMedian>;

    async fn get_latest_quote(&self, ticker: &str) -> Result<LatestQuote>;
}
