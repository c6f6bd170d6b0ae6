//! Polygon.io REST market data.
//!
//! Endpoints used:
//! - `/v2/aggs/ticker/{ticker}/range/1/{timespan}/{from}/{to}` for daily and
//!   intraday bars
//! - `/v3/reference/options/contracts` for listed option contracts
//! - `/v3/quotes/{ticker}` for NBBO quotes
//!
//! Auth: `apiKey` query parameter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{Granularity, LatestQuote, MarketDataProvider, OptionReference, QuoteMedian};
use crate::types::{DailyBar, IntradayBar, OptionRight};

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AggsResponse {
    #[serde(default)]
    results: Vec<AggBar>,
}

#[derive(Debug, Deserialize)]
struct AggBar {
    /// Bar open, epoch milliseconds.
    t: i64,
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
}

#[derive(Debug, Deserialize)]
struct ContractsResponse {
    #[serde(default)]
    results: Vec<ContractRecord>,
}

#[derive(Debug, Deserialize)]
struct ContractRecord {
    ticker: String,
    underlying_ticker: String,
    contract_type: String,
    strike_price: Decimal,
    expiration_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    #[serde(default)]
    results: Vec<QuoteRecord>,
}

#[derive(Debug, Deserialize)]
struct QuoteRecord {
    /// Epoch nanoseconds.
    sip_timestamp: i64,
    bid_price: Decimal,
    ask_price: Decimal,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct PolygonClient {
    http: Client,
    base_url: String,
    api_key: SecretString,
}

impl PolygonClient {
    pub fn new(base_url: &str, api_key: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("THETA/0.1.0")
            .build()
            .context("Failed to build Polygon HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "Polygon request");

        let resp = self
            .http
            .get(&url)
            .query(query)
            .query(&[("apiKey", self.api_key.expose_secret().as_str())])
            .send()
            .await
            .with_context(|| format!("Polygon request failed: {path}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("Polygon API error for {path}: {status}");
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse Polygon response: {path}"))
    }

    async fn aggs(
        &self,
        ticker: &str,
        timespan: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AggBar>> {
        let path = format!(
            "/v2/aggs/ticker/{}/range/1/{timespan}/{from}/{to}",
            urlencoding::encode(ticker)
        );
        let resp: AggsResponse = self
            .get_json(
                &path,
                &[
                    ("adjusted", "true".to_string()),
                    ("sort", "asc".to_string()),
                    ("limit", "50000".to_string()),
                ],
            )
            .await?;
        Ok(resp.results)
    }

    async fn quotes(&self, ticker: &str, query: &[(&str, String)]) -> Result<Vec<QuoteRecord>> {
        let path = format!("/v3/quotes/{}", urlencoding::encode(ticker));
        let resp: QuotesResponse = self.get_json(&path, query).await?;
        Ok(resp.results)
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("Bad bar timestamp {ms}"))
}

fn daily_bars(raw: Vec<AggBar>) -> Result<Vec<DailyBar>> {
    raw.into_iter()
        .map(|b| {
            // Daily bars are stamped at midnight exchange time.
            let date = millis_to_utc(b.t)?.with_timezone(&New_York).date_naive();
            Ok(DailyBar {
                date,
                open: b.o,
                high: b.h,
                low: b.l,
                close: b.c,
            })
        })
        .collect()
}

fn intraday_bars(raw: Vec<AggBar>) -> Result<Vec<IntradayBar>> {
    raw.into_iter()
        .map(|b| {
            Ok(IntradayBar {
                timestamp: millis_to_utc(b.t)?,
                open: b.o,
                high: b.h,
                low: b.l,
                close: b.c,
            })
        })
        .collect()
}

fn median(mut values: Vec<Decimal>) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    values.sort();
    let n = values.len();
    Some(if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / dec!(2)
    })
}

fn quote_median(quotes: &[QuoteRecord]) -> Option<QuoteMedian> {
    Some(QuoteMedian {
        bid: median(quotes.iter().map(|q| q.bid_price).collect())?,
        ask: median(quotes.iter().map(|q| q.ask_price).collect())?,
    })
}

fn parse_right(contract_type: &str) -> Result<OptionRight> {
    contract_type.parse()
}

#[async_trait]
impl MarketDataProvider for PolygonClient {
    async fn get_daily_bars(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>> {
        daily_bars(self.aggs(ticker, "day", start, end).await?)
    }

    async fn get_intraday_bars(
        &self,
        ticker: &str,
        date: NaiveDate,
        granularity: Granularity,
    ) -> Result<Vec<IntradayBar>> {
        intraday_bars(self.aggs(ticker, granularity.as_timespan(), date, date).await?)
    }

    async fn get_option_contracts_as_of(
        &self,
        underlying: &str,
        right: OptionRight,
        as_of: NaiveDate,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionReference>> {
        let contract_type = match right {
            OptionRight::Call => "call",
            OptionRight::Put => "put",
        };
        let resp: ContractsResponse = self
            .get_json(
                "/v3/reference/options/contracts",
                &[
                    ("underlying_ticker", underlying.to_string()),
                    ("contract_type", contract_type.to_string()),
                    ("as_of", as_of.to_string()),
                    ("expiration_date", expiration.to_string()),
                    ("limit", "1000".to_string()),
                ],
            )
            .await?;

        resp.results
            .into_iter()
            .map(|r| {
                Ok(OptionReference {
                    right: parse_right(&r.contract_type)?,
                    ticker: r.ticker,
                    underlying: r.underlying_ticker,
                    strike: r.strike_price,
                    expiration: r.expiration_date,
                })
            })
            .collect()
    }

    async fn get_quote_median(
        &self,
        ticker: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<QuoteMedian> {
        let nanos = |t: DateTime<Utc>| t.timestamp_nanos_opt().unwrap_or_default().to_string();
        let quotes = self
            .quotes(
                ticker,
                &[
                    ("timestamp.gte", nanos(from)),
                    ("timestamp.lt", nanos(to)),
                    ("order", "asc".to_string()),
                    ("sort", "timestamp".to_string()),
                    ("limit", "5000".to_string()),
                ],
            )
            .await?;
        quote_median(&quotes)
            .with_context(|| format!("No {ticker} quotes between {from} and {to}"))
    }

    async fn get_latest_quote(&self, ticker: &str) -> Result<LatestQuote> {
        let quotes = self
            .quotes(
                ticker,
                &[
                    ("order", "desc".to_string()),
                    ("sort", "timestamp".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        let latest = quotes
            .first()
            .with_context(|| format!("No quotes for {ticker}"))?;
        Ok(LatestQuote {
            timestamp: Utc.timestamp_nanos(latest.sip_timestamp),
            mid: (latest.bid_price + latest.ask_price) / dec!(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daily_aggs() {
        let json = r#"{
            "ticker": "SPY",
            "resultsCount": 2,
            "results": [
                {"v": 1000, "o": 510.1, "c": 512.0, "h": 513.2, "l": 509.9, "t": 1715745600000},
                {"v": 1200, "o": 512.0, "c": 515.5, "h": 516.0, "l": 511.7, "t": 1715832000000}
            ]
        }"#;
        let resp: AggsResponse = serde_json::from_str(json).unwrap();
        let bars = daily_bars(resp.results).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 5, 15).unwrap());
        assert_eq!(bars[1].close, dec!(515.5));
    }

    #[test]
    fn test_empty_results_default() {
        let resp: AggsResponse = serde_json::from_str(r#"{"status": "OK"}"#).unwrap();
        assert!(resp.results.is_empty());
    }

    #[test]
    fn test_parse_contracts() {
        let json = r#"{"results": [{
            "ticker": "O:SPXW240517P04975000",
            "underlying_ticker": "SPX",
            "contract_type": "put",
            "strike_price": 4975,
            "expiration_date": "2024-05-17",
            "exercise_style": "european"
        }]}"#;
        let resp: ContractsResponse = serde_json::from_str(json).unwrap();
        let r = &resp.results[0];
        assert_eq!(parse_right(&r.contract_type).unwrap(), OptionRight::Put);
        assert_eq!(r.strike_price, dec!(4975));
    }

    #[test]
    fn test_quote_median_even_and_odd() {
        let q = |bid: Decimal, ask: Decimal| QuoteRecord {
            sip_timestamp: 0,
            bid_price: bid,
            ask_price: ask,
        };
        let odd = vec![
            q(dec!(1.0), dec!(1.2)),
            q(dec!(3.0), dec!(3.4)),
            q(dec!(2.0), dec!(2.2)),
        ];
        let m = quote_median(&odd).unwrap();
        assert_eq!(m.bid, dec!(2.0));
        assert_eq!(m.ask, dec!(2.2));

        let even = vec![q(dec!(1.0), dec!(1.2)), q(dec!(2.0), dec!(2.4))];
        let m = quote_median(&even).unwrap();
        assert_eq!(m.bid, dec!(1.5));
        assert_eq!(m.mid(), dec!(1.65));

        assert!(quote_median(&[]).is_none());
    }
}
