//! Shared fixtures for session-level tests.
//!
//! Sessions run against the in-memory `PaperBroker`, a mockall
//! `MockMarketData` and a `RecordingSink` that keeps every alert. Retry
//! delays are zero so failure paths run instantly.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use mockall::mock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};

use theta::alerts::{AlertLevel, AlertSink, Alerts};
use theta::broker::calendar::regular_session;
use theta::broker::paper::{ChainFixture, FixtureQuote, PaperBroker};
use theta::broker::ModelGreeks;
use theta::config::AppConfig;
use theta::engine::EngineRuntime;
use theta::market_data::{
    Granularity, LatestQuote, MarketDataProvider, OptionReference, QuoteMedian,
};
use theta::types::{format_local_symbol, DailyBar, IntradayBar, OptionRight};

mock! {
    pub MarketData {}

    #[async_trait]
    impl MarketDataProvider for MarketData {
        async fn get_daily_bars(
            &self,
            ticker: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<Vec<DailyBar>>;

        async fn get_intraday_bars(
            &self,
            ticker: &str,
            date: NaiveDate,
            granularity: Granularity,
        ) -> Result<Vec<IntradayBar>>;

        async fn get_option_contracts_as_of(
            &self,
            underlying: &str,
            right: OptionRight,
            as_of: NaiveDate,
            expiration: NaiveDate,
        ) -> Result<Vec<OptionReference>>;

        async fn get_quote_median(
            &self,
            ticker: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<QuoteMedian>;

        async fn get_latest_quote(&self, ticker: &str) -> Result<LatestQuote>;
    }
}

/// Friday 2024-05-17, a regular 0DTE session.
pub fn session_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.retry.connect_attempts = 3;
    cfg.retry.connect_delay_secs = 0;
    cfg.retry.chain_delay_secs = 0;
    cfg.retry.market_data_delay_secs = 0;
    cfg.retry.ack_timeout_secs = 5;
    cfg
}

pub fn symbol(right: OptionRight, strike: Decimal) -> String {
    format_local_symbol("SPXW", session_date(), right, strike)
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Puts and calls from 4950 to 5050 around a 5000 spot. Put bids rise by
/// 0.50 per 5 points of strike, call bids fall by the same; asks are 0.20
/// wide.
pub fn chain_fixture() -> ChainFixture {
    let mut quotes = Vec::new();
    for step in 0..=20 {
        let strike = dec!(4950) + Decimal::from(step * 5);
        for right in [OptionRight::Put, OptionRight::Call] {
            let bid = match right {
                OptionRight::Put => (strike - dec!(4940)) / dec!(10),
                OptionRight::Call => (dec!(5060) - strike) / dec!(10),
            };
            quotes.push(FixtureQuote {
                strike,
                right,
                bid,
                ask: bid + dec!(0.20),
                bid_size: dec!(25),
                ask_size: dec!(25),
                volume: dec!(500),
                greeks: Some(ModelGreeks {
                    implied_vol: 0.12,
                    delta: if right == OptionRight::Put { -0.15 } else { 0.15 },
                    gamma: 0.01,
                    vega: 0.3,
                    theta: -1.2,
                    underlying_price: Some(5000.0),
                }),
            });
        }
    }

    ChainFixture {
        underlying: "SPX".into(),
        trading_class: "SPXW".into(),
        exchange: "CBOE".into(),
        currency: "USD".into(),
        spot: dec!(5000),
        quotes,
    }
}

pub fn paper_broker() -> Arc<PaperBroker> {
    let date = session_date();
    Arc::new(PaperBroker::from_fixture(chain_fixture(), date, regular_session(date)))
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Ninety daily bars ending the day before the session, moving by `step`
/// per bar.
pub fn daily_series(last_close: Decimal, step: Decimal) -> Vec<DailyBar> {
    let end = session_date() - Duration::days(1);
    (0..90i64)
        .map(|i| {
            let back = 89 - i;
            let close = last_close - step * Decimal::from(back);
            DailyBar {
                date: end - Duration::days(back),
                open: close,
                high: close,
                low: close,
                close,
            }
        })
        .collect()
}

/// Minute bars from 09:30 to 09:40 New York time. Bars before the 09:35
/// anchor close at `before`, the rest at `at_anchor`.
pub fn minute_bars(before: Decimal, at_anchor: Decimal) -> Vec<IntradayBar> {
    // 09:30 EDT is 13:30 UTC
    let open = Utc.with_ymd_and_hms(2024, 5, 17, 13, 30, 0).unwrap();
    (0..=10i64)
        .map(|m| {
            let close = if m < 5 { before } else { at_anchor };
            IntradayBar {
                timestamp: open + Duration::minutes(m),
                open: close,
                high: close,
                low: close,
                close,
            }
        })
        .collect()
}

/// Flat vol proxy, trend proxy moving by `trend_step` per day, VIX1D 16 and
/// SPX 5000 at the anchor.
pub fn market_data(trend_step: Decimal) -> MockMarketData {
    let mut md = MockMarketData::new();

    md.expect_get_daily_bars().returning(move |ticker: &str, _, _| {
        Ok(match ticker {
            "I:VIX1D" => daily_series(dec!(14), Decimal::ZERO),
            _ => daily_series(dec!(520), trend_step),
        })
    });

    md.expect_get_intraday_bars().returning(|ticker: &str, _, _| match ticker {
        "I:VIX1D" => Ok(minute_bars(dec!(22), dec!(16))),
        "I:SPX" => Ok(minute_bars(dec!(4990), dec!(5000))),
        other => bail!("no bars for {other}"),
    });

    md.expect_get_latest_quote().returning(|ticker: &str| {
        let mid = if ticker == "I:SPX" {
            dec!(5010)
        } else if ticker.contains("P04975") {
            dec!(2.00)
        } else {
            dec!(1.80)
        };
        Ok(LatestQuote {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 17, 15, 0, 0).unwrap(),
            mid,
        })
    });

    md.expect_get_quote_median().returning(|ticker: &str, _, _| {
        Ok(if ticker.contains("P04975") {
            QuoteMedian {
                bid: dec!(3.50),
                ask: dec!(3.70),
            }
        } else {
            QuoteMedian {
                bid: dec!(3.00),
                ask: dec!(3.20),
            }
        })
    });

    md
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Keeps every alert it receives.
#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<(AlertLevel, String)>>,
}

impl RecordingSink {
    pub fn messages(&self, level: AlertLevel) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn has(&self, level: AlertLevel, fragment: &str) -> bool {
        self.messages(level).iter().any(|m| m.contains(fragment))
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, level: AlertLevel, message: &str) -> Result<()> {
        self.seen.lock().unwrap().push((level, message.to_string()));
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub broker: Arc<PaperBroker>,
    pub sink: Arc<RecordingSink>,
    pub runtime: EngineRuntime,
}

impl Harness {
    pub fn new(cfg: AppConfig, broker: Arc<PaperBroker>, md: MockMarketData) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let sinks: Vec<Arc<dyn AlertSink>> = vec![sink.clone()];
        let alerts = Alerts::new(sinks, std::time::Duration::from_secs(1));
        let runtime =
            EngineRuntime::new(cfg, broker.clone(), Arc::new(md), alerts, session_date()).unwrap();
        Self {
            broker,
            sink,
            runtime,
        }
    }

    /// Uptrend session on the default chain.
    pub fn standard() -> Self {
        Self::new(test_config(), paper_broker(), market_data(dec!(0.5)))
    }

    /// Connect and compute regimes.
    pub async fn ready(&mut self) {
        self.runtime.start().await;
        self.runtime.run_pre_open().await;
    }
}
