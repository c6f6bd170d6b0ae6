//! Trend and volatility regime classification.
//!
//! Both regimes come from simple moving averages of daily closes:
//! the vol proxy is elevated when its 20-day average sits strictly above
//! its 60-day average, and the underlying is in an uptrend when its latest
//! close sits strictly above its own 20-day average.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::debug;

use crate::types::{DailyBar, EngineError, RegimeSnapshot, TrendRegime, VolRegime};

/// Short moving-average window (about one month of sessions).
pub const SHORT_WINDOW: usize = 20;
/// Long moving-average window (about three months of sessions).
pub const LONG_WINDOW: usize = 60;

/// Pure regime classifier over two ordered daily-close series.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegimeClassifier;

impl RegimeClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify both regimes as of `date`.
    ///
    /// `vol_bars` and `trend_bars` must be ordered oldest first and hold at
    /// least [`LONG_WINDOW`] bars each.
    pub fn classify(
        &self,
        date: NaiveDate,
        vol_bars: &[DailyBar],
        trend_bars: &[DailyBar],
    ) -> Result<RegimeSnapshot, EngineError> {
        ensure_history("vol proxy", vol_bars)?;
        ensure_history("trend proxy", trend_bars)?;

        let vol = classify_vol(vol_bars);
        let trend = classify_trend(trend_bars);

        debug!(
            %date,
            trend = trend.as_flag(),
            vol = vol.as_flag(),
            vol_bars = vol_bars.len(),
            trend_bars = trend_bars.len(),
            "Regimes classified"
        );

        Ok(RegimeSnapshot { date, trend, vol })
    }
}

fn ensure_history(series: &str, bars: &[DailyBar]) -> Result<(), EngineError> {
    if bars.len() < LONG_WINDOW {
        return Err(EngineError::InsufficientHistory {
            series: series.to_string(),
            required: LONG_WINDOW,
            available: bars.len(),
        });
    }
    Ok(())
}

fn classify_vol(bars: &[DailyBar]) -> VolRegime {
    if sma(bars, SHORT_WINDOW) > sma(bars, LONG_WINDOW) {
        VolRegime::Elevated
    } else {
        VolRegime::Compressed
    }
}

fn classify_trend(bars: &[DailyBar]) -> TrendRegime {
    // Non-empty: history was checked by the caller.
    let latest = bars[bars.len() - 1].close;
    if latest > sma(bars, SHORT_WINDOW) {
        TrendRegime::Up
    } else {
        TrendRegime::Down
    }
}

/// Simple moving average of the last `window` closes.
fn sma(bars: &[DailyBar], window: usize) -> Decimal {
    let tail = &bars[bars.len() - window..];
    let sum: Decimal = tail.iter().map(|b| b.close).sum();
    sum / Decimal::from(window)
}
