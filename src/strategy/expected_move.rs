//! Expected-move targets.
//!
//! The 1-day vol index is an annualised percentage, so
//! `vol / sqrt(252) / 100` is the expected fractional move for the session.
//! A fraction of that move (the distance factor) sets how far from spot the
//! short strike sits, and the long strike is one spread width further out.
//!
//! Direction follows the trend: an uptrend sells a put spread below
//! the market, a downtrend sells a call spread above it.

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use rust_decimal::prelude::*;
use tracing::debug;

use crate::types::{EngineError, ExpectedMove, IntradayBar, OptionRight, TrendRegime};

/// Trading sessions per year used to de-annualise the vol index.
const SESSIONS_PER_YEAR: f64 = 252.0;

/// Expected-move parameters.
#[derive(Debug, Clone)]
pub struct ExpectedMoveConfig {
    /// Multiple of the expected move used as strike distance.
    pub distance_factor: f64,
    /// Strike distance between the two legs.
    pub spread_width: Decimal,
}

impl Default for ExpectedMoveConfig {
    fn default() -> Self {
        Self {
            distance_factor: 0.5,
            spread_width: Decimal::from(5),
        }
    }
}

pub struct ExpectedMoveCalculator {
    config: ExpectedMoveConfig,
}

impl ExpectedMoveCalculator {
    pub fn new(config: ExpectedMoveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExpectedMoveConfig {
        &self.config
    }

    /// Expected-move fraction for a vol-index level.
    pub fn fraction(&self, vol_price: f64) -> f64 {
        (vol_price / SESSIONS_PER_YEAR.sqrt()) / 100.0 * self.config.distance_factor
    }

    /// Compute strike targets from the anchor-time vol price and spot.
    pub fn compute(
        &self,
        date: NaiveDate,
        vol_price: Decimal,
        spot: Decimal,
        trend: TrendRegime,
    ) -> Result<ExpectedMove, EngineError> {
        if vol_price <= Decimal::ZERO || spot <= Decimal::ZERO {
            return Err(EngineError::InvalidInput(format!(
                "vol price {vol_price} and spot {spot} must be positive"
            )));
        }

        let vol = vol_price
            .to_f64()
            .ok_or_else(|| EngineError::InvalidInput(format!("vol price {vol_price}")))?;
        let fraction = self.fraction(vol);
        let fraction_dec = Decimal::from_f64(fraction)
            .ok_or_else(|| EngineError::InvalidInput(format!("expected move {fraction}")))?;
        let distance = spot * fraction_dec;
        let width = self.config.spread_width;

        let (side, short_strike, long_strike) = match trend {
            TrendRegime::Up => {
                let short = spot - distance;
                (OptionRight::Put, short, short - width)
            }
            TrendRegime::Down => {
                let short = spot + distance;
                (OptionRight::Call, short, short + width)
            }
        };

        debug!(
            %date,
            fraction,
            %spot,
            %vol_price,
            side = %side,
            short = %short_strike.round_dp(2),
            long = %long_strike.round_dp(2),
            "Expected move computed"
        );

        Ok(ExpectedMove {
            date,
            fraction,
            short_strike: short_strike.round_dp(4),
            long_strike: long_strike.round_dp(4),
            side,
        })
    }
}

/// Close of the first bar at or after `anchor` in the venue's local time.
pub fn price_at_anchor(bars: &[IntradayBar], anchor: NaiveTime, tz: Tz) -> Option<Decimal> {
    bars.iter()
        .find(|bar| bar.timestamp.with_timezone(&tz).time() >= anchor)
        .map(|bar| bar.close)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    fn calc(width: Decimal) -> ExpectedMoveCalculator {
        ExpectedMoveCalculator::new(ExpectedMoveConfig {
            distance_factor: 0.5,
            spread_width: width,
        })
    }

    #[test]
    fn test_uptrend_sells_put_spread_below_spot() {
        let mv = calc(dec!(5))
            .compute(date(), dec!(16), dec!(5000), TrendRegime::Up)
            .unwrap();
        assert!((mv.fraction - 0.00504).abs() < 0.00001);
        assert_eq!(mv.side, OptionRight::Put);
        assert!((mv.short_strike - dec!(4974.80)).abs() < dec!(0.01));
        assert!((mv.long_strike - dec!(4969.80)).abs() < dec!(0.01));
        assert_eq!(mv.short_strike - mv.long_strike, dec!(5));
    }

    #[test]
    fn test_downtrend_sells_call_spread_above_spot() {
        let mv = calc(dec!(10))
            .compute(date(), dec!(16), dec!(5000), TrendRegime::Down)
            .unwrap();
        assert_eq!(mv.side, OptionRight::Call);
        assert!((mv.short_strike - dec!(5025.20)).abs() < dec!(0.01));
        assert_eq!(mv.long_strike - mv.short_strike, dec!(10));
    }

    #[test]
    fn test_rejects_non_positive_inputs() {
        let c = calc(dec!(5));
        assert!(c.compute(date(), dec!(0), dec!(5000), TrendRegime::Up).is_err());
        assert!(c.compute(date(), dec!(16), dec!(-1), TrendRegime::Up).is_err());
    }

    #[test]
    fn test_anchor_picks_first_bar_at_or_after() {
        let tz = chrono_tz::US::Eastern;
        let bar = |h: u32, m: u32, close: Decimal| IntradayBar {
            timestamp: tz
                .with_ymd_and_hms(2024, 5, 17, h, m, 0)
                .unwrap()
                .with_timezone(&Utc),
            open: close,
            high: close,
            low: close,
            close,
        };
        let bars = vec![
            bar(9, 30, dec!(1)),
            bar(9, 34, dec!(2)),
            bar(9, 35, dec!(3)),
            bar(9, 36, dec!(4)),
        ];
        let anchor = NaiveTime::from_hms_opt(9, 35, 0).unwrap();
        assert_eq!(price_at_anchor(&bars, anchor, tz), Some(dec!(3)));

        let early = &bars[..2];
        assert_eq!(price_at_anchor(early, anchor, tz), None);
    }
}
