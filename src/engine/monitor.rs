//! Spread mark-to-market while a position is open.
//!
//! A credit spread is worth `short mid - long mid`; the position earns the
//! entry credit minus what it would cost to buy the spread back now.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;

use crate::types::{FillRecord, LegRole, OptionRight};

/// Index option contract multiplier.
pub const CONTRACT_MULTIPLIER: Decimal = dec!(100);

#[derive(Debug, Clone, PartialEq)]
pub struct SpreadMark {
    pub timestamp: DateTime<Utc>,
    pub short_mid: Decimal,
    pub long_mid: Decimal,
    pub spread_value: Decimal,
    pub entry_credit: Decimal,
    /// Per spread, in premium points.
    pub pnl_points: Decimal,
    /// Across all units, in currency.
    pub pnl_total: Decimal,
    /// P&L as a percentage of entry credit; None when the credit is zero.
    pub pnl_pct: Option<Decimal>,
    /// How far spot sits from the short strike on the safe side, in percent
    /// of spot. Negative once the short strike is in the money.
    pub cushion_pct: Option<Decimal>,
}

impl fmt::Display for SpreadMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spread {} (credit {}) pnl {} / {}",
            self.spread_value, self.entry_credit, self.pnl_points, self.pnl_total
        )?;
        if let Some(pct) = self.pnl_pct {
            write!(f, " ({pct}%)")?;
        }
        if let Some(cushion) = self.cushion_pct {
            write!(f, " cushion {cushion}%")?;
        }
        Ok(())
    }
}

/// Inputs for one mark.
#[derive(Debug, Clone)]
pub struct MarkInputs {
    pub timestamp: DateTime<Utc>,
    pub entry_credit: Decimal,
    pub short_mid: Decimal,
    pub long_mid: Decimal,
    pub units: u32,
    pub right: OptionRight,
    pub short_strike: Decimal,
    pub spot: Option<Decimal>,
}

pub fn mark_spread(inputs: &MarkInputs) -> SpreadMark {
    let spread_value = (inputs.short_mid - inputs.long_mid).round_dp(2);
    let pnl_points = (inputs.entry_credit - spread_value).round_dp(2);
    let pnl_total = pnl_points * CONTRACT_MULTIPLIER * Decimal::from(inputs.units);
    let pnl_pct = (!inputs.entry_credit.is_zero())
        .then(|| (pnl_points / inputs.entry_credit * dec!(100)).round_dp(2));

    let cushion_pct = inputs.spot.filter(|s| !s.is_zero()).map(|spot| {
        let gap = match inputs.right {
            OptionRight::Put => spot - inputs.short_strike,
            OptionRight::Call => inputs.short_strike - spot,
        };
        (gap / spot * dec!(100)).round_dp(3)
    });

    SpreadMark {
        timestamp: inputs.timestamp,
        short_mid: inputs.short_mid,
        long_mid: inputs.long_mid,
        spread_value,
        entry_credit: inputs.entry_credit,
        pnl_points,
        pnl_total,
        pnl_pct,
        cushion_pct,
    }
}

/// Credit actually received: short fill price minus long fill price. Uses
/// the most recent fill of each leg; None until both legs have filled.
pub fn fill_credit(fills: &[FillRecord]) -> Option<Decimal> {
    let last = |role: LegRole| fills.iter().rev().find(|f| f.role == role);
    let short = last(LegRole::Short)?;
    let long = last(LegRole::Long)?;
    Some((short.avg_price - long.avg_price).round_dp(2))
}
