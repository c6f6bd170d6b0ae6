//! Venue liquid-hours calendar.
//!
//! Brokers report trading hours as a `;`-separated list of day entries.
//! Two layouts are seen in the wild:
//!
//! - `20090507:0700-1830,1830-2330;20090508:CLOSED`
//! - `20180323:0930-20180323:1600;20180324:CLOSED`

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayHours {
    Closed,
    Open(Vec<(NaiveTime, NaiveTime)>),
}

/// Parsed liquid-hours calendar keyed by date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiquidHours {
    days: BTreeMap<NaiveDate, DayHours>,
}

impl LiquidHours {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut days = BTreeMap::new();

        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (date_part, hours_part) = entry
                .split_once(':')
                .with_context(|| format!("Liquid-hours entry without ':' separator: {entry:?}"))?;
            let date = parse_yyyymmdd(date_part)?;

            if hours_part.eq_ignore_ascii_case("CLOSED") {
                days.insert(date, DayHours::Closed);
                continue;
            }

            let mut sessions = Vec::new();
            for range in hours_part.split(',') {
                let (start, end) = range
                    .split_once('-')
                    .with_context(|| format!("Bad session range {range:?} in {entry:?}"))?;
                sessions.push((parse_hhmm(start)?, parse_end(end)?));
            }
            days.entry(date)
                .and_modify(|d| {
                    if let DayHours::Open(existing) = d {
                        existing.extend(sessions.iter().copied());
                    }
                })
                .or_insert(DayHours::Open(sessions));
        }

        Ok(Self { days })
    }

    /// False only when the date is explicitly marked closed. Dates outside the
    /// published window are assumed open.
    pub fn is_open_on(&self, date: NaiveDate) -> bool {
        !matches!(self.days.get(&date), Some(DayHours::Closed))
    }

    pub fn hours_on(&self, date: NaiveDate) -> Option<&DayHours> {
        self.days.get(&date)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

/// A week of regular-session hours starting at `from`: weekdays 09:30-16:00,
/// weekends closed. Used by simulated venues.
pub fn regular_session(from: NaiveDate) -> String {
    (0..7)
        .map(|offset| {
            let date = from + Duration::days(offset);
            let stamp = date.format("%Y%m%d");
            match date.weekday() {
                Weekday::Sat | Weekday::Sun => format!("{stamp}:CLOSED"),
                _ => format!("{stamp}:0930-{stamp}:1600"),
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn parse_yyyymmdd(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y%m%d")
        .with_context(|| format!("Bad calendar date {s:?}"))
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H%M").with_context(|| format!("Bad session time {s:?}"))
}

/// Session end is either `HHMM` or `YYYYMMDD:HHMM`.
fn parse_end(s: &str) -> Result<NaiveTime> {
    match s.split_once(':') {
        Some((_, time)) => parse_hhmm(time),
        None => parse_hhmm(s),
    }
}
