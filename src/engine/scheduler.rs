//! Daily wall-clock triggers in the venue's time zone.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    PreOpen,
    Entry,
    Exit,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::PreOpen => write!(f, "pre-open"),
            Trigger::Entry => write!(f, "entry"),
            Trigger::Exit => write!(f, "exit"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DailySchedule {
    tz: Tz,
    pre_open: NaiveTime,
    entry: NaiveTime,
    exit: NaiveTime,
}

impl DailySchedule {
    pub fn new(tz: Tz, pre_open: NaiveTime, entry: NaiveTime, exit: NaiveTime) -> Self {
        Self {
            tz,
            pre_open,
            entry,
            exit,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let (pre_open, entry, exit) = config.trigger_times()?;
        Ok(Self::new(config.time_zone()?, pre_open, entry, exit))
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    /// The venue-local calendar date at `now`.
    pub fn trading_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// UTC instant of a local wall-clock time on `date`. Ambiguous times take
    /// the earlier instant; times inside a DST gap move forward to the first
    /// valid minute.
    pub fn local_instant(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let mut local = date.and_time(time);
        // DST gaps are at most an hour in practice; bound the walk at a day.
        for _ in 0..(24 * 60) {
            if let Some(t) = self.tz.from_local_datetime(&local).earliest() {
                return t.with_timezone(&Utc);
            }
            local += Duration::minutes(1);
        }
        Utc.from_utc_datetime(&date.and_time(time))
    }

    pub fn instant(&self, date: NaiveDate, trigger: Trigger) -> DateTime<Utc> {
        let time = match trigger {
            Trigger::PreOpen => self.pre_open,
            Trigger::Entry => self.entry,
            Trigger::Exit => self.exit,
        };
        self.local_instant(date, time)
    }

    /// The day's triggers in firing order.
    pub fn triggers_for(&self, date: NaiveDate) -> Vec<(Trigger, DateTime<Utc>)> {
        [Trigger::PreOpen, Trigger::Entry, Trigger::Exit]
            .into_iter()
            .map(|t| (t, self.instant(date, t)))
            .collect()
    }

    /// Triggers still to run when starting at `now`. Past triggers stay in
    /// the list and fire immediately, except that once the exit time has
    /// passed only the exit remains.
    pub fn pending(&self, date: NaiveDate, now: DateTime<Utc>) -> Vec<(Trigger, DateTime<Utc>)> {
        let triggers = self.triggers_for(date);
        let exit_at = self.instant(date, Trigger::Exit);
        if now >= exit_at {
            return vec![(Trigger::Exit, exit_at)];
        }
        triggers
    }
}
