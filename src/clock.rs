//! Clock and reference timezone
//!
//! Every "today" computation (quota day, default expense date, month
//! windows) runs in India Standard Time, never UTC. The clock is injected
//! so tests can pin the current instant.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset,
    TimeZone, Utc,
};
use std::sync::RwLock;

/// IST is UTC+05:30 with no daylight saving.
pub const REFERENCE_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

pub fn reference_offset() -> FixedOffset {
    FixedOffset::east_opt(REFERENCE_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current wall time in the reference timezone
    fn local_now(&self) -> DateTime<FixedOffset> {
        self.now().with_timezone(&reference_offset())
    }

    /// Calendar day in the reference timezone
    fn today(&self) -> NaiveDate {
        self.local_now().date_naive()
    }
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Build from a wall time expressed in the reference timezone
    pub fn at_local(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        let naive = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, min, sec))
            .unwrap_or_default();
        Self::new(local_to_utc(naive))
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|g| *g).unwrap_or_else(|e| *e.into_inner())
    }
}

/// Interpret a naive wall time as reference-timezone local time
pub fn local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    match reference_offset().from_local_datetime(&naive).single() {
        Some(local) => local.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}

/// 00:00:00.000 of `day` in the reference timezone
pub fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    local_to_utc(day.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// 23:59:59.999 of `day` in the reference timezone
pub fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    local_to_utc(day.and_hms_milli_opt(23, 59, 59, 999).unwrap_or_default())
}

/// Reference-timezone calendar day of an instant
pub fn local_day(instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&reference_offset()).date_naive()
}

/// First and last day of a calendar month
pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next.pred_opt()?))
}

/// Month window containing `day`
pub fn current_month(day: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    month_bounds(day.year(), day.month())
}

/// Parsed user- or model-supplied date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedDate {
    /// Bare calendar date (`2024-01-31`)
    Day(NaiveDate),
    /// Concrete instant
    Instant(DateTime<Utc>),
}

impl ParsedDate {
    pub fn day(&self) -> NaiveDate {
        match self {
            ParsedDate::Day(d) => *d,
            ParsedDate::Instant(t) => local_day(*t),
        }
    }

    /// Concrete instant; bare dates land on local midnight
    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            ParsedDate::Day(d) => start_of_day(*d),
            ParsedDate::Instant(t) => *t,
        }
    }
}

/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.fff]` (reference
/// timezone) and bare `YYYY-MM-DD`.
pub fn parse_date_input(raw: &str) -> Option<ParsedDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(ParsedDate::Instant(dt.with_timezone(&Utc)));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ParsedDate::Instant(local_to_utc(naive)));
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(ParsedDate::Day)
}
