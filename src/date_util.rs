use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Error, Result};

/// Storage format for calendar dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Storage format for timestamps (UTC, matches SQLite's `datetime()`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn next_day(d: NaiveDate) -> NaiveDate {
    d + Duration::days(1)
}

pub fn prev_day(d: NaiveDate) -> NaiveDate {
    d - Duration::days(1)
}

/// Midnight UTC at the start of the given day.
pub fn start_of_day(d: NaiveDate) -> DateTime<Utc> {
    d.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Metrics are computed for yesterday unless a date is given.
pub fn default_date_for() -> NaiveDate {
    prev_day(Utc::now().date_naive())
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| Error::DateParse(format!("{s}: {e}")))
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp. Accepts the SQLite `datetime()` layout, RFC 3339,
/// and bare dates (taken as midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT) {
        return Some(ts.and_utc());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ts.and_utc());
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .map(start_of_day)
}

/// Elapsed time between two instants in fractional days.
pub fn days_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_seconds() as f64 / 86_400.0
}

/// A date range [start, end] inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Every day in the range, in order. Empty when start > end.
    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut d = self.start;
        while d <= self.end {
            days.push(d);
            d = next_day(d);
        }
        days
    }
}
