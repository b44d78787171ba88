//! Time source for the refresher.
//!
//! Record timestamps are kept both as server-local wall time and as UTC, so
//! the clock hands out both. Everything that reads "now" goes through a
//! [`Clock`] so runs and TTLs can be driven deterministically in tests.

use chrono::{DateTime, Duration, Local, NaiveDateTime, Utc};
use std::sync::Mutex;

/// Format used for local wall-clock timestamps in meta values, audit log
/// entries and exports.
pub const LOCAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait Clock: Send + Sync {
    /// Server-local wall time.
    fn now(&self) -> NaiveDateTime;
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Local time and UTC are treated as
/// the same wall time (a UTC host).
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    pub fn set(&self, value: NaiveDateTime) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.now().and_utc()
    }
}

pub fn format_local(value: &NaiveDateTime) -> String {
    value.format(LOCAL_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_local(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, LOCAL_TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(at(10, 0));
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), at(11, 30));
        assert_eq!(clock.now_utc().naive_utc(), at(11, 30));
    }

    #[test]
    fn test_local_format_roundtrip() {
        let formatted = format_local(&at(3, 5));
        assert_eq!(formatted, "2024-03-10 03:05:00");
        assert_eq!(parse_local(&formatted), Some(at(3, 5)));
        assert_eq!(parse_local("not a date"), None);
    }
}
