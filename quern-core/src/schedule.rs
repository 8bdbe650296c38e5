//! Recurrence rules and next-fire calendar arithmetic.

use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, NaiveDate, TimeZone, Timelike, Utc, Weekday,
};
use chrono_tz::Tz;

/// A recurrence rule.
///
/// Sub-hour rules (`EveryMinute`, `Hourly`) are evaluated on the UTC
/// clock; calendar rules resolve their local wall-clock candidate through
/// the timezone database, so they stay correct across DST transitions,
/// leap years, and year boundaries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Schedule {
    EveryMinute {
        second: u32,
    },
    Hourly {
        minute: u32,
    },
    Daily {
        hour: u32,
        minute: u32,
        tz: Tz,
    },
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
        tz: Tz,
    },
    Monthly {
        day_of_month: u32,
        hour: u32,
        minute: u32,
        tz: Tz,
    },
}

impl Schedule {
    /// Fire at the given second of every minute.
    ///
    /// # Panics
    /// If `second` is not below 60.
    pub fn every_minute(second: u32) -> Self {
        assert!(second < 60, "second out of range: {second}");
        Self::EveryMinute { second }
    }

    /// Fire at the given minute of every hour.
    ///
    /// # Panics
    /// If `minute` is not below 60.
    pub fn hourly(minute: u32) -> Self {
        assert!(minute < 60, "minute out of range: {minute}");
        Self::Hourly { minute }
    }

    /// Fire once a day at the given local wall-clock time.
    ///
    /// # Panics
    /// If `hour` or `minute` is out of range.
    pub fn daily(hour: u32, minute: u32, tz: Tz) -> Self {
        assert!(hour < 24, "hour out of range: {hour}");
        assert!(minute < 60, "minute out of range: {minute}");
        Self::Daily { hour, minute, tz }
    }

    /// Fire once a week on the given weekday at the given local time.
    ///
    /// # Panics
    /// If `hour` or `minute` is out of range.
    pub fn weekly(weekday: Weekday, hour: u32, minute: u32, tz: Tz) -> Self {
        assert!(hour < 24, "hour out of range: {hour}");
        assert!(minute < 60, "minute out of range: {minute}");
        Self::Weekly {
            weekday,
            hour,
            minute,
            tz,
        }
    }

    /// Fire once a month on the given day at the given local time.
    ///
    /// Months without the day are skipped (a day-31 schedule never fires
    /// in April).
    ///
    /// # Panics
    /// If `day_of_month` is not in `1..=31`, or `hour`/`minute` is out of
    /// range.
    pub fn monthly(day_of_month: u32, hour: u32, minute: u32, tz: Tz) -> Self {
        assert!(
            (1..=31).contains(&day_of_month),
            "day of month out of range: {day_of_month}"
        );
        assert!(hour < 24, "hour out of range: {hour}");
        assert!(minute < 60, "minute out of range: {minute}");
        Self::Monthly {
            day_of_month,
            hour,
            minute,
            tz,
        }
    }

    /// Smallest instant strictly greater than `after` matching this rule.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Schedule::EveryMinute { second } => {
                let candidate = minute_start(after) + Duration::seconds(i64::from(second));
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::minutes(1)
                }
            }
            Schedule::Hourly { minute } => {
                let candidate = hour_start(after) + Duration::minutes(i64::from(minute));
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::hours(1)
                }
            }
            Schedule::Daily { hour, minute, tz } => {
                let mut date = after.with_timezone(&tz).date_naive();
                loop {
                    if let Some(candidate) = resolve_local(tz, date, hour, minute) {
                        if candidate > after {
                            return candidate;
                        }
                    }
                    date = date + Days::new(1);
                }
            }
            Schedule::Weekly {
                weekday,
                hour,
                minute,
                tz,
            } => {
                let mut date = after.with_timezone(&tz).date_naive();
                while date.weekday() != weekday {
                    date = date + Days::new(1);
                }
                loop {
                    if let Some(candidate) = resolve_local(tz, date, hour, minute) {
                        if candidate > after {
                            return candidate;
                        }
                    }
                    date = date + Days::new(7);
                }
            }
            Schedule::Monthly {
                day_of_month,
                hour,
                minute,
                tz,
            } => {
                let local = after.with_timezone(&tz);
                let (mut year, mut month) = (local.year(), local.month());
                loop {
                    // from_ymd_opt is None exactly when the month lacks the
                    // day; those months are skipped.
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day_of_month) {
                        if let Some(candidate) = resolve_local(tz, date, hour, minute) {
                            if candidate > after {
                                return candidate;
                            }
                        }
                    }
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                }
            }
        }
    }
}

/// Truncate to the start of the instant's UTC minute.
fn minute_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at - Duration::seconds(i64::from(at.second()))
        - Duration::nanoseconds(i64::from(at.timestamp_subsec_nanos()))
}

/// Truncate to the start of the instant's UTC hour.
fn hour_start(at: DateTime<Utc>) -> DateTime<Utc> {
    minute_start(at) - Duration::minutes(i64::from(at.minute()))
}

/// Map a local wall-clock candidate into UTC.
///
/// Ambiguous local times (DST fall-back) resolve to the earliest instant;
/// nonexistent local times (spring-forward gap) yield `None` and the
/// caller rolls to the next occurrence.
fn resolve_local(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(local) => Some(local.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}
