//! # Temporal Module
//!
//! Processing windows, sighting spans and the time arithmetic the extractor,
//! edge builder and merger share. All times are UTC epoch seconds.

use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::fmt;
use time::{Date, Duration, OffsetDateTime, Time};

/// A temporal instant as UTC epoch seconds.
pub type Instant = i64;

pub const SECONDS_PER_MINUTE: i64 = 60;
pub const SECONDS_PER_DAY: i64 = 86_400;

/// A half-open interval `[start, end)` with `start < end`.
///
/// Processing windows are intervals: a daily run covers
/// `[day 00:00, next day 00:00)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    /// Start time (inclusive)
    pub start: Instant,
    /// End time (exclusive)
    pub end: Instant,
}

impl Interval {
    /// The window covering one UTC calendar day.
    pub fn for_day(date: Date) -> Self {
        let start = start_of_day(date);
        Self {
            start,
            end: start + SECONDS_PER_DAY,
        }
    }

    /// The window of `days` whole days ending with (and including) `date`.
    pub fn lookback(date: Date, days: u32) -> Self {
        let end = start_of_day(date) + SECONDS_PER_DAY;
        let days = i64::from(days.max(1));
        Self {
            start: end - days * SECONDS_PER_DAY,
            end,
        }
    }

    /// Check if this interval contains a specific instant
    pub fn contains(&self, instant: Instant) -> bool {
        self.start <= instant && instant < self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The closed range `[first_seen, last_seen]` over which something was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl Span {
    /// A span covering a single sighting.
    pub fn at(instant: Instant) -> Self {
        Self {
            first_seen: instant,
            last_seen: instant,
        }
    }

    /// Widen the span to include another sighting.
    pub fn observe(&mut self, instant: Instant) {
        self.first_seen = min(self.first_seen, instant);
        self.last_seen = max(self.last_seen, instant);
    }

    /// Smallest span covering both spans.
    pub fn merge(&self, other: &Span) -> Span {
        Span {
            first_seen: min(self.first_seen, other.first_seen),
            last_seen: max(self.last_seen, other.last_seen),
        }
    }

    /// Seconds between the closest points of two spans; zero when they touch.
    pub fn gap_to(&self, other: &Span) -> i64 {
        if self.last_seen < other.first_seen {
            other.first_seen - self.last_seen
        } else if other.last_seen < self.first_seen {
            self.first_seen - other.last_seen
        } else {
            0
        }
    }
}

/// Epoch seconds of 00:00 UTC on `date`.
pub fn start_of_day(date: Date) -> Instant {
    date.with_time(Time::MIDNIGHT).assume_utc().unix_timestamp()
}

/// The UTC calendar day before today.
pub fn yesterday_utc() -> Date {
    (OffsetDateTime::now_utc() - Duration::days(1)).date()
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> anyhow::Result<Date> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    Date::parse(raw.trim(), &format)
        .map_err(|err| anyhow::anyhow!("invalid date {raw:?} (expected YYYY-MM-DD): {err}"))
}
