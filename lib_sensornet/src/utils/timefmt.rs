//! # Time Formatting
//!
//! Sensor nodes stamp their readings as `YYYY-DDD-HH:MM:SS` (UTC, day of year),
//! the dashboard shows arrival time as a local wall clock, and exports use
//! RFC 3339 with millisecond precision.

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Format used by the sensor nodes for `Tiempo_UTC`.
pub const DAY_OF_YEAR_FORMAT: &str = "%Y-%j-%H:%M:%S";

/// Local wall-clock time, `HH:MM:SS`.
pub fn clock_hms(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%H:%M:%S").to_string()
}

/// Formats a UTC instant the way sensor nodes do (`2025-042-13:07:55`).
pub fn day_of_year_stamp(ts: DateTime<Utc>) -> String {
    ts.format(DAY_OF_YEAR_FORMAT).to_string()
}

/// Parses a sensor `Tiempo_UTC` stamp. Returns `None` for anything else.
pub fn parse_day_of_year_stamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), DAY_OF_YEAR_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub fn rfc3339_millis(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
