//! Human readable byte counts and time windows.

use chrono::{DateTime, TimeDelta, Utc};

const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

/// Formats a byte count with binary multiples and two decimals, e.g.
/// `1536` as `1.50 KB`. Counts below 1024 are printed as-is.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.2} {unit}")
}

/// The instant `hours` before `now`, or `None` if it is not representable.
#[must_use]
pub fn hours_before(now: DateTime<Utc>, hours: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_hours(hours).and_then(|window| now.checked_sub_signed(window))
}
