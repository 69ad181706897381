//! Time and timestamp utilities
//!
//! All stored timestamps are seconds since the Unix epoch, as `f64`
//! (millisecond precision).

use chrono::{TimeZone, Utc};

/// Get current Unix timestamp in seconds (millisecond precision)
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Format a stored timestamp as RFC 3339, for logs and admin output
pub fn format_timestamp(ts: f64) -> String {
    let millis = (ts * 1000.0).round() as i64;
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.to_rfc3339(),
        None => format!("{}", ts),
    }
}
