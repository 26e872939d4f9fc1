// ABOUTME: Utilities for working with wall-clock timestamps.
// ABOUTME: Provides RFC3339 formatting and strictly increasing per-stream timestamps.
use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};

/// Current UTC wall-clock time
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp as fixed-width RFC3339 with microsecond precision.
///
/// Fixed width keeps stored timestamps lexicographically ordered.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use cw_core::to_rfc3339;
///
/// let time = Utc.timestamp_opt(1_609_459_200, 0).unwrap();
/// assert_eq!(to_rfc3339(time), "2021-01-01T00:00:00.000000Z");
/// ```
pub fn to_rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC3339 timestamp back into UTC
pub fn parse_rfc3339(value: &str) -> crate::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| crate::Error::Validation(format!("Invalid timestamp '{}': {}", value, e)))
}

/// Returns `now` truncated to microseconds unless that does not move past
/// `last`, in which case one microsecond after `last` is returned instead.
///
/// ```
/// use cw_core::time::strictly_after;
/// let t = chrono::Utc::now();
/// assert!(strictly_after(Some(t), t) > t);
/// ```
pub fn strictly_after(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    match last {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}
