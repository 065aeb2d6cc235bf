//! Timestamp parsing and storage helpers.
//!
//! Producers send ISO-8601 timestamps, with or without an offset. A missing
//! offset means UTC. Internally every instant is an [`OffsetDateTime`] in UTC
//! truncated to microseconds, which is also the storage resolution.

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::errors::{EngineError, EngineResult};

/// Parse an ISO-8601 timestamp.
///
/// Accepted shapes:
/// - `2018-06-05T02:07:03Z`, `2018-06-05T02:07:03.123+02:00`
/// - `2018-06-05T02:07:03.123456` (UTC assumed)
/// - `2018-06-05 02:07:03` (space separator)
/// - `2018-06-05` (midnight UTC)
pub fn parse_timestamp(raw: &str) -> EngineResult<OffsetDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(EngineError::parsing("empty timestamp"));
    }

    let mut candidate = s.replacen(' ', "T", 1);
    if !candidate.contains('T') {
        candidate.push_str("T00:00:00");
    }
    if !has_offset(&candidate) {
        candidate.push('Z');
    }

    let t = OffsetDateTime::parse(&candidate, &Rfc3339)
        .map_err(|e| EngineError::parsing(format!("invalid timestamp {raw:?}: {e}")))?;
    Ok(normalize(t))
}

fn has_offset(s: &str) -> bool {
    let Some(t_pos) = s.find('T') else {
        return false;
    };
    let time_part = &s[t_pos..];
    time_part.ends_with('Z')
        || time_part.ends_with('z')
        || time_part.contains('+')
        || time_part.contains('-')
}

/// Convert to UTC and truncate to microsecond resolution.
pub fn normalize(t: OffsetDateTime) -> OffsetDateTime {
    let t = t.to_offset(UtcOffset::UTC);
    let micros = t.microsecond();
    t.replace_microsecond(micros).unwrap_or(t)
}

/// Microseconds since the Unix epoch.
pub fn to_micros(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000) as i64
}

pub fn from_micros(micros: i64) -> EngineResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|e| EngineError::invariant(format!("timestamp out of range: {e}")))
}

/// RFC 3339 rendering used in outcomes and diagnostics.
pub fn format_timestamp(t: OffsetDateTime) -> String {
    t.to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .unwrap_or_else(|_| to_micros(t).to_string())
}

/// Seconds between two instants as a float.
pub fn seconds_between(start: OffsetDateTime, stop: OffsetDateTime) -> f64 {
    (stop - start).as_seconds_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn naive_timestamps_are_utc() {
        let t = parse_timestamp("2018-06-05T02:07:03").unwrap();
        assert_eq!(t, datetime!(2018-06-05 02:07:03 UTC));

        let t = parse_timestamp("2018-06-05 02:07:03.250").unwrap();
        assert_eq!(t, datetime!(2018-06-05 02:07:03.25 UTC));
    }

    #[test]
    fn offsets_are_converted() {
        let t = parse_timestamp("2018-06-05T04:07:03+02:00").unwrap();
        assert_eq!(t, datetime!(2018-06-05 02:07:03 UTC));
        assert_eq!(t.offset(), UtcOffset::UTC);
    }

    #[test]
    fn date_only_is_midnight() {
        let t = parse_timestamp("2018-06-05").unwrap();
        assert_eq!(t, datetime!(2018-06-05 00:00:00 UTC));
    }

    #[test]
    fn sub_microsecond_precision_is_dropped() {
        let t = parse_timestamp("2018-06-05T02:07:03.123456789Z").unwrap();
        assert_eq!(from_micros(to_micros(t)).unwrap(), t);
        assert_eq!(t.nanosecond(), 123_456_000);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_timestamp("").is_err());
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("2018-13-05T00:00:00").is_err());
    }

    #[test]
    fn seconds_are_fractional() {
        let a = datetime!(2018-06-05 00:00:00 UTC);
        let b = datetime!(2018-06-05 00:00:01.5 UTC);
        assert_eq!(seconds_between(a, b), 1.5);
    }
}
