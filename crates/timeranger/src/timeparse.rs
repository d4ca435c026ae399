//! Permissive free-text date parsing for `tkey` fields and ISO time bounds.
//!
//! Topics whose `tkey` field holds strings route them through [`parse_time`]
//! at append time; the matcher uses the same parser for ISO `from_t`/`to_t`
//! bounds. Unparseable input is not an error at the append path: the message
//! time simply becomes 0.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Formats tried in order after RFC 3339.
const FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

/// Date-only formats, interpreted as midnight UTC.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];

/// Parses free-text time into Unix seconds (UTC).
///
/// Accepts RFC 3339, a handful of common date-time and date-only layouts,
/// and bare integers taken as Unix seconds. Returns `None` when nothing
/// matches.
pub fn parse_time(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp());
    }

    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&naive).timestamp());
        }
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            let naive = date.and_hms_opt(0, 0, 0)?;
            return Some(Utc.from_utc_datetime(&naive).timestamp());
        }
    }

    text.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339() {
        assert_eq!(parse_time("2024-01-01T00:00:00Z"), Some(1_704_067_200));
        assert_eq!(parse_time("2024-01-01T02:00:00+02:00"), Some(1_704_067_200));
    }

    #[test]
    fn common_layouts() {
        assert_eq!(parse_time("2024-01-01 00:00:00"), Some(1_704_067_200));
        assert_eq!(parse_time("2024-01-01 00:00:00.500"), Some(1_704_067_200));
        assert_eq!(parse_time("2024/01/01 00:00:00"), Some(1_704_067_200));
        assert_eq!(parse_time("01.01.2024 00:00:00"), Some(1_704_067_200));
        assert_eq!(parse_time("2024-01-01 00:00"), Some(1_704_067_200));
    }

    #[test]
    fn date_only_is_midnight_utc() {
        assert_eq!(parse_time("2024-01-01"), Some(1_704_067_200));
        assert_eq!(parse_time("01.01.2024"), Some(1_704_067_200));
    }

    #[test]
    fn bare_integer_seconds() {
        assert_eq!(parse_time("1704067200"), Some(1_704_067_200));
        assert_eq!(parse_time("  1704067200  "), Some(1_704_067_200));
    }

    #[test]
    fn garbage_is_none() {
        assert_eq!(parse_time(""), None);
        assert_eq!(parse_time("yesterday-ish"), None);
        assert_eq!(parse_time("2024-13-40"), None);
    }
}
