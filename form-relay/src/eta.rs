//! ETA parsing.
//!
//! Naive timestamps are interpreted in the scheduler's timezone. Formats are
//! tried in a fixed order, so `03/04/2030` is read day-first (3 April).

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y"];

/// Parse free-form ETA text in `tz`. Empty or unrecognised text yields `None`.
pub fn parse_eta(text: &str, tz: Tz) -> Option<DateTime<FixedOffset>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    parse_naive(text)
        .and_then(|naive| localize(naive, tz))
        .or_else(|| DateTime::parse_from_rfc3339(text).ok())
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    // Date-only formats keep their rank relative to the datetime ones
    // (`YYYY-MM-DD` sits right after `YYYY-MM-DD HH:MM:SS`).
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, DATETIME_FORMATS[0]) {
        return Some(dt);
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, DATE_FORMATS[0]) {
        return Some(d.and_time(NaiveTime::MIN));
    }

    let groups: [(&[&str], &str); 3] = [
        (&DATETIME_FORMATS[1..3], DATE_FORMATS[1]),
        (&DATETIME_FORMATS[3..5], DATE_FORMATS[2]),
        (&DATETIME_FORMATS[5..7], DATE_FORMATS[3]),
    ];
    for (datetime_formats, date_format) in groups {
        for format in datetime_formats {
            if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
                return Some(dt);
            }
        }
        if let Ok(d) = NaiveDate::parse_from_str(text, date_format) {
            return Some(d.and_time(NaiveTime::MIN));
        }
    }
    None
}

/// Attach `tz`; inside a DST gap there is no such local time
fn localize(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<FixedOffset>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.fixed_offset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const JAKARTA: Tz = chrono_tz::Asia::Jakarta;

    #[test]
    fn test_iso_datetime_in_zone() {
        let eta = parse_eta("2030-05-01 08:15:00", JAKARTA).unwrap();
        assert_eq!(eta.offset().local_minus_utc(), 7 * 3600);
        assert_eq!((eta.hour(), eta.minute()), (8, 15));
    }

    #[test]
    fn test_date_only_is_midnight() {
        let eta = parse_eta("2030-05-01", JAKARTA).unwrap();
        assert_eq!((eta.day(), eta.hour()), (1, 0));
    }

    #[test]
    fn test_day_first_wins_when_ambiguous() {
        let eta = parse_eta("03/04/2030 10:00", JAKARTA).unwrap();
        assert_eq!((eta.day(), eta.month()), (3, 4));
    }

    #[test]
    fn test_month_first_when_day_first_impossible() {
        let eta = parse_eta("04/25/2030 10:00:30", JAKARTA).unwrap();
        assert_eq!((eta.month(), eta.day(), eta.second()), (4, 25, 30));
    }

    #[test]
    fn test_dashed_day_first() {
        let eta = parse_eta("25-12-2030", JAKARTA).unwrap();
        assert_eq!((eta.day(), eta.month()), (25, 12));
    }

    #[test]
    fn test_rfc3339_keeps_its_offset() {
        let eta = parse_eta("2030-01-01T00:00:00+02:00", JAKARTA).unwrap();
        assert_eq!(eta.offset().local_minus_utc(), 2 * 3600);
    }

    #[test]
    fn test_garbage_and_empty() {
        assert!(parse_eta("", JAKARTA).is_none());
        assert!(parse_eta("   ", JAKARTA).is_none());
        assert!(parse_eta("next tuesday", JAKARTA).is_none());
        assert!(parse_eta("2030-13-45 99:00:00", JAKARTA).is_none());
    }

    #[test]
    fn test_dst_gap_is_rejected() {
        // Clocks jump from 02:00 to 03:00 in Berlin on this date
        let berlin = chrono_tz::Europe::Berlin;
        assert!(parse_eta("2030-03-31 02:30:00", berlin).is_none());
    }
}
