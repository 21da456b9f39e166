//! Timezone helpers shared by every schedule kind.
//!
//! Schedules are evaluated on the zone's wall clock and converted to UTC one
//! instant at a time. Across a "fall back" fold the earlier instant wins, so a
//! wall-clock time never fires twice; inside a "spring forward" gap the time
//! does not exist and is dropped.

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use runloom_core::error::{Result, RunloomError};

/// Parse an IANA zone name; `None` means UTC.
pub fn parse_timezone(name: Option<&str>) -> Result<Tz> {
    match name {
        None => Ok(Tz::UTC),
        Some(name) => name
            .trim()
            .parse::<Tz>()
            .map_err(|_| RunloomError::InvalidScheduleSpec(format!("unknown timezone '{name}'"))),
    }
}

/// Wall-clock time of `instant` in `tz`.
pub fn to_local(tz: &Tz, instant: DateTime<Utc>) -> NaiveDateTime {
    instant.with_timezone(tz).naive_local()
}

/// UTC instant of a wall-clock time: earliest on a fold, `None` in a gap.
pub fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_unknown_timezone_is_invalid_spec() {
        assert!(matches!(
            parse_timezone(Some("Mars/Olympus")),
            Err(RunloomError::InvalidScheduleSpec(_))
        ));
        assert_eq!(parse_timezone(None).unwrap(), Tz::UTC);
    }

    #[test]
    fn test_gap_is_dropped() {
        let tz = parse_timezone(Some("America/New_York")).unwrap();
        // 2024-03-10 02:30 does not exist in New York.
        assert!(resolve_local(&tz, naive(2024, 3, 10, 2, 30)).is_none());
    }

    #[test]
    fn test_fold_resolves_to_earliest() {
        let tz = parse_timezone(Some("America/New_York")).unwrap();
        // 2024-11-03 01:30 happens twice; the EDT one is 05:30 UTC.
        let resolved = resolve_local(&tz, naive(2024, 11, 3, 1, 30)).unwrap();
        assert_eq!(resolved.naive_utc(), naive(2024, 11, 3, 5, 30));
    }
}
