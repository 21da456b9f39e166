//! Schedule evaluation: turns a `Schedule` into a stream of UTC fire times.
//!
//! Every stream is strictly increasing and only yields instants after the
//! requested start. Interval schedules that are a whole number of days and
//! carry a timezone step on the wall clock, so a daily 09:00 run stays at
//! 09:00 across DST changes; all other intervals are plain UTC arithmetic.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;

use runloom_core::error::{Result, RunloomError};
use runloom_core::schedule::{IntervalSchedule, RRuleSchedule, Schedule};

use crate::cron::CronExpr;
use crate::rrule::{Occurrences, RRule};
use crate::tz::{parse_timezone, resolve_local, to_local};

const SECONDS_PER_DAY: u64 = 86_400;

/// Check a schedule is well formed and can fire at least once.
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Interval(s) => {
            if s.interval_seconds == 0 {
                return Err(RunloomError::InvalidScheduleSpec(
                    "interval must be positive".into(),
                ));
            }
            parse_timezone(s.timezone.as_deref())?;
            Ok(())
        }
        Schedule::Cron(s) => {
            let expr = CronExpr::parse(&s.cron)?;
            parse_timezone(s.timezone.as_deref())?;
            let origin = NaiveDate::from_ymd_opt(2000, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .ok_or_else(|| RunloomError::InvalidScheduleSpec("search origin".into()))?;
            if expr.next_after(origin, s.day_or).is_none() {
                return Err(RunloomError::InvalidScheduleSpec(format!(
                    "cron '{}' never fires",
                    s.cron
                )));
            }
            Ok(())
        }
        Schedule::RRule(s) => {
            let rule = RRule::parse(&s.rrule)?;
            let tz = rrule_timezone(s, &rule)?;
            if rule.occurrences(&tz, None).next().is_none() {
                return Err(RunloomError::InvalidScheduleSpec(format!(
                    "rrule '{}' never fires",
                    s.rrule
                )));
            }
            Ok(())
        }
    }
}

/// Schedule timezone, falling back to the rule's own `TZID`.
fn rrule_timezone(schedule: &RRuleSchedule, rule: &RRule) -> Result<Tz> {
    parse_timezone(schedule.timezone.as_deref().or(rule.tzid.as_deref()))
}

/// Fire times strictly after `after`, at most `limit` of them.
pub fn next_fire_times(
    schedule: &Schedule,
    after: DateTime<Utc>,
    limit: Option<usize>,
) -> Result<FireTimes> {
    let source = match schedule {
        Schedule::Interval(s) => interval_source(s, after)?,
        Schedule::Cron(s) => {
            let expr = CronExpr::parse(&s.cron)?;
            let tz = parse_timezone(s.timezone.as_deref())?;
            Source::Cron(CronSource {
                cursor: to_local(&tz, after),
                expr,
                tz,
                day_or: s.day_or,
            })
        }
        Schedule::RRule(s) => {
            let rule = RRule::parse(&s.rrule)?;
            let tz = rrule_timezone(s, &rule)?;
            let occurrences = rule.occurrences(&tz, Some(to_local(&tz, after)));
            Source::RRule { occurrences, tz }
        }
    };
    Ok(FireTimes {
        source,
        after,
        last: None,
        remaining: limit,
    })
}

/// The first fire time after `after`, if any.
pub fn next_fire_time(schedule: &Schedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(next_fire_times(schedule, after, Some(1))?.next())
}

fn interval_source(s: &IntervalSchedule, after: DateTime<Utc>) -> Result<Source> {
    if s.interval_seconds == 0 {
        return Err(RunloomError::InvalidScheduleSpec(
            "interval must be positive".into(),
        ));
    }
    let tz = parse_timezone(s.timezone.as_deref())?;
    if s.timezone.is_some() && s.interval_seconds % SECONDS_PER_DAY == 0 {
        let days = (s.interval_seconds / SECONDS_PER_DAY) as i64;
        let anchor = to_local(&tz, s.anchor_date);
        let elapsed = (to_local(&tz, after).date() - anchor.date()).num_days();
        return Ok(Source::Calendar {
            anchor,
            tz,
            days,
            k: elapsed.div_euclid(days) - 1,
        });
    }

    let period = i64::try_from(s.interval_seconds)
        .map_err(|_| RunloomError::InvalidScheduleSpec("interval too large".into()))?;
    let elapsed = (after - s.anchor_date).num_seconds();
    // Start one period early; the lattice may sit on either side of `after`.
    let k = elapsed.div_euclid(period) - 1;
    let next = Duration::try_seconds(k.saturating_mul(period))
        .and_then(|offset| s.anchor_date.checked_add_signed(offset));
    Ok(Source::Lattice {
        next,
        period: Duration::try_seconds(period)
            .ok_or_else(|| RunloomError::InvalidScheduleSpec("interval too large".into()))?,
    })
}

#[derive(Debug, Clone)]
struct CronSource {
    expr: CronExpr,
    tz: Tz,
    day_or: bool,
    cursor: NaiveDateTime,
}

#[derive(Debug, Clone)]
enum Source {
    /// `anchor + k * period` in UTC.
    Lattice {
        next: Option<DateTime<Utc>>,
        period: Duration,
    },
    /// Whole days on a zone's wall clock.
    Calendar {
        anchor: NaiveDateTime,
        tz: Tz,
        days: i64,
        k: i64,
    },
    Cron(CronSource),
    RRule { occurrences: Occurrences, tz: Tz },
}

impl Source {
    /// Next raw candidate; may repeat or precede earlier output.
    fn advance(&mut self) -> Option<DateTime<Utc>> {
        match self {
            Source::Lattice { next, period } => {
                let current = (*next)?;
                *next = current.checked_add_signed(*period);
                Some(current)
            }
            Source::Calendar { anchor, tz, days, k } => loop {
                let offset = Duration::try_days(k.checked_mul(*days)?)?;
                *k += 1;
                let local = anchor.checked_add_signed(offset)?;
                if let Some(instant) = resolve_local(tz, local) {
                    return Some(instant);
                }
            },
            Source::Cron(cron) => loop {
                let local = cron.expr.next_after(cron.cursor, cron.day_or)?;
                cron.cursor = local;
                if let Some(instant) = resolve_local(&cron.tz, local) {
                    return Some(instant);
                }
            },
            Source::RRule { occurrences, tz } => loop {
                let local = occurrences.next()?;
                if let Some(instant) = resolve_local(tz, local) {
                    return Some(instant);
                }
            },
        }
    }
}

/// Lazy, strictly increasing fire-time stream.
#[derive(Debug, Clone)]
pub struct FireTimes {
    source: Source,
    after: DateTime<Utc>,
    last: Option<DateTime<Utc>>,
    remaining: Option<usize>,
}

impl Iterator for FireTimes {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<DateTime<Utc>> {
        if self.remaining == Some(0) {
            return None;
        }
        let floor = self.last.unwrap_or(self.after).max(self.after);
        loop {
            let candidate = self.source.advance()?;
            if candidate > floor {
                self.last = Some(candidate);
                if let Some(n) = self.remaining.as_mut() {
                    *n -= 1;
                }
                return Some(candidate);
            }
        }
    }
}

/// Deployment-facing convenience: the fire times a scheduler tick should
/// materialise, bounded by count and horizon.
pub fn upcoming(
    schedule: &Schedule,
    after: DateTime<Utc>,
    max_runs: usize,
    horizon: Duration,
) -> Result<Vec<DateTime<Utc>>> {
    let end = after.checked_add_signed(horizon).unwrap_or(DateTime::<Utc>::MAX_UTC);
    Ok(next_fire_times(schedule, after, Some(max_runs))?
        .take_while(|t| *t <= end)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_daily_interval_from_midday() {
        let schedule = Schedule::interval(86_400, utc(2024, 1, 1, 0, 0));
        let first = next_fire_time(&schedule, utc(2024, 1, 1, 12, 0)).unwrap();
        assert_eq!(first, Some(utc(2024, 1, 2, 0, 0)));
    }

    #[test]
    fn test_cron_every_day_of_month_on_monday_is_mondays_only() {
        use chrono::{Datelike, Weekday};
        let schedule = Schedule::cron("0 0 */1 * MON");
        let times: Vec<_> = next_fire_times(&schedule, utc(2024, 1, 1, 12, 0), Some(8))
            .unwrap()
            .collect();
        assert_eq!(times[0], utc(2024, 1, 8, 0, 0));
        assert!(times.iter().all(|t| t.weekday() == Weekday::Mon));
        assert!(times.windows(2).all(|w| w[1] - w[0] == Duration::days(7)));
    }

    #[test]
    fn test_cron_fifteenth_or_monday() {
        // May 2024: the 15th is a Wednesday; Mondays fall on 6, 13, 20, 27.
        let schedule = Schedule::cron("0 0 15 * MON");
        let first_half: Vec<_> = next_fire_times(&schedule, utc(2024, 5, 1, 0, 0), None)
            .unwrap()
            .take_while(|t| *t < utc(2024, 5, 16, 0, 0))
            .collect();
        assert_eq!(
            first_half,
            vec![utc(2024, 5, 6, 0, 0), utc(2024, 5, 13, 0, 0), utc(2024, 5, 15, 0, 0)]
        );
        let days: Vec<u32> = next_fire_times(&schedule, utc(2024, 5, 1, 0, 0), None)
            .unwrap()
            .take_while(|t| *t < utc(2024, 6, 1, 0, 0))
            .map(|t| chrono::Datelike::day(&t))
            .collect();
        assert_eq!(days, vec![6, 13, 15, 20, 27]);
    }

    #[test]
    fn test_interval_lattice_before_anchor() {
        let schedule = Schedule::interval(3600, utc(2024, 1, 1, 0, 30));
        let times: Vec<_> = next_fire_times(&schedule, utc(2023, 12, 31, 22, 0), Some(3))
            .unwrap()
            .collect();
        assert_eq!(
            times,
            vec![utc(2023, 12, 31, 22, 30), utc(2023, 12, 31, 23, 30), utc(2024, 1, 1, 0, 30)]
        );
    }

    #[test]
    fn test_interval_excludes_exact_start() {
        let schedule = Schedule::interval(600, utc(2024, 1, 1, 0, 0));
        let first = next_fire_time(&schedule, utc(2024, 1, 1, 1, 0)).unwrap();
        assert_eq!(first, Some(utc(2024, 1, 1, 1, 10)));
    }

    #[test]
    fn test_daily_interval_keeps_wall_clock_across_dst() {
        // 09:00 New York is 14:00 UTC in winter and 13:00 UTC in summer.
        let schedule =
            Schedule::interval(86_400, utc(2024, 3, 8, 14, 0)).in_timezone("America/New_York");
        let times: Vec<_> = next_fire_times(&schedule, utc(2024, 3, 8, 0, 0), Some(4))
            .unwrap()
            .collect();
        assert_eq!(
            times,
            vec![
                utc(2024, 3, 8, 14, 0),
                utc(2024, 3, 9, 14, 0),
                utc(2024, 3, 10, 13, 0),
                utc(2024, 3, 11, 13, 0),
            ]
        );
    }

    #[test]
    fn test_cron_skips_gap_and_collapses_fold() {
        let schedule = Schedule::cron("30 1,2 * * *").in_timezone("America/New_York");
        // Spring forward: 02:30 on 2024-03-10 does not exist.
        let spring: Vec<_> = next_fire_times(&schedule, utc(2024, 3, 10, 5, 0), Some(2))
            .unwrap()
            .collect();
        assert_eq!(spring, vec![utc(2024, 3, 10, 6, 30), utc(2024, 3, 11, 5, 30)]);

        // Fall back: 01:30 happens twice but fires once.
        let fall: Vec<_> = next_fire_times(&schedule, utc(2024, 11, 3, 4, 0), Some(3))
            .unwrap()
            .collect();
        assert_eq!(
            fall,
            vec![utc(2024, 11, 3, 5, 30), utc(2024, 11, 3, 7, 30), utc(2024, 11, 4, 6, 30)]
        );
    }

    #[test]
    fn test_rrule_uses_tzid_when_schedule_has_none() {
        let schedule =
            Schedule::rrule("DTSTART;TZID=Europe/Paris:20240101T090000\nRRULE:FREQ=DAILY");
        let first = next_fire_time(&schedule, utc(2024, 6, 1, 0, 0)).unwrap();
        // Paris is UTC+2 in June.
        assert_eq!(first, Some(utc(2024, 6, 1, 7, 0)));
    }

    #[test]
    fn test_rrule_count_exhausts() {
        let schedule = Schedule::rrule("DTSTART:20240101T000000\nRRULE:FREQ=DAILY;COUNT=2");
        let times: Vec<_> = next_fire_times(&schedule, utc(2023, 1, 1, 0, 0), None)
            .unwrap()
            .collect();
        assert_eq!(times.len(), 2);
    }

    #[test]
    fn test_validate() {
        assert!(validate(&Schedule::interval(0, Utc::now())).is_err());
        assert!(validate(&Schedule::cron("0 0 31 2 *")).is_err());
        assert!(validate(&Schedule::cron("0 9 * * MON").in_timezone("Nowhere/City")).is_err());
        assert!(validate(&Schedule::rrule("FREQ=YEARLY;BYMONTH=2;BYMONTHDAY=31")).is_err());
        assert!(validate(&Schedule::cron("0 9 * * MON-FRI").in_timezone("Asia/Tokyo")).is_ok());
    }

    #[test]
    fn test_upcoming_respects_horizon() {
        let schedule = Schedule::interval(3600, utc(2024, 1, 1, 0, 0));
        let times = upcoming(&schedule, utc(2024, 1, 1, 0, 0), 100, Duration::hours(5)).unwrap();
        assert_eq!(times.len(), 5);
    }
}
