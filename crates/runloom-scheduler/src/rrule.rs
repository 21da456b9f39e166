//! RFC 5545 recurrence rules, the subset schedules need.
//!
//! Accepted input is an optional `DTSTART` line followed by an `RRULE` line
//! (the `RRULE:` prefix may be omitted). Supported parts: FREQ, INTERVAL,
//! COUNT, UNTIL, BYMONTH, BYMONTHDAY, BYDAY (with ordinals), BYHOUR,
//! BYMINUTE, BYSECOND and WKST. Anything else is rejected rather than
//! silently ignored.
//!
//! Expansion yields naive wall-clock times in ascending order; the schedule
//! layer resolves them in a timezone.

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use std::collections::{BTreeSet, VecDeque};

use runloom_core::error::{Result, RunloomError};

use crate::tz::to_local;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Frequency {
    Yearly,
    Monthly,
    Weekly,
    Daily,
    Hourly,
    Minutely,
}

impl Frequency {
    /// Consecutive empty periods after which expansion gives up.
    fn empty_period_limit(self) -> u32 {
        match self {
            Frequency::Yearly => 400,
            Frequency::Monthly => 4_800,
            Frequency::Weekly => 5_300,
            Frequency::Daily => 36_600,
            Frequency::Hourly | Frequency::Minutely => 3_660,
        }
    }
}

/// `BYDAY` entry such as `MO`, `2TU` or `-1FR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekdayNum {
    pub ordinal: Option<i32>,
    pub weekday: Weekday,
}

/// A `DTSTART` or `UNTIL` value: floating local time or an absolute UTC instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTime {
    Local(NaiveDateTime),
    Utc(DateTime<Utc>),
}

impl RuleTime {
    fn in_zone(self, tz: &Tz) -> NaiveDateTime {
        match self {
            RuleTime::Local(naive) => naive,
            RuleTime::Utc(instant) => to_local(tz, instant),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RRule {
    pub dtstart: RuleTime,
    /// `TZID` parameter of the `DTSTART` line, if any.
    pub tzid: Option<String>,
    pub freq: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    pub until: Option<RuleTime>,
    pub by_month: Vec<u32>,
    pub by_month_day: Vec<i32>,
    pub by_day: Vec<WeekdayNum>,
    pub by_hour: Vec<u32>,
    pub by_minute: Vec<u32>,
    pub by_second: Vec<u32>,
    pub wkst: Weekday,
}

fn invalid(reason: impl std::fmt::Display) -> RunloomError {
    RunloomError::InvalidScheduleSpec(format!("rrule: {reason}"))
}

fn default_dtstart() -> NaiveDateTime {
    NaiveDateTime::new(
        NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN),
        NaiveTime::MIN,
    )
}

fn parse_rule_time(value: &str) -> Result<RuleTime> {
    let (body, utc) = match value.strip_suffix('Z') {
        Some(body) => (body, true),
        None => (value, false),
    };
    let naive = if body.contains('T') {
        NaiveDateTime::parse_from_str(body, "%Y%m%dT%H%M%S")
            .map_err(|e| invalid(format!("bad date-time '{value}': {e}")))?
    } else {
        NaiveDate::parse_from_str(body, "%Y%m%d")
            .map_err(|e| invalid(format!("bad date '{value}': {e}")))?
            .and_time(NaiveTime::MIN)
    };
    Ok(if utc {
        RuleTime::Utc(naive.and_utc())
    } else {
        RuleTime::Local(naive)
    })
}

fn parse_weekday(code: &str) -> Result<Weekday> {
    match code {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        other => Err(invalid(format!("bad weekday '{other}'"))),
    }
}

fn parse_weekday_num(item: &str) -> Result<WeekdayNum> {
    let item = item.trim();
    if item.len() < 2 {
        return Err(invalid(format!("bad BYDAY entry '{item}'")));
    }
    let (ordinal, code) = item.split_at(item.len() - 2);
    let weekday = parse_weekday(code)?;
    let ordinal = if ordinal.is_empty() {
        None
    } else {
        let n: i32 = ordinal
            .trim_start_matches('+')
            .parse()
            .map_err(|_| invalid(format!("bad BYDAY ordinal '{item}'")))?;
        if n == 0 || n.abs() > 53 {
            return Err(invalid(format!("BYDAY ordinal out of range in '{item}'")));
        }
        Some(n)
    };
    Ok(WeekdayNum { ordinal, weekday })
}

fn parse_list<T>(value: &str, name: &str, parse: impl Fn(i64) -> Option<T>) -> Result<Vec<T>> {
    value
        .split(',')
        .map(|item| {
            item.trim()
                .parse::<i64>()
                .ok()
                .and_then(&parse)
                .ok_or_else(|| invalid(format!("bad {name} value '{item}'")))
        })
        .collect()
}

fn in_range(lo: i64, hi: i64) -> impl Fn(i64) -> Option<u32> {
    move |n| (lo..=hi).contains(&n).then_some(n as u32)
}

impl RRule {
    pub fn parse(text: &str) -> Result<Self> {
        let mut dtstart = None;
        let mut tzid = None;
        let mut rule_line = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let upper = line.to_ascii_uppercase();
            if upper.starts_with("DTSTART") {
                // DTSTART[;TZID=Zone]:VALUE
                let (params, value) = line["DTSTART".len()..]
                    .split_once(':')
                    .ok_or_else(|| invalid(format!("bad DTSTART line '{line}'")))?;
                for param in params.split(';').filter(|p| !p.is_empty()) {
                    if let Some((key, zone)) = param.split_once('=') {
                        if key.eq_ignore_ascii_case("TZID") {
                            tzid = Some(zone.to_string());
                        }
                    }
                }
                dtstart = Some(parse_rule_time(&value.to_ascii_uppercase())?);
            } else if let Some(rest) = upper.strip_prefix("RRULE:") {
                rule_line = Some(rest.to_string());
            } else if upper.starts_with("FREQ=") || upper.contains(";FREQ=") {
                rule_line = Some(upper);
            } else {
                return Err(invalid(format!("unsupported line '{line}'")));
            }
        }

        let rule_line = rule_line.ok_or_else(|| invalid("missing RRULE"))?;
        let mut rule = RRule {
            dtstart: dtstart.unwrap_or(RuleTime::Local(default_dtstart())),
            tzid,
            freq: Frequency::Daily,
            interval: 1,
            count: None,
            until: None,
            by_month: Vec::new(),
            by_month_day: Vec::new(),
            by_day: Vec::new(),
            by_hour: Vec::new(),
            by_minute: Vec::new(),
            by_second: Vec::new(),
            wkst: Weekday::Mon,
        };
        let mut freq = None;

        for part in rule_line.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(format!("bad rule part '{part}'")))?;
            match key {
                "FREQ" => {
                    freq = Some(match value {
                        "YEARLY" => Frequency::Yearly,
                        "MONTHLY" => Frequency::Monthly,
                        "WEEKLY" => Frequency::Weekly,
                        "DAILY" => Frequency::Daily,
                        "HOURLY" => Frequency::Hourly,
                        "MINUTELY" => Frequency::Minutely,
                        other => return Err(invalid(format!("unsupported FREQ '{other}'"))),
                    })
                }
                "INTERVAL" => {
                    rule.interval = value
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n >= 1)
                        .ok_or_else(|| invalid(format!("bad INTERVAL '{value}'")))?;
                }
                "COUNT" => {
                    rule.count = Some(
                        value
                            .parse::<u32>()
                            .ok()
                            .filter(|n| *n >= 1)
                            .ok_or_else(|| invalid(format!("bad COUNT '{value}'")))?,
                    );
                }
                "UNTIL" => rule.until = Some(parse_rule_time(value)?),
                "BYMONTH" => rule.by_month = parse_list(value, "BYMONTH", in_range(1, 12))?,
                "BYMONTHDAY" => {
                    rule.by_month_day = parse_list(value, "BYMONTHDAY", |n| {
                        (n != 0 && n.abs() <= 31).then_some(n as i32)
                    })?
                }
                "BYDAY" => {
                    rule.by_day = value
                        .split(',')
                        .map(parse_weekday_num)
                        .collect::<Result<_>>()?
                }
                "BYHOUR" => rule.by_hour = parse_list(value, "BYHOUR", in_range(0, 23))?,
                "BYMINUTE" => rule.by_minute = parse_list(value, "BYMINUTE", in_range(0, 59))?,
                "BYSECOND" => rule.by_second = parse_list(value, "BYSECOND", in_range(0, 59))?,
                "WKST" => rule.wkst = parse_weekday(value)?,
                other => return Err(invalid(format!("unsupported rule part '{other}'"))),
            }
        }

        rule.freq = freq.ok_or_else(|| invalid("missing FREQ"))?;
        if rule.count.is_some() && rule.until.is_some() {
            return Err(invalid("COUNT and UNTIL are mutually exclusive"));
        }
        let ordinals = rule.by_day.iter().any(|d| d.ordinal.is_some());
        if ordinals && !matches!(rule.freq, Frequency::Monthly | Frequency::Yearly) {
            return Err(invalid("BYDAY ordinals need FREQ=MONTHLY or FREQ=YEARLY"));
        }
        if !rule.by_month_day.is_empty() && rule.freq == Frequency::Weekly {
            return Err(invalid("BYMONTHDAY is not allowed with FREQ=WEEKLY"));
        }
        for list in [
            &mut rule.by_month,
            &mut rule.by_hour,
            &mut rule.by_minute,
            &mut rule.by_second,
        ] {
            list.sort_unstable();
            list.dedup();
        }
        Ok(rule)
    }

    /// Occurrences in `tz`, ascending. With `from` set and no COUNT,
    /// whole periods before `from` are skipped.
    pub fn occurrences(&self, tz: &Tz, from: Option<NaiveDateTime>) -> Occurrences {
        let dtstart = self.dtstart.in_zone(tz);
        let mut period = 0;
        if let (Some(from), None) = (from, self.count) {
            period = first_useful_period(self.freq, self.interval, dtstart, from);
        }
        Occurrences {
            rule: self.clone(),
            dtstart,
            until: self.until.map(|u| u.in_zone(tz)),
            period,
            buffer: VecDeque::new(),
            emitted: 0,
            empty_streak: 0,
            done: false,
        }
    }
}

fn month_index(date: NaiveDate) -> i64 {
    date.year() as i64 * 12 + date.month0() as i64
}

fn week_start(date: NaiveDate, wkst: Weekday) -> NaiveDate {
    let back = (7 + date.weekday().num_days_from_monday() as i64
        - wkst.num_days_from_monday() as i64)
        % 7;
    date - Duration::days(back)
}

/// A period index safely before the one containing `from`.
fn first_useful_period(
    freq: Frequency,
    interval: u32,
    dtstart: NaiveDateTime,
    from: NaiveDateTime,
) -> u64 {
    if from <= dtstart {
        return 0;
    }
    let interval = interval as i64;
    let elapsed = match freq {
        Frequency::Yearly => (from.year() - dtstart.year()) as i64 / interval,
        Frequency::Monthly => (month_index(from.date()) - month_index(dtstart.date())) / interval,
        Frequency::Weekly => (from.date() - dtstart.date()).num_days() / (7 * interval),
        Frequency::Daily => (from.date() - dtstart.date()).num_days() / interval,
        Frequency::Hourly | Frequency::Minutely => (from.date() - dtstart.date()).num_days(),
    };
    (elapsed - 1).max(0) as u64
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Days of `scope` selected by BYDAY, ordinals counted within `scope`.
fn select_by_day(scope: &[NaiveDate], by_day: &[WeekdayNum]) -> BTreeSet<NaiveDate> {
    let mut selected = BTreeSet::new();
    for entry in by_day {
        let matching: Vec<NaiveDate> = scope
            .iter()
            .copied()
            .filter(|d| d.weekday() == entry.weekday)
            .collect();
        match entry.ordinal {
            None => selected.extend(matching),
            Some(n) if n > 0 => selected.extend(matching.get(n as usize - 1)),
            Some(n) => {
                let back = (-n) as usize;
                if back <= matching.len() {
                    selected.insert(matching[matching.len() - back]);
                }
            }
        }
    }
    selected
}

fn month_day_matches(date: NaiveDate, by_month_day: &[i32]) -> bool {
    let len = days_in_month(date.year(), date.month()) as i32;
    let day = date.day() as i32;
    by_month_day
        .iter()
        .any(|&md| if md > 0 { md == day } else { len + md + 1 == day })
}

fn month_days(year: i32, month: u32) -> Vec<NaiveDate> {
    (1..=days_in_month(year, month))
        .filter_map(|d| NaiveDate::from_ymd_opt(year, month, d))
        .collect()
}

/// Ascending occurrence stream.
#[derive(Debug, Clone)]
pub struct Occurrences {
    rule: RRule,
    dtstart: NaiveDateTime,
    until: Option<NaiveDateTime>,
    period: u64,
    buffer: VecDeque<NaiveDateTime>,
    emitted: u32,
    empty_streak: u32,
    done: bool,
}

impl Occurrences {
    /// Candidate days for the current period, ascending.
    fn period_days(&self) -> Option<Vec<NaiveDate>> {
        let rule = &self.rule;
        let start = self.dtstart.date();
        let step = self.period as i64 * rule.interval as i64;
        let month_ok =
            |d: &NaiveDate| rule.by_month.is_empty() || rule.by_month.contains(&d.month());

        let days = match rule.freq {
            Frequency::Yearly => {
                let year = i32::try_from(start.year() as i64 + step).ok()?;
                NaiveDate::from_ymd_opt(year, 1, 1)?;
                if rule.by_month.is_empty()
                    && rule.by_month_day.is_empty()
                    && !rule.by_day.is_empty()
                {
                    let scope: Vec<NaiveDate> =
                        (1..=12).flat_map(|m| month_days(year, m)).collect();
                    select_by_day(&scope, &rule.by_day).into_iter().collect()
                } else {
                    let months: Vec<u32> = if !rule.by_month.is_empty() {
                        rule.by_month.clone()
                    } else if rule.by_month_day.is_empty() {
                        vec![start.month()]
                    } else {
                        (1..=12).collect()
                    };
                    months
                        .into_iter()
                        .flat_map(|m| self.days_in_month_scope(year, m))
                        .collect()
                }
            }
            Frequency::Monthly => {
                let idx = month_index(start) + step;
                let year = i32::try_from(idx.div_euclid(12)).ok()?;
                let month = idx.rem_euclid(12) as u32 + 1;
                NaiveDate::from_ymd_opt(year, month, 1)?;
                if !rule.by_month.is_empty() && !rule.by_month.contains(&month) {
                    Vec::new()
                } else {
                    self.days_in_month_scope(year, month)
                }
            }
            Frequency::Weekly => {
                let first =
                    week_start(start, rule.wkst).checked_add_signed(Duration::days(7 * step))?;
                (0..7)
                    .filter_map(|i| first.checked_add_signed(Duration::days(i)))
                    .filter(month_ok)
                    .filter(|d| {
                        if rule.by_day.is_empty() {
                            d.weekday() == start.weekday()
                        } else {
                            rule.by_day.iter().any(|w| w.weekday == d.weekday())
                        }
                    })
                    .collect()
            }
            Frequency::Daily | Frequency::Hourly | Frequency::Minutely => {
                let offset = if rule.freq == Frequency::Daily { step } else { self.period as i64 };
                let day = start.checked_add_signed(Duration::days(offset))?;
                let keep = month_ok(&day)
                    && (rule.by_month_day.is_empty() || month_day_matches(day, &rule.by_month_day))
                    && (rule.by_day.is_empty()
                        || rule.by_day.iter().any(|w| w.weekday == day.weekday()));
                if keep { vec![day] } else { Vec::new() }
            }
        };
        Some(days)
    }

    /// Days of one month picked by BYMONTHDAY and BYDAY, or DTSTART's day.
    fn days_in_month_scope(&self, year: i32, month: u32) -> Vec<NaiveDate> {
        let rule = &self.rule;
        let scope = month_days(year, month);
        if rule.by_month_day.is_empty() && rule.by_day.is_empty() {
            return scope
                .into_iter()
                .filter(|d| d.day() == self.dtstart.day())
                .collect();
        }
        let by_day = (!rule.by_day.is_empty()).then(|| select_by_day(&scope, &rule.by_day));
        scope
            .into_iter()
            .filter(|d| rule.by_month_day.is_empty() || month_day_matches(*d, &rule.by_month_day))
            .filter(|d| by_day.as_ref().is_none_or(|set| set.contains(d)))
            .collect()
    }

    /// Times of day for one candidate day, ascending.
    fn times_for(&self, day: NaiveDate) -> Vec<NaiveDateTime> {
        let rule = &self.rule;
        let start = self.dtstart;
        let or_start = |list: &[u32], value: u32| {
            if list.is_empty() { vec![value] } else { list.to_vec() }
        };
        let seconds = or_start(&rule.by_second, start.second());
        let interval = rule.interval as i64;
        let day_start = day.and_time(NaiveTime::MIN);

        let hour_minutes: Vec<(u32, u32)> = match rule.freq {
            Frequency::Hourly => {
                let anchor = start.date().and_hms_opt(start.hour(), 0, 0).unwrap_or(start);
                let minutes = or_start(&rule.by_minute, start.minute());
                (0..24u32)
                    .filter(|h| rule.by_hour.is_empty() || rule.by_hour.contains(h))
                    .filter(|h| {
                        let at = day_start + Duration::hours(*h as i64);
                        (at - anchor).num_hours().rem_euclid(interval) == 0
                    })
                    .flat_map(|h| minutes.iter().map(move |m| (h, *m)))
                    .collect()
            }
            Frequency::Minutely => {
                let anchor = start
                    .date()
                    .and_hms_opt(start.hour(), start.minute(), 0)
                    .unwrap_or(start);
                (0..24u32)
                    .filter(|h| rule.by_hour.is_empty() || rule.by_hour.contains(h))
                    .flat_map(|h| (0..60u32).map(move |m| (h, m)))
                    .filter(|(_, m)| rule.by_minute.is_empty() || rule.by_minute.contains(m))
                    .filter(|(h, m)| {
                        let at = day_start + Duration::minutes((*h * 60 + *m) as i64);
                        (at - anchor).num_minutes().rem_euclid(interval) == 0
                    })
                    .collect()
            }
            _ => {
                let hours = or_start(&rule.by_hour, start.hour());
                let minutes = or_start(&rule.by_minute, start.minute());
                hours
                    .iter()
                    .flat_map(|h| minutes.iter().map(move |m| (*h, *m)))
                    .collect()
            }
        };

        hour_minutes
            .into_iter()
            .flat_map(|(h, m)| seconds.iter().filter_map(move |s| day.and_hms_opt(h, m, *s)))
            .collect()
    }

    fn fill(&mut self) {
        while self.buffer.is_empty() && !self.done {
            let Some(days) = self.period_days() else {
                self.done = true;
                return;
            };
            self.period += 1;
            let mut found = false;
            for day in days {
                for at in self.times_for(day) {
                    if at < self.dtstart {
                        continue;
                    }
                    found = true;
                    self.buffer.push_back(at);
                }
            }
            if found {
                self.empty_streak = 0;
            } else {
                self.empty_streak += 1;
                if self.empty_streak > self.rule.freq.empty_period_limit() {
                    self.done = true;
                }
            }
        }
    }
}

impl Iterator for Occurrences {
    type Item = NaiveDateTime;

    fn next(&mut self) -> Option<NaiveDateTime> {
        if self.done {
            return None;
        }
        if self.rule.count.is_some_and(|count| self.emitted >= count) {
            self.done = true;
            return None;
        }
        self.fill();
        let next = self.buffer.pop_front()?;
        if self.until.is_some_and(|until| next > until) {
            self.done = true;
            self.buffer.clear();
            return None;
        }
        self.emitted += 1;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn expand(text: &str, n: usize) -> Vec<NaiveDateTime> {
        RRule::parse(text)
            .unwrap()
            .occurrences(&Tz::UTC, None)
            .take(n)
            .collect()
    }

    #[test]
    fn test_daily_with_count() {
        let times = expand("DTSTART:20240101T090000\nRRULE:FREQ=DAILY;COUNT=3", 10);
        assert_eq!(times, vec![at(2024, 1, 1, 9, 0), at(2024, 1, 2, 9, 0), at(2024, 1, 3, 9, 0)]);
    }

    #[test]
    fn test_weekly_by_day() {
        let times = expand(
            "DTSTART:20240101T083000\nRRULE:FREQ=WEEKLY;BYDAY=MO,WE,FR",
            4,
        );
        assert_eq!(
            times,
            vec![
                at(2024, 1, 1, 8, 30),
                at(2024, 1, 3, 8, 30),
                at(2024, 1, 5, 8, 30),
                at(2024, 1, 8, 8, 30),
            ]
        );
    }

    #[test]
    fn test_monthly_last_friday() {
        let times = expand("DTSTART:20240101T170000\nRRULE:FREQ=MONTHLY;BYDAY=-1FR", 3);
        assert_eq!(
            times,
            vec![at(2024, 1, 26, 17, 0), at(2024, 2, 23, 17, 0), at(2024, 3, 29, 17, 0)]
        );
    }

    #[test]
    fn test_monthly_negative_month_day() {
        let times = expand("DTSTART:20240101T000000\nRRULE:FREQ=MONTHLY;BYMONTHDAY=-1", 2);
        assert_eq!(times, vec![at(2024, 1, 31, 0, 0), at(2024, 2, 29, 0, 0)]);
    }

    #[test]
    fn test_monthly_31st_skips_short_months() {
        let times = expand("DTSTART:20240131T000000\nRRULE:FREQ=MONTHLY", 3);
        assert_eq!(
            times,
            vec![at(2024, 1, 31, 0, 0), at(2024, 3, 31, 0, 0), at(2024, 5, 31, 0, 0)]
        );
    }

    #[test]
    fn test_yearly_thanksgiving() {
        let times = expand("DTSTART:20240101T120000\nRRULE:FREQ=YEARLY;BYMONTH=11;BYDAY=4TH", 2);
        assert_eq!(times, vec![at(2024, 11, 28, 12, 0), at(2025, 11, 27, 12, 0)]);
    }

    #[test]
    fn test_hourly_interval_with_by_hour() {
        let times = expand(
            "DTSTART:20240101T000000\nRRULE:FREQ=HOURLY;INTERVAL=6;BYMINUTE=15",
            5,
        );
        assert_eq!(
            times,
            vec![
                at(2024, 1, 1, 0, 15),
                at(2024, 1, 1, 6, 15),
                at(2024, 1, 1, 12, 15),
                at(2024, 1, 1, 18, 15),
                at(2024, 1, 2, 0, 15),
            ]
        );
    }

    #[test]
    fn test_until_is_inclusive() {
        let times = expand(
            "DTSTART:20240101T090000\nRRULE:FREQ=DAILY;UNTIL=20240103T090000",
            10,
        );
        assert_eq!(times.len(), 3);
    }

    #[test]
    fn test_bare_rule_defaults_dtstart_to_epoch() {
        let rule = RRule::parse("FREQ=DAILY;BYHOUR=9").unwrap();
        assert_eq!(rule.dtstart, RuleTime::Local(at(1970, 1, 1, 0, 0)));
    }

    #[test]
    fn test_skip_ahead_matches_full_expansion() {
        let rule =
            RRule::parse("DTSTART:20000101T000000\nRRULE:FREQ=WEEKLY;INTERVAL=3;BYDAY=TU").unwrap();
        let from = at(2024, 6, 1, 0, 0);
        let skipped: Vec<_> = rule
            .occurrences(&Tz::UTC, Some(from))
            .filter(|t| *t > from)
            .take(3)
            .collect();
        let full: Vec<_> = rule.occurrences(&Tz::UTC, None).filter(|t| *t > from).take(3).collect();
        assert_eq!(skipped, full);
    }

    #[test]
    fn test_tzid_keeps_case() {
        let rule =
            RRule::parse("DTSTART;TZID=Europe/Paris:20240101T090000\nRRULE:FREQ=DAILY").unwrap();
        assert_eq!(rule.tzid.as_deref(), Some("Europe/Paris"));
    }

    #[test]
    fn test_rejects_unsupported_parts() {
        for bad in [
            "FREQ=SECONDLY",
            "FREQ=DAILY;BYSETPOS=1",
            "FREQ=DAILY;BYWEEKNO=3",
            "FREQ=DAILY;COUNT=2;UNTIL=20240101",
            "FREQ=WEEKLY;BYDAY=2MO",
            "FREQ=DAILY;INTERVAL=0",
            "FREQ=MONTHLY;BYMONTHDAY=32",
            "BYDAY=MO",
            "EXDATE:20240101",
        ] {
            assert!(RRule::parse(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn test_impossible_rule_terminates() {
        let times = expand("DTSTART:20240101T000000\nRRULE:FREQ=YEARLY;BYMONTH=2;BYMONTHDAY=30", 1);
        assert!(times.is_empty());
    }
}
