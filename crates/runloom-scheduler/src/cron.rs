//! Five-field cron expressions: "MIN HOUR DOM MON DOW".
//!
//! Each field accepts `*`, `N`, `A-B`, `*/S`, `A-B/S`, `A/S` and comma lists.
//! Months and weekdays also take three-letter names (JAN, MON), weekday `7`
//! is Sunday, and the `@yearly`/`@monthly`/`@weekly`/`@daily`/`@hourly`
//! macros expand to their usual five-field forms.
//!
//! Matching runs on naive wall-clock time; timezone handling is the caller's.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};

use runloom_core::error::{Result, RunloomError};

/// How far ahead a search may look before giving up. Nine years always
/// contains a leap day, even across a skipped century leap year.
const SEARCH_HORIZON_DAYS: i64 = 366 * 9;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression. Fields are bit sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn expand_macro(expression: &str) -> Option<&'static str> {
    match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let body = if trimmed.starts_with('@') {
            expand_macro(trimmed).ok_or_else(|| invalid(expression, "unknown macro"))?
        } else {
            trimmed
        };

        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(
                expression,
                "need 5 fields: MIN HOUR DOM MON DOW",
            ));
        }

        let minutes = parse_field(parts[0], 0, 59, None).map_err(|e| invalid(expression, &e))?;
        let hours = parse_field(parts[1], 0, 23, None).map_err(|e| invalid(expression, &e))?;
        let dom = parse_field(parts[2], 1, 31, None).map_err(|e| invalid(expression, &e))?;
        let months = parse_field(parts[3], 1, 12, Some((&MONTH_NAMES[..], 1)))
            .map_err(|e| invalid(expression, &e))?;
        // Weekdays parse over 0..=7 so that 7 can fold onto Sunday.
        let dow = parse_field(parts[4], 0, 7, Some((&WEEKDAY_NAMES[..], 0)))
            .map_err(|e| invalid(expression, &e))?;
        let dow = (dow & 0x7f) | ((dow >> 7) & 1);

        Ok(Self {
            minutes,
            hours: hours as u32,
            days_of_month: dom as u32,
            months: months as u16,
            days_of_week: dow as u8,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    fn month_matches(&self, month: u32) -> bool {
        self.months & (1 << month) != 0
    }

    fn hour_matches(&self, hour: u32) -> bool {
        self.hours & (1 << hour) != 0
    }

    fn minute_matches(&self, minute: u32) -> bool {
        self.minutes & (1 << minute) != 0
    }

    /// Day test. When both day fields are restricted, `day_or` decides
    /// whether either one suffices or both must hold.
    pub fn day_matches(&self, date: NaiveDate, day_or: bool) -> bool {
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) if day_or => dom || dow,
            _ => dom && dow,
        }
    }

    pub fn matches(&self, at: NaiveDateTime, day_or: bool) -> bool {
        self.month_matches(at.month())
            && self.day_matches(at.date(), day_or)
            && self.hour_matches(at.hour())
            && self.minute_matches(at.minute())
    }

    /// First matching minute strictly after `after`, or `None` if nothing
    /// matches within the search horizon.
    pub fn next_after(&self, after: NaiveDateTime, day_or: bool) -> Option<NaiveDateTime> {
        let floor = after.date().and_hms_opt(after.hour(), after.minute(), 0)?;
        let mut candidate = floor.checked_add_signed(Duration::minutes(1))?;
        let limit = after.date().checked_add_signed(Duration::days(SEARCH_HORIZON_DAYS))?;

        while candidate.date() <= limit {
            if !self.month_matches(candidate.month()) {
                candidate = first_of_next_month(candidate.date())?;
                continue;
            }
            if !self.day_matches(candidate.date(), day_or) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour_matches(candidate.hour()) {
                candidate = next_hour(candidate)?;
                continue;
            }
            if !self.minute_matches(candidate.minute()) {
                candidate = candidate.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return Some(candidate);
        }
        None
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn next_hour(at: NaiveDateTime) -> Option<NaiveDateTime> {
    let top = at.date().and_hms_opt(at.hour(), 0, 0)?;
    top.checked_add_signed(Duration::hours(1))
}

fn invalid(expression: &str, reason: &str) -> RunloomError {
    RunloomError::InvalidScheduleSpec(format!("cron '{expression}': {reason}"))
}

type Names<'a> = (&'a [&'a str], u32);

/// Parse one field into a bit set over `min..=max`.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<Names<'_>>,
) -> std::result::Result<u64, String> {
    let mut bits = 0u64;
    for item in field.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(format!("empty item in field '{field}'"));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad step '{step}' in '{item}'"))?;
                if step == 0 {
                    return Err(format!("zero step in '{item}'"));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names)?, parse_value(b, names)?)
        } else {
            let lo = parse_value(range, names)?;
            // "A/S" runs from A to the end of the field.
            (lo, if step.is_some() { max } else { lo })
        };

        if lo < min || hi > max {
            return Err(format!("'{item}' outside {min}-{max}"));
        }
        if lo > hi {
            return Err(format!("descending range '{item}'"));
        }

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            bits |= 1 << v;
        }
    }
    Ok(bits)
}

fn parse_value(token: &str, names: Option<Names<'_>>) -> std::result::Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return Ok(n);
    }
    if let Some((table, offset)) = names {
        let upper = token.to_ascii_uppercase();
        if let Some(idx) = table.iter().position(|name| *name == upper) {
            return Ok(idx as u32 + offset);
        }
    }
    Err(format!("bad value '{token}'"))
}
