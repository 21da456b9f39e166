//! Schedule specifications. Evaluation lives in `runloom-scheduler`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed period from an anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSchedule {
    pub interval_seconds: u64,
    pub anchor_date: DateTime<Utc>,
    /// IANA name. Whole-day intervals step in this zone's wall clock.
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
    /// OR the day-of-month and day-of-week fields when both are restricted.
    #[serde(default = "bool_true")]
    pub day_or: bool,
}

fn bool_true() -> bool { true }

/// RFC 5545 recurrence rule, optionally preceded by a `DTSTART` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RRuleSchedule {
    pub rrule: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

/// A specification for generating future run times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Interval(IntervalSchedule),
    Cron(CronSchedule),
    #[serde(rename = "rrule")]
    RRule(RRuleSchedule),
}

impl Schedule {
    pub fn interval(interval_seconds: u64, anchor_date: DateTime<Utc>) -> Self {
        Schedule::Interval(IntervalSchedule {
            interval_seconds,
            anchor_date,
            timezone: None,
        })
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron(CronSchedule {
            cron: expression.into(),
            timezone: None,
            day_or: true,
        })
    }

    pub fn rrule(rule: impl Into<String>) -> Self {
        Schedule::RRule(RRuleSchedule {
            rrule: rule.into(),
            timezone: None,
        })
    }

    pub fn in_timezone(mut self, tz: impl Into<String>) -> Self {
        let tz = Some(tz.into());
        match &mut self {
            Schedule::Interval(s) => s.timezone = tz,
            Schedule::Cron(s) => s.timezone = tz,
            Schedule::RRule(s) => s.timezone = tz,
        }
        self
    }

    pub fn timezone(&self) -> Option<&str> {
        match self {
            Schedule::Interval(s) => s.timezone.as_deref(),
            Schedule::Cron(s) => s.timezone.as_deref(),
            Schedule::RRule(s) => s.timezone.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_day_or_defaults_true() {
        let schedule: Schedule =
            serde_json::from_str(r#"{"type":"cron","cron":"0 9 * * MON"}"#).unwrap();
        match schedule {
            Schedule::Cron(c) => assert!(c.day_or),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_in_timezone() {
        let s = Schedule::rrule("FREQ=DAILY").in_timezone("Europe/Paris");
        assert_eq!(s.timezone(), Some("Europe/Paris"));
    }
}
