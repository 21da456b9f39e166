//! Run history: bucketed state counts and time-in-state, folded from the
//! transition log.
//!
//! A state lasts from its own timestamp until the run's next transition.
//! Terminal states last no time at all. A run whose latest state is still
//! open is treated as ending at the newest timestamp anywhere in the log, so
//! the same log always folds to the same buckets.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use runloom_core::error::{Result, RunloomError};
use runloom_core::run::RunRef;
use runloom_core::state::StateType;
use runloom_core::transition::TransitionRecord;

/// Upper bound on buckets for one `run_history` query.
pub const MAX_HISTORY_BUCKETS: i64 = 500;

/// Upper bound on buckets `aggregate` may produce for a whole log.
pub const MAX_AGGREGATE_BUCKETS: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Transitions into each state type that happened in this bucket.
    pub counts: BTreeMap<StateType, u64>,
    /// Milliseconds spent in each state type inside this bucket.
    pub durations_ms: BTreeMap<StateType, i64>,
}

impl HistoryBucket {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

#[derive(Debug, Default)]
struct Accum {
    counts: BTreeMap<StateType, u64>,
    durations_ms: BTreeMap<StateType, i64>,
}

fn width_ms(width: Duration) -> Result<i64> {
    let ms = width.num_milliseconds();
    if ms <= 0 {
        return Err(RunloomError::InvalidBucketWidth(format!(
            "bucket width must be positive, got {width}"
        )));
    }
    Ok(ms)
}

/// Fold `log` into buckets `origin + k * width`, keyed by `k`. Durations
/// are clipped to `[clip_from, clip_to)`.
fn fold(
    log: &[TransitionRecord],
    origin: i64,
    width: i64,
    clip: Option<(i64, i64)>,
) -> BTreeMap<i64, Accum> {
    let mut buckets: BTreeMap<i64, Accum> = BTreeMap::new();
    let Some(latest) = log.iter().map(|r| r.timestamp()).max() else {
        return buckets;
    };
    let latest = latest.timestamp_millis();

    let mut per_run: BTreeMap<&RunRef, Vec<&TransitionRecord>> = BTreeMap::new();
    for record in log {
        per_run.entry(&record.run).or_default().push(record);
    }

    for records in per_run.values_mut() {
        records.sort_by_key(|r| (r.timestamp(), r.version));
        for (i, record) in records.iter().enumerate() {
            let state_type = record.state.state_type;
            let at = record.timestamp().timestamp_millis();

            let inside = clip.is_none_or(|(from, to)| at >= from && at < to);
            if inside {
                let idx = (at - origin).div_euclid(width);
                *buckets.entry(idx).or_default().counts.entry(state_type).or_default() += 1;
            }

            if state_type.is_terminal() {
                continue;
            }
            let mut end = records
                .get(i + 1)
                .map(|next| next.timestamp().timestamp_millis())
                .unwrap_or(latest);
            let mut begin = at;
            if let Some((from, to)) = clip {
                begin = begin.max(from);
                end = end.min(to);
            }
            spread(&mut buckets, state_type, begin, end, origin, width);
        }
    }
    buckets
}

/// Add `[begin, end)` to every bucket it overlaps.
fn spread(
    buckets: &mut BTreeMap<i64, Accum>,
    state_type: StateType,
    begin: i64,
    end: i64,
    origin: i64,
    width: i64,
) {
    if end <= begin {
        return;
    }
    let first = (begin - origin).div_euclid(width);
    let last = (end - 1 - origin).div_euclid(width);
    for idx in first..=last {
        let bucket_start = origin + idx * width;
        let overlap = end.min(bucket_start + width) - begin.max(bucket_start);
        if overlap > 0 {
            *buckets
                .entry(idx)
                .or_default()
                .durations_ms
                .entry(state_type)
                .or_default() += overlap;
        }
    }
}

fn bucket_at(origin: i64, width: i64, idx: i64, accum: Accum) -> Option<HistoryBucket> {
    let start = origin.checked_add(idx.checked_mul(width)?)?;
    Some(HistoryBucket {
        start: DateTime::from_timestamp_millis(start)?,
        end: DateTime::from_timestamp_millis(start.checked_add(width)?)?,
        counts: accum.counts,
        durations_ms: accum.durations_ms,
    })
}

/// Epoch-aligned buckets from the first to the last one the log touches,
/// empty ones in between included. A width too fine for the log's time span
/// (more than [`MAX_AGGREGATE_BUCKETS`]) is rejected before anything is
/// folded.
pub fn aggregate(log: &[TransitionRecord], bucket_width: Duration) -> Result<Vec<HistoryBucket>> {
    let width = width_ms(bucket_width)?;
    let stamps = log.iter().map(|r| r.timestamp().timestamp_millis());
    if let (Some(earliest), Some(latest)) = (stamps.clone().min(), stamps.max()) {
        let span = latest.div_euclid(width) - earliest.div_euclid(width) + 1;
        if span > MAX_AGGREGATE_BUCKETS {
            return Err(RunloomError::InvalidBucketWidth(format!(
                "{span} buckets needed for this log; at most {MAX_AGGREGATE_BUCKETS} allowed"
            )));
        }
    }
    let mut touched = fold(log, 0, width, None);
    let (Some(&first), Some(&last)) = (touched.keys().next(), touched.keys().next_back()) else {
        return Ok(Vec::new());
    };
    Ok((first..=last)
        .filter_map(|idx| bucket_at(0, width, idx, touched.remove(&idx).unwrap_or_default()))
        .collect())
}

/// Buckets of `interval` covering `[start, end)`, aligned to `start`,
/// empty ones included.
pub fn run_history(
    log: &[TransitionRecord],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: Duration,
) -> Result<Vec<HistoryBucket>> {
    let width = width_ms(interval)?;
    let origin = start.timestamp_millis();
    let until = end.timestamp_millis();
    if until <= origin {
        return Ok(Vec::new());
    }
    let count = (until - origin + width - 1) / width;
    if count > MAX_HISTORY_BUCKETS {
        return Err(RunloomError::InvalidBucketWidth(format!(
            "{count} buckets requested; at most {MAX_HISTORY_BUCKETS} allowed"
        )));
    }
    let mut touched = fold(log, origin, width, Some((origin, until)));
    Ok((0..count)
        .filter_map(|idx| {
            bucket_at(origin, width, idx, touched.remove(&idx).unwrap_or_default())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use runloom_core::ids::FlowRunId;
    use runloom_core::state::State;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn record(run: &str, state: State, version: u64) -> TransitionRecord {
        TransitionRecord {
            run: RunRef::Flow(FlowRunId::new(run)),
            from: None,
            state,
            version,
        }
    }

    fn sample_log() -> Vec<TransitionRecord> {
        vec![
            record("a", State::pending(t(0)), 1),
            record("a", State::running(t(5)), 2),
            record("a", State::completed(t(25)), 3),
            record("b", State::pending(t(12)), 1),
        ]
    }

    #[test]
    fn test_zero_width_rejected() {
        assert!(matches!(
            aggregate(&sample_log(), Duration::zero()),
            Err(RunloomError::InvalidBucketWidth(_))
        ));
    }

    #[test]
    fn test_counts_sum_to_log_length() {
        let log = sample_log();
        let buckets = aggregate(&log, Duration::minutes(10)).unwrap();
        let total: u64 = buckets.iter().map(HistoryBucket::total).sum();
        assert_eq!(total, log.len() as u64);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].start, t(0));
    }

    #[test]
    fn test_durations_split_across_buckets() {
        let buckets = aggregate(&sample_log(), Duration::minutes(10)).unwrap();
        // Running 00:05-00:25 spans three buckets: 5 + 10 + 5 minutes.
        let running: Vec<i64> = buckets
            .iter()
            .map(|b| b.durations_ms.get(&StateType::Running).copied().unwrap_or(0))
            .collect();
        assert_eq!(running, vec![300_000, 600_000, 300_000]);
        // Run b stays Pending until the newest timestamp in the log (00:25).
        let pending_b: i64 = buckets
            .iter()
            .skip(1)
            .map(|b| b.durations_ms.get(&StateType::Pending).copied().unwrap_or(0))
            .sum();
        assert_eq!(pending_b, 13 * 60_000);
        // Completed is terminal and lasts no time.
        assert!(buckets.iter().all(|b| !b.durations_ms.contains_key(&StateType::Completed)));
    }

    #[test]
    fn test_aggregate_is_idempotent_and_order_free() {
        let log = sample_log();
        let mut reversed = log.clone();
        reversed.reverse();
        assert_eq!(
            aggregate(&log, Duration::minutes(7)).unwrap(),
            aggregate(&reversed, Duration::minutes(7)).unwrap()
        );
    }

    #[test]
    fn test_aggregate_caps_bucket_count() {
        let year = vec![
            record("a", State::pending(t(0)), 1),
            record("a", State::running(t(365 * 24 * 60)), 2),
        ];
        assert!(matches!(
            aggregate(&year, Duration::seconds(1)),
            Err(RunloomError::InvalidBucketWidth(_))
        ));
        let daily = aggregate(&year, Duration::days(1)).unwrap();
        assert_eq!(daily.len(), 366);
        assert_eq!(daily.iter().map(HistoryBucket::total).sum::<u64>(), 2);
    }

    #[test]
    fn test_run_history_fills_range() {
        let buckets = run_history(&sample_log(), t(-30), t(30), Duration::minutes(15)).unwrap();
        assert_eq!(buckets.len(), 4);
        assert_eq!(buckets[0].total(), 0);
        assert_eq!(buckets[2].counts.get(&StateType::Pending), Some(&2));
        assert_eq!(buckets[3].counts.get(&StateType::Completed), Some(&1));
    }

    #[test]
    fn test_run_history_bucket_cap() {
        assert!(run_history(&[], t(0), t(10_000), Duration::minutes(1)).is_err());
        assert!(run_history(&[], t(10), t(0), Duration::minutes(1)).unwrap().is_empty());
    }
}
