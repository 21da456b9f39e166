//! Empirical policy evaluation: retry, pause or give up after a failure.

use chrono::Duration;
use rand::Rng;

use runloom_core::policy::{EmpiricalPolicy, MAX_RETRY_DELAY_SECS, RetryDelay};
use runloom_core::run::OrchestratedRun;

/// What to do with a run that just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after this delay.
    Retry(Duration),
    /// Retries are exhausted (or none were allowed); leave the run failed.
    GiveUp,
    /// Retries are exhausted; hold the next attempt for a human.
    Pause,
}

/// Failed/Crashed states seen across the whole retry group so far.
pub fn failures_in_lineage<R: OrchestratedRun>(run: &R) -> u32 {
    let own = run
        .history()
        .iter()
        .filter(|state| state.state_type.is_failure())
        .count() as u32;
    run.retry().prior_failures + own
}

/// Delay before retry number `retry` (1-based). Never longer than
/// `MAX_RETRY_DELAY_SECS` plus jitter, even for unvalidated policies.
pub fn retry_delay<G: Rng + ?Sized>(delay: &RetryDelay, retry: u32, rng: &mut G) -> Duration {
    let n = retry.max(1);
    match delay {
        RetryDelay::Fixed { seconds } => seconds_to_duration(*seconds),
        RetryDelay::Exponential {
            base_seconds,
            max_seconds,
            jitter_factor,
        } => {
            let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
            let capped = base_seconds
                .saturating_mul(factor)
                .min(*max_seconds)
                .min(MAX_RETRY_DELAY_SECS);
            let base = seconds_to_duration(capped);
            if *jitter_factor <= 0.0 || capped == 0 {
                return base;
            }
            let spread_ms = (capped as f64 * 1000.0 * jitter_factor.min(1.0)) as i64;
            let jitter = Duration::milliseconds(rng.gen_range(0..=spread_ms));
            base.checked_add(&jitter).unwrap_or(base)
        }
        RetryDelay::Sequence { seconds } => {
            let idx = (n as usize - 1).min(seconds.len().saturating_sub(1));
            seconds_to_duration(seconds.get(idx).copied().unwrap_or(0))
        }
    }
}

fn seconds_to_duration(seconds: u64) -> Duration {
    // Bounded by the clamp, so the conversion cannot fail.
    Duration::try_seconds(seconds.min(MAX_RETRY_DELAY_SECS) as i64).unwrap_or(Duration::zero())
}

/// [`should_retry_with_rng`] with the thread-local generator.
pub fn should_retry<R: OrchestratedRun>(policy: &EmpiricalPolicy, run: &R) -> RetryDecision {
    should_retry_with_rng(policy, run, &mut rand::thread_rng())
}

/// Decide after a failure. A run with no failures in its lineage gets
/// `GiveUp`: there is nothing to retry.
pub fn should_retry_with_rng<R: OrchestratedRun, G: Rng + ?Sized>(
    policy: &EmpiricalPolicy,
    run: &R,
    rng: &mut G,
) -> RetryDecision {
    let failures = failures_in_lineage(run);
    if failures == 0 {
        return RetryDecision::GiveUp;
    }
    let retries_used = failures - 1;
    if retries_used < policy.retries {
        RetryDecision::Retry(retry_delay(&policy.retry_delay, retries_used + 1, rng))
    } else if policy.pause_on_failure {
        RetryDecision::Pause
    } else {
        RetryDecision::GiveUp
    }
}
