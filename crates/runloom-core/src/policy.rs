//! Empirical policy: retry and pause configuration captured on each run.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunloomError};

/// Longest accepted retry delay: one year.
pub const MAX_RETRY_DELAY_SECS: u64 = 365 * 24 * 3600;

fn check_delay(what: &str, seconds: u64) -> Result<()> {
    if seconds > MAX_RETRY_DELAY_SECS {
        return Err(RunloomError::InvalidPolicy(format!(
            "{what} {seconds}s exceeds the {MAX_RETRY_DELAY_SECS}s limit"
        )));
    }
    Ok(())
}

/// How long to wait before the next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryDelay {
    /// Same delay before every retry.
    Fixed { seconds: u64 },
    /// `base * 2^(n-1)` for the n-th retry, capped at `max_seconds`, plus up to
    /// `jitter_factor` of that delay drawn at random.
    Exponential {
        base_seconds: u64,
        max_seconds: u64,
        #[serde(default)]
        jitter_factor: f64,
    },
    /// Explicit delay per retry; the last entry repeats.
    Sequence { seconds: Vec<u64> },
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Fixed { seconds: 0 }
    }
}

/// Retry/backoff/pause configuration. Consumed, never mutated, by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmpiricalPolicy {
    /// Retry limit; 0 disables retries.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_delay: RetryDelay,
    /// Pause for a human once retries are exhausted instead of giving up.
    #[serde(default)]
    pub pause_on_failure: bool,
}

impl EmpiricalPolicy {
    pub fn new(retries: u32, retry_delay: RetryDelay) -> Self {
        Self {
            retries,
            retry_delay,
            pause_on_failure: false,
        }
    }

    pub fn pausing(mut self) -> Self {
        self.pause_on_failure = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        match &self.retry_delay {
            RetryDelay::Fixed { seconds } => check_delay("retry delay", *seconds),
            RetryDelay::Exponential {
                base_seconds,
                max_seconds,
                jitter_factor,
            } => {
                if *base_seconds == 0 {
                    return Err(RunloomError::InvalidPolicy(
                        "exponential base delay must be positive".into(),
                    ));
                }
                if max_seconds < base_seconds {
                    return Err(RunloomError::InvalidPolicy(format!(
                        "max delay {max_seconds}s is below base delay {base_seconds}s"
                    )));
                }
                if !(0.0..=1.0).contains(jitter_factor) {
                    return Err(RunloomError::InvalidPolicy(format!(
                        "jitter factor {jitter_factor} outside [0, 1]"
                    )));
                }
                check_delay("max delay", *max_seconds)
            }
            RetryDelay::Sequence { seconds } if seconds.is_empty() => Err(
                RunloomError::InvalidPolicy("retry delay sequence is empty".into()),
            ),
            RetryDelay::Sequence { seconds } => seconds
                .iter()
                .try_for_each(|s| check_delay("retry delay", *s)),
        }
    }
}
