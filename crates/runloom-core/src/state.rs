//! Run states: the status records appended to a run's history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant category of a [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Scheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Crashed,
    Cancelled,
    Paused,
    Cancelling,
}

impl StateType {
    pub const ALL: [StateType; 9] = [
        StateType::Scheduled,
        StateType::Pending,
        StateType::Running,
        StateType::Completed,
        StateType::Failed,
        StateType::Crashed,
        StateType::Cancelled,
        StateType::Paused,
        StateType::Cancelling,
    ];

    /// Terminal types admit no further automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateType::Completed | StateType::Failed | StateType::Cancelled | StateType::Crashed
        )
    }

    /// Failed or Crashed.
    pub fn is_failure(&self) -> bool {
        matches!(self, StateType::Failed | StateType::Crashed)
    }

    /// Title-case display name, used when a state has no explicit name.
    pub fn default_name(&self) -> &'static str {
        match self {
            StateType::Scheduled => "Scheduled",
            StateType::Pending => "Pending",
            StateType::Running => "Running",
            StateType::Completed => "Completed",
            StateType::Failed => "Failed",
            StateType::Crashed => "Crashed",
            StateType::Cancelled => "Cancelled",
            StateType::Paused => "Paused",
            StateType::Cancelling => "Cancelling",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_name())
    }
}

/// Structured details attached to a state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDetails {
    /// Fire time for Scheduled states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_expiration: Option<DateTime<Utc>>,
    /// Attempt number within the retry group (1-based).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
    /// Paused runs that are not resumed by then may be failed by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_timeout: Option<DateTime<Utc>>,
}

/// An immutable, timestamped status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "type")]
    pub state_type: StateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub details: StateDetails,
}

impl State {
    pub fn new(state_type: StateType, timestamp: DateTime<Utc>) -> Self {
        Self {
            state_type,
            name: None,
            timestamp,
            message: None,
            details: StateDetails::default(),
        }
    }

    /// Scheduled to fire at `at`.
    pub fn scheduled(timestamp: DateTime<Utc>, at: DateTime<Utc>) -> Self {
        let mut state = Self::new(StateType::Scheduled, timestamp);
        state.details.scheduled_time = Some(at);
        state
    }

    pub fn pending(timestamp: DateTime<Utc>) -> Self {
        Self::new(StateType::Pending, timestamp)
    }

    pub fn running(timestamp: DateTime<Utc>) -> Self {
        Self::new(StateType::Running, timestamp)
    }

    pub fn completed(timestamp: DateTime<Utc>) -> Self {
        Self::new(StateType::Completed, timestamp)
    }

    pub fn failed(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self::new(StateType::Failed, timestamp).with_message(message)
    }

    pub fn crashed(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self::new(StateType::Crashed, timestamp).with_message(message)
    }

    pub fn cancelled(timestamp: DateTime<Utc>) -> Self {
        Self::new(StateType::Cancelled, timestamp)
    }

    pub fn cancelling(timestamp: DateTime<Utc>) -> Self {
        Self::new(StateType::Cancelling, timestamp)
    }

    pub fn paused(timestamp: DateTime<Utc>) -> Self {
        Self::new(StateType::Paused, timestamp)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: StateDetails) -> Self {
        self.details = details;
        self
    }

    /// Explicit name, or the type's display name.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| self.state_type.default_name())
    }

    pub fn is_terminal(&self) -> bool {
        self.state_type.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_terminal_types() {
        let terminal: Vec<_> = StateType::ALL.iter().filter(|t| t.is_terminal()).collect();
        assert_eq!(terminal.len(), 4);
        assert!(!StateType::Cancelling.is_terminal());
        assert!(!StateType::Paused.is_terminal());
    }

    #[test]
    fn test_display_name_falls_back_to_type() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(State::pending(now).display_name(), "Pending");
        assert_eq!(
            State::scheduled(now, now).with_name("Late").display_name(),
            "Late"
        );
    }

    #[test]
    fn test_state_serializes_type_tag() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let json = serde_json::to_value(State::running(now)).unwrap();
        assert_eq!(json["type"], "RUNNING");
    }
}
