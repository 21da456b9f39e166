//! Transition outcomes shared by the state machine and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DeploymentId, FlowRunId, WorkQueueId};
use crate::run::{RunKind, RunRef};
use crate::state::{State, StateType};

/// Why a proposed transition was refused. The run is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TransitionRejected {
    #[error("illegal {kind} transition {from} -> {to}")]
    IllegalStateTransition {
        kind: RunKind,
        from: StateType,
        to: StateType,
    },

    #[error("work queue {queue} is at its concurrency limit of {limit}")]
    ConcurrencyLimitReached { queue: WorkQueueId, limit: u32 },

    #[error("parent flow run {parent} is not runnable ({parent_state:?})")]
    ParentNotRunnable {
        parent: FlowRunId,
        /// `None` when the parent could not be found.
        parent_state: Option<StateType>,
    },

    #[error("stale version: expected {expected}, found {actual}")]
    StaleVersion { expected: u64, actual: u64 },
}

/// Side-effect request emitted by an accepted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    /// Create the deployment's next scheduled run after `after`.
    ScheduleNext {
        deployment_id: DeploymentId,
        after: DateTime<Utc>,
    },
    /// Ask the empirical policy whether to retry.
    EvaluateRetry,
    /// Give back the slot this run held on its work queue.
    ReleaseConcurrencySlot { queue: WorkQueueId },
}

/// One entry of the append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub run: RunRef,
    /// `None` for the initial state of a newly created run.
    pub from: Option<StateType>,
    pub state: State,
    /// Run version after this transition.
    pub version: u64,
}

impl TransitionRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.state.timestamp
    }
}
