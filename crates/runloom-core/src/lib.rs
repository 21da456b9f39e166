//! # Runloom Core
//!
//! Shared vocabulary for the run-state orchestration engine: identifiers,
//! states, flow runs and task runs, work queues, deployments, retry policies,
//! schedule specifications, the error taxonomy and configuration.
//!
//! Nothing in this crate makes a decision. The `runloom-scheduler` crate owns
//! the transition table, schedule arithmetic, queue matching and history folds.

pub mod clock;
pub mod config;
pub mod deployment;
pub mod error;
pub mod ids;
pub mod policy;
pub mod queue;
pub mod run;
pub mod schedule;
pub mod state;
pub mod transition;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::RunloomConfig;
pub use deployment::Deployment;
pub use error::{Result, RunloomError};
pub use ids::{DeploymentId, FlowId, FlowRunId, RetryGroupId, TaskRunId, WorkQueueId};
pub use policy::{EmpiricalPolicy, RetryDelay};
pub use queue::{TagFilter, WorkQueue, WorkQueueFilter};
pub use run::{
    FlowRun, OrchestratedRun, RetryLineage, RunGraph, RunKind, RunRef, StateHistory, TaskInput,
    TaskRun,
};
pub use schedule::{CronSchedule, IntervalSchedule, RRuleSchedule, Schedule};
pub use state::{State, StateDetails, StateType};
pub use transition::{Signal, TransitionRecord, TransitionRejected};
