//! # Runloom Scheduler
//!
//! Decision layer of the orchestration engine: the state machine, schedule
//! arithmetic, queue matching, retry policy, history folds and the
//! orchestrator loop that ties them to a run store.
//!
//! ## Design Principles
//! - One writer per run at a time; versions catch everyone else
//! - Rejections are values, not errors
//! - In-memory store with JSON snapshots, no external services
//! - Tokio timers only: zero overhead when idle
//!
//! ## Architecture
//! ```text
//! Orchestrator (tokio interval)
//!   ├── schedule_deployment_runs: interval / cron / rrule → Scheduled runs
//!   ├── mark_late_runs: overdue Scheduled → "Late"
//!   └── dispatch: runnable runs → best work queue (priority, capacity)
//!
//! set_flow_run_state / set_task_run_state
//!   ├── state_machine: version → legality → parent gate → admission
//!   ├── RunStore: replace with version, append transition log
//!   └── signals
//!         ├── ReleaseConcurrencySlot → QueueSlots
//!         ├── EvaluateRetry → policy → AwaitingRetry / AwaitingManualRetry
//!         └── ScheduleNext → top up the deployment
//! ```

pub mod admission;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod history;
pub mod policy;
pub mod rrule;
pub mod schedule;
pub mod state_machine;
pub mod store;
pub mod tz;

pub use admission::{AdmissionCounter, QueueSlots};
pub use cron::CronExpr;
pub use dispatch::{DispatchPlan, best_queue, dispatch_batch, route};
pub use engine::{Orchestrator, TickReport, spawn_scheduler_loop};
pub use history::{HistoryBucket, aggregate, run_history};
pub use policy::{RetryDecision, should_retry};
pub use rrule::RRule;
pub use schedule::{FireTimes, next_fire_time, next_fire_times, upcoming};
pub use state_machine::{
    AdminOverride, OrchestrationStatus, QueueAdmission, TransitionContext, TransitionResult,
    attempt_transition, force_transition,
};
pub use store::{
    FlowRunFilter, FlowRunSort, InMemoryRunStore, Page, RunStore, Snapshot, SnapshotStore,
};
