//! Run state machine: validates a proposed state against the current one and
//! applies it.
//!
//! Checks run in a fixed order: version, legality, parent gate (task runs),
//! queue admission (flow runs entering Running). A rejected proposal leaves
//! the run and every counter untouched.

use runloom_core::ids::WorkQueueId;
use runloom_core::run::{OrchestratedRun, RunKind};
use runloom_core::state::{State, StateType};
use runloom_core::transition::{Signal, TransitionRecord, TransitionRejected};

use crate::admission::AdmissionCounter;

use StateType::*;

/// Targets reachable from `from`. Paused is filtered out for task runs.
fn targets(from: StateType) -> &'static [StateType] {
    match from {
        Scheduled => &[Scheduled, Pending, Running, Paused, Cancelling, Cancelled, Crashed],
        Pending => &[Scheduled, Running, Paused, Cancelling, Cancelled, Failed, Crashed],
        Running => &[Completed, Failed, Crashed, Paused, Cancelling],
        Paused => &[Scheduled, Pending, Running, Cancelling, Cancelled, Failed, Crashed],
        Cancelling => &[Cancelled],
        Completed | Failed | Cancelled | Crashed => &[],
    }
}

/// Whether `from -> to` is in the transition table for `kind`.
pub fn is_legal(kind: RunKind, from: StateType, to: StateType) -> bool {
    if kind == RunKind::Task && (from == Paused || to == Paused) {
        return false;
    }
    targets(from).contains(&to)
}

/// Every legal target from `from` for `kind`, in table order.
pub fn legal_targets(kind: RunKind, from: StateType) -> Vec<StateType> {
    targets(from)
        .iter()
        .copied()
        .filter(|to| is_legal(kind, from, *to))
        .collect()
}

/// The slot a flow run must take on its queue before it may run.
#[derive(Debug, Clone, Copy)]
pub struct QueueAdmission<'a> {
    pub queue: &'a WorkQueueId,
    pub limit: Option<u32>,
    pub counter: &'a AdmissionCounter,
}

/// What the state machine needs to know beyond the run itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionContext<'a> {
    /// The run's queue. Required for flow runs to be counted on entering
    /// and leaving Running; absent means ungated.
    pub admission: Option<QueueAdmission<'a>>,
    /// Current state of the parent flow run, `None` if it was not found.
    pub parent_state: Option<StateType>,
}

impl<'a> TransitionContext<'a> {
    pub fn with_admission(mut self, admission: QueueAdmission<'a>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn with_parent_state(mut self, parent_state: StateType) -> Self {
        self.parent_state = Some(parent_state);
        self
    }
}

/// Coarse outcome for callers that only route on the kind of answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrchestrationStatus {
    /// Applied.
    Accept,
    /// Never legal from here; do not retry.
    Reject,
    /// Blocked by another run; retry later.
    Wait,
    /// Lost a race; re-read and decide again.
    Abort,
}

impl From<&TransitionRejected> for OrchestrationStatus {
    fn from(reason: &TransitionRejected) -> Self {
        match reason {
            TransitionRejected::IllegalStateTransition { .. } => OrchestrationStatus::Reject,
            TransitionRejected::ConcurrencyLimitReached { .. }
            | TransitionRejected::ParentNotRunnable { .. } => OrchestrationStatus::Wait,
            TransitionRejected::StaleVersion { .. } => OrchestrationStatus::Abort,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    Accepted {
        record: TransitionRecord,
        signals: Vec<Signal>,
    },
    Rejected(TransitionRejected),
}

impl TransitionResult {
    pub fn status(&self) -> OrchestrationStatus {
        match self {
            TransitionResult::Accepted { .. } => OrchestrationStatus::Accept,
            TransitionResult::Rejected(reason) => reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, TransitionResult::Accepted { .. })
    }

    /// The state now current on the run, if accepted.
    pub fn state(&self) -> Option<&State> {
        match self {
            TransitionResult::Accepted { record, .. } => Some(&record.state),
            TransitionResult::Rejected(_) => None,
        }
    }

    pub fn signals(&self) -> &[Signal] {
        match self {
            TransitionResult::Accepted { signals, .. } => signals,
            TransitionResult::Rejected(_) => &[],
        }
    }
}

/// Proof of administrative authority for [`force_transition`]. The automatic
/// engine never constructs one.
#[derive(Debug)]
pub struct AdminOverride {
    reason: String,
}

impl AdminOverride {
    pub fn grant(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Validate everything except admission, which has a side effect.
fn check<R: OrchestratedRun>(
    run: &R,
    expected_version: u64,
    to: StateType,
    ctx: &TransitionContext<'_>,
) -> Result<(), TransitionRejected> {
    if run.version() != expected_version {
        return Err(TransitionRejected::StaleVersion {
            expected: expected_version,
            actual: run.version(),
        });
    }

    let from = run.state_type();
    if !is_legal(run.kind(), from, to) {
        return Err(TransitionRejected::IllegalStateTransition {
            kind: run.kind(),
            from,
            to,
        });
    }

    if let Some(parent) = run.parent() {
        if matches!(to, Scheduled | Pending | Running)
            && !ctx.parent_state.is_some_and(|s| !s.is_terminal())
        {
            return Err(TransitionRejected::ParentNotRunnable {
                parent: parent.clone(),
                parent_state: ctx.parent_state,
            });
        }
    }
    Ok(())
}

/// Whether this transition takes a queue slot.
fn needs_admission<R: OrchestratedRun>(run: &R, to: StateType) -> bool {
    run.kind() == RunKind::Flow && to == Running && run.state_type() != Running
}

/// Keep history ordered: a proposal older than the current state is moved
/// up to the current timestamp.
fn clamp(run: &impl OrchestratedRun, mut proposed: State) -> State {
    let current = run.state().timestamp;
    if proposed.timestamp < current {
        proposed.timestamp = current;
    }
    proposed
}

fn signals_for<R: OrchestratedRun>(
    run: &R,
    from: StateType,
    to: StateType,
    ctx: &TransitionContext<'_>,
) -> Vec<Signal> {
    let mut signals = Vec::new();
    if from == Running && to != Running {
        if let Some(admission) = ctx.admission.filter(|_| run.kind() == RunKind::Flow) {
            signals.push(Signal::ReleaseConcurrencySlot {
                queue: admission.queue.clone(),
            });
        }
    }
    if to.is_failure() && !from.is_failure() && run.empirical_policy().is_some() {
        signals.push(Signal::EvaluateRetry);
    }
    if to.is_terminal() && !from.is_terminal() {
        if let Some((deployment, fire_time)) = run.schedule_origin() {
            signals.push(Signal::ScheduleNext {
                deployment_id: deployment.clone(),
                after: fire_time,
            });
        }
    }
    signals
}

fn apply<R: OrchestratedRun>(
    run: &mut R,
    from: StateType,
    state: State,
    ctx: &TransitionContext<'_>,
) -> TransitionResult {
    let signals = signals_for(run, from, state.state_type, ctx);
    run.apply_state(state.clone());
    TransitionResult::Accepted {
        record: TransitionRecord {
            run: run.run_ref(),
            from: Some(from),
            state,
            version: run.version(),
        },
        signals,
    }
}

/// Decide without mutating anything, admission included.
pub fn decide<R: OrchestratedRun>(
    run: &R,
    expected_version: u64,
    proposed: StateType,
    ctx: &TransitionContext<'_>,
) -> Result<(), TransitionRejected> {
    check(run, expected_version, proposed, ctx)?;
    if needs_admission(run, proposed) {
        if let Some(admission) = ctx.admission {
            if admission.counter.available(admission.limit) == Some(0) {
                return Err(TransitionRejected::ConcurrencyLimitReached {
                    queue: admission.queue.clone(),
                    limit: admission.limit.unwrap_or(0),
                });
            }
        }
    }
    Ok(())
}

/// Validate `proposed` against the run and apply it if legal.
pub fn attempt_transition<R: OrchestratedRun>(
    run: &mut R,
    expected_version: u64,
    proposed: State,
    ctx: &TransitionContext<'_>,
) -> TransitionResult {
    let from = run.state_type();
    let to = proposed.state_type;
    if let Err(reason) = check(run, expected_version, to, ctx) {
        tracing::debug!("⛔ {} {} -> {} rejected: {}", run.run_ref(), from, to, reason);
        return TransitionResult::Rejected(reason);
    }

    if needs_admission(run, to) {
        if let Some(admission) = ctx.admission {
            if !admission.counter.try_admit(admission.limit) {
                let reason = TransitionRejected::ConcurrencyLimitReached {
                    queue: admission.queue.clone(),
                    limit: admission.limit.unwrap_or(0),
                };
                tracing::debug!("⏳ {} waits for a slot: {}", run.run_ref(), reason);
                return TransitionResult::Rejected(reason);
            }
        }
    }

    let state = clamp(run, proposed);
    tracing::debug!("✅ {} {} -> {}", run.run_ref(), from, state.display_name());
    apply(run, from, state, ctx)
}

/// Apply `proposed` unconditionally, bypassing the table and every gate.
/// Slots are still counted so admission stays balanced.
pub fn force_transition<R: OrchestratedRun>(
    run: &mut R,
    proposed: State,
    ctx: &TransitionContext<'_>,
    grant: &AdminOverride,
) -> TransitionResult {
    let from = run.state_type();
    if needs_admission(run, proposed.state_type) {
        if let Some(admission) = ctx.admission {
            admission.counter.force_admit();
        }
    }
    let state = clamp(run, proposed);
    tracing::warn!(
        "🛠️ {} forced {} -> {} ({})",
        run.run_ref(),
        from,
        state.display_name(),
        grant.reason()
    );
    apply(run, from, state, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use runloom_core::ids::{DeploymentId, FlowId, FlowRunId};
    use runloom_core::policy::{EmpiricalPolicy, RetryDelay};
    use runloom_core::run::{FlowRun, TaskRun};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn flow_run(state: State) -> FlowRun {
        FlowRun::new(FlowId::new("etl"), state)
    }

    #[test]
    fn test_table_matches_for_flow_runs() {
        assert!(is_legal(RunKind::Flow, Scheduled, Scheduled));
        assert!(is_legal(RunKind::Flow, Running, Paused));
        assert!(is_legal(RunKind::Flow, Cancelling, Cancelled));
        assert!(!is_legal(RunKind::Flow, Cancelling, Running));
        assert!(!is_legal(RunKind::Flow, Running, Pending));
        assert!(!is_legal(RunKind::Flow, Scheduled, Completed));
    }

    #[test]
    fn test_task_runs_never_pause() {
        assert!(!is_legal(RunKind::Task, Running, Paused));
        assert!(!is_legal(RunKind::Task, Paused, Running));
        assert!(!legal_targets(RunKind::Task, Pending).contains(&Paused));
        assert!(legal_targets(RunKind::Flow, Pending).contains(&Paused));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [Completed, Failed, Cancelled, Crashed] {
            for to in StateType::ALL {
                let mut run = flow_run(State::new(terminal, t0()));
                let ctx = TransitionContext::default();
                let result = attempt_transition(&mut run, 1, State::new(to, t0()), &ctx);
                assert_eq!(result.status(), OrchestrationStatus::Reject);
                assert_eq!(run.history.len(), 1);
            }
        }
    }

    #[test]
    fn test_accept_appends_and_bumps_version() {
        let mut run = flow_run(State::pending(t0()));
        let result = attempt_transition(
            &mut run,
            1,
            State::running(t0() + Duration::seconds(5)),
            &TransitionContext::default(),
        );
        assert!(result.is_accepted());
        assert_eq!(run.version, 2);
        assert_eq!(run.history.len(), 2);
        assert_eq!(run.history.current().state_type, Running);
    }

    #[test]
    fn test_stale_version_aborts() {
        let mut run = flow_run(State::pending(t0()));
        let ctx = TransitionContext::default();
        let result = attempt_transition(&mut run, 7, State::running(t0()), &ctx);
        assert_eq!(
            result,
            TransitionResult::Rejected(TransitionRejected::StaleVersion { expected: 7, actual: 1 })
        );
        assert_eq!(result.status(), OrchestrationStatus::Abort);
    }

    #[test]
    fn test_earlier_timestamp_is_clamped() {
        let mut run = flow_run(State::pending(t0()));
        attempt_transition(
            &mut run,
            1,
            State::running(t0() - Duration::minutes(1)),
            &TransitionContext::default(),
        );
        assert_eq!(run.history.current().timestamp, t0());
    }

    #[test]
    fn test_concurrency_gate() {
        let queue = WorkQueueId::new("q");
        let counter = AdmissionCounter::new();
        let ctx = TransitionContext::default().with_admission(QueueAdmission {
            queue: &queue,
            limit: Some(1),
            counter: &counter,
        });

        let mut first = flow_run(State::pending(t0())).with_work_queue(queue.clone());
        let mut second = flow_run(State::pending(t0())).with_work_queue(queue.clone());
        assert!(attempt_transition(&mut first, 1, State::running(t0()), &ctx).is_accepted());

        let blocked = attempt_transition(&mut second, 1, State::running(t0()), &ctx);
        assert_eq!(blocked.status(), OrchestrationStatus::Wait);
        assert!(decide(&second, 1, Running, &ctx).is_err());
        assert_eq!(counter.active(), 1);

        let done = attempt_transition(&mut first, 2, State::completed(t0()), &ctx);
        assert_eq!(
            done.signals(),
            &[Signal::ReleaseConcurrencySlot { queue: queue.clone() }]
        );
    }

    #[test]
    fn test_rejection_does_not_take_slot() {
        let queue = WorkQueueId::new("q");
        let counter = AdmissionCounter::new();
        let ctx = TransitionContext::default().with_admission(QueueAdmission {
            queue: &queue,
            limit: Some(1),
            counter: &counter,
        });
        let mut run = flow_run(State::pending(t0()));
        let stale = attempt_transition(&mut run, 9, State::running(t0()), &ctx);
        assert!(!stale.is_accepted());
        assert_eq!(counter.active(), 0);
    }

    #[test]
    fn test_task_parent_gate() {
        let parent = FlowRunId::new("parent");
        let mut task = TaskRun::new(parent.clone(), "extract", State::pending(t0()));

        let no_parent = TransitionContext::default();
        let missing = attempt_transition(&mut task, 1, State::running(t0()), &no_parent);
        assert_eq!(
            missing,
            TransitionResult::Rejected(TransitionRejected::ParentNotRunnable {
                parent: parent.clone(),
                parent_state: None,
            })
        );

        let finished = TransitionContext::default().with_parent_state(Cancelled);
        assert_eq!(
            attempt_transition(&mut task, 1, State::running(t0()), &finished).status(),
            OrchestrationStatus::Wait
        );

        // Leaving for a terminal state is never gated.
        let crashed = attempt_transition(&mut task, 1, State::crashed(t0(), "lost"), &finished);
        assert!(crashed.is_accepted());
    }

    #[test]
    fn test_failure_signals_retry_and_schedule_next() {
        let mut run = flow_run(State::running(t0()))
            .with_deployment(DeploymentId::new("nightly"))
            .with_policy(EmpiricalPolicy::new(2, RetryDelay::Fixed { seconds: 10 }));
        run.auto_scheduled = true;
        run.expected_start_time = Some(t0());

        let ctx = TransitionContext::default();
        let result = attempt_transition(&mut run, 1, State::failed(t0(), "boom"), &ctx);
        assert_eq!(
            result.signals(),
            &[
                Signal::EvaluateRetry,
                Signal::ScheduleNext {
                    deployment_id: DeploymentId::new("nightly"),
                    after: t0(),
                },
            ]
        );
    }

    #[test]
    fn test_force_transition_leaves_terminal() {
        let mut run = flow_run(State::failed(t0(), "boom"));
        let grant = AdminOverride::grant("operator requeue");
        let ctx = TransitionContext::default();
        let result = force_transition(&mut run, State::scheduled(t0(), t0()), &ctx, &grant);
        assert!(result.is_accepted());
        assert_eq!(run.history.current().state_type, Scheduled);
    }
}
