//! Orchestrator: the facade that serializes decisions per run, persists them
//! and reacts to the signals they emit.
//!
//! Each `set_*_state` call runs read → decide → write (with version) → log →
//! signals while holding that run's lock, so two callers racing on one run
//! see one `Accept` and one `StaleVersion`. Different runs proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

use runloom_core::clock::Clock;
use runloom_core::config::SchedulerConfig;
use runloom_core::deployment::Deployment;
use runloom_core::error::{Result, RunloomError};
use runloom_core::ids::{FlowId, FlowRunId, TaskRunId, WorkQueueId};
use runloom_core::run::{FlowRun, OrchestratedRun, RunRef, TaskRun};
use runloom_core::state::{State, StateDetails, StateType};
use runloom_core::transition::{Signal, TransitionRecord};

use crate::admission::QueueSlots;
use crate::dispatch::{self, DispatchPlan};
use crate::history::{self, HistoryBucket};
use crate::policy::{self, RetryDecision};
use crate::schedule;
use crate::state_machine::{
    self, AdminOverride, QueueAdmission, TransitionContext, TransitionResult,
};
use crate::store::{FlowRunFilter, RunStore};

/// Per-run async mutexes, created on demand.
#[derive(Debug, Default)]
struct RunLocks {
    locks: Mutex<HashMap<RunRef, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunLocks {
    async fn lock(&self, run: RunRef) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(run).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on.
    fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub scheduled: usize,
    pub late: usize,
    pub plan: DispatchPlan,
}

pub struct Orchestrator<S: RunStore, C: Clock> {
    store: Arc<S>,
    clock: Arc<C>,
    slots: QueueSlots,
    locks: RunLocks,
    config: SchedulerConfig,
}

impl<S: RunStore, C: Clock> Orchestrator<S, C> {
    pub fn new(store: Arc<S>, clock: Arc<C>, config: SchedulerConfig) -> Self {
        Self {
            store,
            clock,
            slots: QueueSlots::new(),
            locks: RunLocks::default(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn slots(&self) -> &QueueSlots {
        &self.slots
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Rebuild admission counters from the Running flow runs in the store.
    pub async fn restore_admissions(&self) -> Result<()> {
        let running = self
            .store
            .scan_flow_runs(&FlowRunFilter::default().with_state_types([StateType::Running]))
            .await?;
        let mut per_queue: BTreeMap<WorkQueueId, u32> = BTreeMap::new();
        for run in running {
            if let Some(queue) = run.work_queue_id {
                *per_queue.entry(queue).or_default() += 1;
            }
        }
        tracing::info!("🎟️ Restored admissions for {} queues", per_queue.len());
        self.slots.seed(per_queue);
        Ok(())
    }

    /// A new flow run, Pending now unless `state` says otherwise.
    pub fn draft_flow_run(&self, flow_id: FlowId, state: Option<State>) -> FlowRun {
        FlowRun::new(flow_id, state.unwrap_or_else(|| State::pending(self.now())))
    }

    /// Persist a new flow run. Idempotent on `(flow_id, idempotency_key)`:
    /// a repeat returns the run created the first time.
    pub async fn create_flow_run(&self, run: FlowRun) -> Result<FlowRun> {
        if let Some(policy) = &run.empirical_policy {
            policy.validate()?;
        }
        let (run, created) = self.store.create_flow_run(run).await?;
        if created {
            self.store
                .append_transition(TransitionRecord {
                    run: run.run_ref(),
                    from: None,
                    state: run.history.current().clone(),
                    version: run.version,
                })
                .await?;
            tracing::info!(
                "📅 Flow run created: '{}' ({}) in {}",
                run.name,
                run.id,
                run.history.current().display_name()
            );
        }
        Ok(run)
    }

    /// Persist a new task run under its flow run.
    pub async fn create_task_run(&self, task: TaskRun) -> Result<TaskRun> {
        if let Some(policy) = &task.empirical_policy {
            policy.validate()?;
        }
        let task = self.store.create_task_run(task).await?;
        self.store
            .append_transition(TransitionRecord {
                run: task.run_ref(),
                from: None,
                state: task.history.current().clone(),
                version: task.version,
            })
            .await?;
        tracing::debug!("🧩 Task run created: '{}' ({})", task.task_key, task.id);
        Ok(task)
    }

    /// Queue the run is admitted through. Runs with no queue yet are stamped
    /// with the one dispatch routes them to, so both charge the same counter.
    async fn resolve_queue(
        &self,
        run: &mut FlowRun,
        proposed: StateType,
    ) -> Result<Option<(WorkQueueId, Option<u32>)>> {
        if run.work_queue_id.is_none() && proposed == StateType::Running {
            let queues = self.store.list_work_queues().await?;
            run.work_queue_id = dispatch::route(&queues, run).map(|q| q.id.clone());
        }
        let Some(queue_id) = run.work_queue_id.clone() else {
            return Ok(None);
        };
        let limit = self
            .store
            .read_work_queue(&queue_id)
            .await?
            .and_then(|q| q.concurrency_limit);
        Ok(Some((queue_id, limit)))
    }

    /// Propose a new state for a flow run.
    pub async fn set_flow_run_state(
        &self,
        id: &FlowRunId,
        expected_version: u64,
        proposed: State,
    ) -> Result<TransitionResult> {
        self.transition_flow_run(id, expected_version, proposed, None).await
    }

    /// Administrative override: apply `proposed` whatever the current state.
    pub async fn force_flow_run_state(
        &self,
        id: &FlowRunId,
        proposed: State,
        grant: &AdminOverride,
    ) -> Result<TransitionResult> {
        self.transition_flow_run(id, 0, proposed, Some(grant)).await
    }

    async fn transition_flow_run(
        &self,
        id: &FlowRunId,
        expected_version: u64,
        proposed: State,
        grant: Option<&AdminOverride>,
    ) -> Result<TransitionResult> {
        let guard = self.locks.lock(RunRef::Flow(id.clone())).await;
        let mut run = self
            .store
            .read_flow_run(id)
            .await?
            .ok_or_else(|| RunloomError::NotFound(format!("flow run {id}")))?;
        let read_version = run.version;
        let from = run.history.current().state_type;

        let queue = self.resolve_queue(&mut run, proposed.state_type).await?;
        let counter = queue.as_ref().map(|(queue_id, _)| self.slots.counter(queue_id));
        let mut ctx = TransitionContext::default();
        if let (Some((queue_id, limit)), Some(counter)) = (&queue, &counter) {
            ctx = ctx.with_admission(QueueAdmission {
                queue: queue_id,
                limit: *limit,
                counter,
            });
        }

        let result = match grant {
            Some(grant) => state_machine::force_transition(&mut run, proposed, &ctx, grant),
            None => state_machine::attempt_transition(&mut run, expected_version, proposed, &ctx),
        };
        let TransitionResult::Accepted { record, signals } = &result else {
            return Ok(result);
        };

        let took_slot = from != StateType::Running && record.state.state_type == StateType::Running;
        if let Err(e) = self.store.replace_flow_run(run.clone(), read_version).await {
            if took_slot {
                if let Some(counter) = &counter {
                    counter.release();
                }
            }
            return Err(e);
        }
        // The run is written: from here on the transition stands, and
        // follow-up failures are logged rather than returned.
        if let Err(e) = self.store.append_transition(record.clone()).await {
            tracing::warn!("⚠️ Transition log append failed for {}: {}", run.id, e);
        }
        tracing::info!(
            "🔀 Flow run '{}' {} -> {} (v{})",
            run.name,
            from,
            record.state.display_name(),
            record.version
        );
        drop(guard);

        for signal in signals {
            if let Err(e) = self.handle_flow_signal(&run, signal).await {
                tracing::warn!("⚠️ Signal {:?} for {} failed: {}", signal, run.id, e);
            }
        }
        Ok(result)
    }

    async fn handle_flow_signal(&self, run: &FlowRun, signal: &Signal) -> Result<()> {
        match signal {
            Signal::ReleaseConcurrencySlot { queue } => {
                self.slots.counter(queue).release();
                tracing::debug!(
                    "🎟️ Released slot on '{}' ({} active)",
                    queue,
                    self.slots.active(queue)
                );
            }
            Signal::EvaluateRetry => {
                if let Some(policy) = &run.empirical_policy {
                    let decision = policy::should_retry(policy, run);
                    self.act_on_flow_retry(run, decision).await?;
                }
            }
            Signal::ScheduleNext { deployment_id, after } => {
                tracing::debug!("📅 Topping up '{}' after {}", deployment_id, after);
                if let Some(deployment) = self.store.read_deployment(deployment_id).await? {
                    self.schedule_deployment(&deployment).await?;
                }
            }
        }
        Ok(())
    }

    async fn act_on_flow_retry(
        &self,
        run: &FlowRun,
        decision: RetryDecision,
    ) -> Result<Option<FlowRun>> {
        let now = self.now();
        let failures = policy::failures_in_lineage(run);
        let lineage = run.retry.next(failures);
        let details = StateDetails {
            retry_attempt: Some(lineage.attempt),
            ..StateDetails::default()
        };
        let state = match decision {
            RetryDecision::GiveUp => {
                tracing::info!("🛑 Flow run '{}' gave up after {} failures", run.name, failures);
                return Ok(None);
            }
            RetryDecision::Retry(delay) => {
                let at = retry_at(now, delay)?;
                State::scheduled(now, at)
                    .with_name("AwaitingRetry")
                    .with_details(StateDetails {
                        scheduled_time: Some(at),
                        ..details
                    })
            }
            RetryDecision::Pause => State::paused(now)
                .with_name("AwaitingManualRetry")
                .with_details(details),
        };

        let mut next = FlowRun::new(run.flow_id.clone(), state).with_name(run.name.clone());
        next.deployment_id = run.deployment_id.clone();
        next.tags = run.tags.clone();
        next.parameters = run.parameters.clone();
        next.empirical_policy = run.empirical_policy.clone();
        next.work_queue_id = run.work_queue_id.clone();
        next.idempotency_key = Some(format!("retry {} {}", lineage.group, lineage.attempt));
        next.retry = lineage;

        let next = self.create_flow_run(next).await?;
        tracing::info!(
            "🔁 Flow run '{}' attempt {} spawned as {} ({})",
            run.name,
            next.retry.attempt,
            next.id,
            next.history.current().display_name()
        );
        Ok(Some(next))
    }

    /// Propose a new state for a task run.
    pub async fn set_task_run_state(
        &self,
        id: &TaskRunId,
        expected_version: u64,
        proposed: State,
    ) -> Result<TransitionResult> {
        let guard = self.locks.lock(RunRef::Task(id.clone())).await;
        let mut task = self
            .store
            .read_task_run(id)
            .await?
            .ok_or_else(|| RunloomError::NotFound(format!("task run {id}")))?;
        let read_version = task.version;
        let from = task.history.current().state_type;

        let mut ctx = TransitionContext::default();
        if let Some(parent) = self.store.read_flow_run(&task.flow_run_id).await? {
            ctx = ctx.with_parent_state(parent.history.current().state_type);
        }

        let result = state_machine::attempt_transition(&mut task, expected_version, proposed, &ctx);
        let TransitionResult::Accepted { record, signals } = &result else {
            return Ok(result);
        };
        self.store.replace_task_run(task.clone(), read_version).await?;
        if let Err(e) = self.store.append_transition(record.clone()).await {
            tracing::warn!("⚠️ Transition log append failed for {}: {}", task.id, e);
        }
        tracing::debug!(
            "🔀 Task run '{}' {} -> {}",
            task.task_key,
            from,
            record.state.display_name()
        );
        drop(guard);

        if signals.contains(&Signal::EvaluateRetry) {
            if let Some(policy) = &task.empirical_policy {
                if let RetryDecision::Retry(delay) = policy::should_retry(policy, &task) {
                    if let Err(e) = self.spawn_task_retry(&task, delay).await {
                        tracing::warn!(
                            "⚠️ Retry of task '{}' not spawned: {}",
                            task.task_key,
                            e
                        );
                    }
                }
            }
        }
        Ok(result)
    }

    async fn spawn_task_retry(&self, task: &TaskRun, delay: Duration) -> Result<TaskRun> {
        let now = self.now();
        let at = retry_at(now, delay)?;
        let lineage = task.retry.next(policy::failures_in_lineage(task));
        let state = State::scheduled(now, at)
            .with_name("AwaitingRetry")
            .with_details(StateDetails {
                scheduled_time: Some(at),
                retry_attempt: Some(lineage.attempt),
                ..StateDetails::default()
            });
        let mut next = TaskRun::new(task.flow_run_id.clone(), task.task_key.clone(), state)
            .with_inputs(task.inputs.clone());
        next.cache_key = task.cache_key.clone();
        next.empirical_policy = task.empirical_policy.clone();
        next.retry = lineage;
        let next = self.create_task_run(next).await?;
        tracing::info!("🔁 Task '{}' attempt {} at {}", next.task_key, next.retry.attempt, at);
        Ok(next)
    }

    /// Create the deployment's upcoming runs. Already-created fire times are
    /// deduplicated by idempotency key.
    pub async fn schedule_deployment(&self, deployment: &Deployment) -> Result<usize> {
        let Some(schedule) = deployment.active_schedule() else {
            return Ok(0);
        };
        let now = self.now();
        let horizon =
            Duration::try_days(self.config.max_schedule_horizon_days).unwrap_or(Duration::MAX);
        let times = schedule::upcoming(schedule, now, self.config.max_scheduled_runs, horizon)?;

        let mut created = 0;
        for fire in times {
            let key = format!("scheduled {} {}", deployment.id, fire.to_rfc3339());
            let mut run = FlowRun::new(deployment.flow_id.clone(), State::scheduled(now, fire))
                .with_deployment(deployment.id.clone())
                .with_tags(deployment.tags.iter().cloned())
                .with_idempotency_key(key);
            run.auto_scheduled = true;
            run.expected_start_time = Some(fire);
            run.parameters = deployment.parameters.clone();
            run.empirical_policy = deployment.empirical_policy.clone();
            run.work_queue_id = deployment.work_queue_id.clone();

            let (_, is_new) = self.store.create_flow_run(run.clone()).await?;
            if is_new {
                self.store
                    .append_transition(TransitionRecord {
                        run: run.run_ref(),
                        from: None,
                        state: run.history.current().clone(),
                        version: run.version,
                    })
                    .await?;
                created += 1;
            }
        }
        if created > 0 {
            tracing::info!(
                "📅 Scheduled {} runs for deployment '{}'",
                created,
                deployment.name
            );
        }
        Ok(created)
    }

    /// Top up every deployment with an active schedule.
    pub async fn schedule_deployment_runs(&self) -> Result<usize> {
        let mut total = 0;
        for deployment in self.store.list_deployments().await? {
            total += self.schedule_deployment(&deployment).await?;
        }
        Ok(total)
    }

    /// Rename overdue Scheduled runs to "Late". Runs that move concurrently
    /// are skipped.
    pub async fn mark_late_runs(&self) -> Result<usize> {
        let now = self.now();
        let grace =
            Duration::try_seconds(self.config.late_runs_after_secs).unwrap_or(Duration::zero());
        let cutoff = now - grace;
        let scheduled = self
            .store
            .scan_flow_runs(&FlowRunFilter::default().with_state_types([StateType::Scheduled]))
            .await?;

        let mut marked = 0;
        for run in scheduled {
            let current = run.history.current();
            if run.fire_time() >= cutoff || current.name.as_deref() == Some("Late") {
                continue;
            }
            let late = State::new(StateType::Scheduled, now)
                .with_name("Late")
                .with_details(current.details.clone());
            match self.set_flow_run_state(&run.id, run.version, late).await {
                Ok(result) if result.is_accepted() => marked += 1,
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::debug!("⏭️ Skipped late marking of {}: {}", run.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        if marked > 0 {
            tracing::info!("⏰ Marked {} runs Late", marked);
        }
        Ok(marked)
    }

    /// Match runnable runs against the active queues.
    pub async fn dispatch(&self) -> Result<DispatchPlan> {
        let queues = self.store.list_work_queues().await?;
        let runs = self
            .store
            .scan_flow_runs(
                &FlowRunFilter::default()
                    .with_state_types([StateType::Scheduled, StateType::Pending]),
            )
            .await?;
        Ok(dispatch::dispatch_batch(&queues, &runs, &self.slots, self.now()))
    }

    /// Epoch-aligned buckets over the whole transition log.
    pub async fn history(&self, bucket_width: Duration) -> Result<Vec<HistoryBucket>> {
        history::aggregate(&self.store.transition_log().await?, bucket_width)
    }

    /// Buckets covering `[start, end)`.
    pub async fn run_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Result<Vec<HistoryBucket>> {
        history::run_history(&self.store.transition_log().await?, start, end, interval)
    }

    /// Schedule, mark late, then plan dispatch.
    pub async fn tick(&self) -> Result<TickReport> {
        let scheduled = self.schedule_deployment_runs().await?;
        let late = self.mark_late_runs().await?;
        let plan = self.dispatch().await?;
        self.locks.prune();
        Ok(TickReport {
            scheduled,
            late,
            plan,
        })
    }
}

/// When a retry delayed by `delay` from `now` is due.
fn retry_at(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(delay).ok_or_else(|| {
        RunloomError::InvalidPolicy(format!("retry delay {delay} runs past the calendar"))
    })
}

/// Spawn the scheduler loop as a background tokio task.
pub fn spawn_scheduler_loop<S, C>(
    orchestrator: Arc<Orchestrator<S, C>>,
    loop_interval_secs: u64,
) -> JoinHandle<()>
where
    S: RunStore + 'static,
    C: Clock + 'static,
{
    tokio::spawn(async move {
        tracing::info!("⏰ Scheduler started (tick every {}s)", loop_interval_secs);
        let period = std::time::Duration::from_secs(loop_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match orchestrator.tick().await {
                Ok(report) => {
                    for (queue, runs) in &report.plan.assignments {
                        if !runs.is_empty() {
                            tracing::info!("📣 [{}] {} runs ready", queue, runs.len());
                        }
                    }
                    if !report.plan.unmatched.is_empty() {
                        tracing::warn!(
                            "⚠️ {} runnable runs match no queue",
                            report.plan.unmatched.len()
                        );
                    }
                }
                Err(e) => tracing::warn!("⚠️ Scheduler tick failed: {e}"),
            }
        }
    })
}
