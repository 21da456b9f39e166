//! Work-queue matching: which runnable flow runs go to which queue this cycle.
//!
//! Read-only. Slots are taken later, when a worker moves a run to Running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use runloom_core::ids::{FlowRunId, WorkQueueId};
use runloom_core::queue::WorkQueue;
use runloom_core::run::FlowRun;
use runloom_core::state::StateType;

use crate::admission::QueueSlots;

/// Result of one matching cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPlan {
    /// Every active queue, in fire-time order; empty queues included.
    pub assignments: BTreeMap<WorkQueueId, Vec<FlowRunId>>,
    /// Over their queue's remaining capacity, or pinned to a paused queue.
    pub deferred: Vec<FlowRunId>,
    /// Runnable but matched by no active queue, or pinned to an unknown one.
    pub unmatched: Vec<FlowRunId>,
}

impl DispatchPlan {
    pub fn assigned(&self) -> usize {
        self.assignments.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned() == 0 && self.deferred.is_empty() && self.unmatched.is_empty()
    }
}

/// Scheduled and due, or Pending.
pub fn is_runnable(run: &FlowRun, now: DateTime<Utc>) -> bool {
    match run.history.current().state_type {
        StateType::Scheduled => run.fire_time() <= now,
        StateType::Pending => true,
        _ => false,
    }
}

/// The active queue with the best priority whose filter accepts `run`;
/// ties go to the smallest queue id.
pub fn best_queue<'a>(queues: &'a [WorkQueue], run: &FlowRun) -> Option<&'a WorkQueue> {
    queues
        .iter()
        .filter(|q| !q.is_paused && q.filter.matches(run))
        .min_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)))
}

/// The queue a run is charged to: its stamped `work_queue_id` when set,
/// otherwise the best matching queue. Admission uses the same answer.
pub fn route<'a>(queues: &'a [WorkQueue], run: &FlowRun) -> Option<&'a WorkQueue> {
    match &run.work_queue_id {
        Some(id) => queues.iter().find(|q| &q.id == id),
        None => best_queue(queues, run),
    }
}

/// Match runnable runs against queues.
pub fn dispatch_batch(
    queues: &[WorkQueue],
    runs: &[FlowRun],
    slots: &QueueSlots,
    now: DateTime<Utc>,
) -> DispatchPlan {
    let mut plan = DispatchPlan::default();
    let mut matched: BTreeMap<&WorkQueueId, Vec<&FlowRun>> = BTreeMap::new();
    let mut unmatched: Vec<&FlowRun> = Vec::new();
    let mut held: Vec<&FlowRun> = Vec::new();

    for queue in queues.iter().filter(|q| !q.is_paused) {
        plan.assignments.insert(queue.id.clone(), Vec::new());
    }

    for run in runs.iter().filter(|r| is_runnable(r, now)) {
        match route(queues, run) {
            Some(queue) if queue.is_paused => held.push(run),
            Some(queue) => matched.entry(&queue.id).or_default().push(run),
            None => unmatched.push(run),
        }
    }

    let mut ordered: Vec<&WorkQueue> = queues.iter().filter(|q| !q.is_paused).collect();
    ordered.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));

    for queue in ordered {
        let Some(mut candidates) = matched.remove(&queue.id) else {
            continue;
        };
        candidates.sort_by(|a, b| (a.fire_time(), &a.id).cmp(&(b.fire_time(), &b.id)));
        let capacity = slots
            .counter(&queue.id)
            .available(queue.concurrency_limit)
            .map(|n| n as usize)
            .unwrap_or(usize::MAX);

        let (take, rest) = candidates.split_at(capacity.min(candidates.len()));
        if !rest.is_empty() {
            tracing::debug!(
                "⏳ Queue '{}' full: {} assigned, {} deferred",
                queue.id,
                take.len(),
                rest.len()
            );
        }
        plan.assignments
            .entry(queue.id.clone())
            .or_default()
            .extend(take.iter().map(|r| r.id.clone()));
        plan.deferred.extend(rest.iter().map(|r| r.id.clone()));
    }

    held.sort_by(|a, b| (a.fire_time(), &a.id).cmp(&(b.fire_time(), &b.id)));
    plan.deferred.extend(held.into_iter().map(|r| r.id.clone()));
    unmatched.sort_by(|a, b| (a.fire_time(), &a.id).cmp(&(b.fire_time(), &b.id)));
    plan.unmatched = unmatched.into_iter().map(|r| r.id.clone()).collect();
    plan
}
