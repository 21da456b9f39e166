//! Flow runs and task runs: the records whose states the engine orchestrates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::error::{Result, RunloomError};
use crate::ids::{DeploymentId, FlowId, FlowRunId, RetryGroupId, TaskRunId, WorkQueueId};
use crate::policy::EmpiricalPolicy;
use crate::state::{State, StateType};

/// Flow runs and task runs share states but not transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Flow,
    Task,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Flow => write!(f, "flow run"),
            RunKind::Task => write!(f, "task run"),
        }
    }
}

/// Reference to either kind of run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RunRef {
    Flow(FlowRunId),
    Task(TaskRunId),
}

impl RunRef {
    pub fn kind(&self) -> RunKind {
        match self {
            RunRef::Flow(_) => RunKind::Flow,
            RunRef::Task(_) => RunKind::Task,
        }
    }
}

impl fmt::Display for RunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunRef::Flow(id) => write!(f, "flow-run:{id}"),
            RunRef::Task(id) => write!(f, "task-run:{id}"),
        }
    }
}

/// Append-only state history. Never empty: the current state is always the
/// last element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistory {
    prior: Vec<State>,
    current: State,
}

impl StateHistory {
    pub fn new(initial: State) -> Self {
        Self {
            prior: Vec::new(),
            current: initial,
        }
    }

    pub fn current(&self) -> &State {
        &self.current
    }

    /// Oldest first; the last item is the current state.
    pub fn iter(&self) -> impl Iterator<Item = &State> {
        self.prior.iter().chain(std::iter::once(&self.current))
    }

    pub fn len(&self) -> usize {
        self.prior.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn push(&mut self, state: State) {
        let previous = std::mem::replace(&mut self.current, state);
        self.prior.push(previous);
    }

    pub fn to_vec(&self) -> Vec<State> {
        self.iter().cloned().collect()
    }
}

/// Where a run sits in its retry group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLineage {
    pub group: RetryGroupId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Failed/Crashed states accumulated by earlier attempts.
    pub prior_failures: u32,
}

impl RetryLineage {
    pub fn first() -> Self {
        Self {
            group: RetryGroupId::generate(),
            attempt: 1,
            prior_failures: 0,
        }
    }

    /// Lineage of the attempt following one that saw `failures` failures.
    pub fn next(&self, failures: u32) -> Self {
        Self {
            group: self.group.clone(),
            attempt: self.attempt + 1,
            prior_failures: failures,
        }
    }
}

impl Default for RetryLineage {
    fn default() -> Self {
        Self::first()
    }
}

/// Anything the state machine can transition.
pub trait OrchestratedRun {
    fn kind(&self) -> RunKind;
    fn run_ref(&self) -> RunRef;
    fn history(&self) -> &StateHistory;
    fn version(&self) -> u64;
    fn empirical_policy(&self) -> Option<&EmpiricalPolicy>;
    fn retry(&self) -> &RetryLineage;

    /// Append a state and bump the version. Callers go through the state
    /// machine, which validates first.
    fn apply_state(&mut self, state: State);

    /// Owning flow run, for task runs.
    fn parent(&self) -> Option<&FlowRunId> {
        None
    }

    /// Deployment and fire time, for runs spawned by a schedule.
    fn schedule_origin(&self) -> Option<(&DeploymentId, DateTime<Utc>)> {
        None
    }

    fn state(&self) -> &State {
        self.history().current()
    }

    fn state_type(&self) -> StateType {
        self.state().state_type
    }
}

/// DAG of task-run dependencies inside a flow run. Used for ordering and
/// display only; scheduling decisions never consult it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunGraph {
    /// Task run → the task runs whose results it consumes.
    pub upstream: BTreeMap<TaskRunId, BTreeSet<TaskRunId>>,
}

impl RunGraph {
    pub fn from_task_runs<'a>(task_runs: impl IntoIterator<Item = &'a TaskRun>) -> Self {
        let mut graph = Self::default();
        for task_run in task_runs {
            graph.insert(task_run);
        }
        graph
    }

    pub fn insert(&mut self, task_run: &TaskRun) {
        let deps = task_run
            .inputs
            .iter()
            .filter_map(|input| match input {
                TaskInput::TaskRunResult { task_run_id } => Some(task_run_id.clone()),
                _ => None,
            })
            .collect();
        self.upstream.insert(task_run.id.clone(), deps);
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    /// Kahn's algorithm; ties resolved by id so the order is stable.
    /// Dependencies on task runs outside the graph are ignored.
    pub fn topological_order(&self) -> Result<Vec<TaskRunId>> {
        let mut indegree: BTreeMap<&TaskRunId, usize> = BTreeMap::new();
        let mut downstream: BTreeMap<&TaskRunId, Vec<&TaskRunId>> = BTreeMap::new();
        for (node, deps) in &self.upstream {
            let known = deps.iter().filter(|d| self.upstream.contains_key(*d));
            let mut count = 0;
            for dep in known {
                downstream.entry(dep).or_default().push(node);
                count += 1;
            }
            indegree.insert(node, count);
        }

        let mut ready: VecDeque<&TaskRunId> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.upstream.len());
        while let Some(node) = ready.pop_front() {
            order.push(node.clone());
            let mut released = Vec::new();
            for child in downstream.get(node).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        released.push(*child);
                    }
                }
            }
            released.sort();
            ready.extend(released);
        }

        if order.len() != self.upstream.len() {
            return Err(RunloomError::CycleDetected(format!(
                "{} task runs form a dependency cycle",
                self.upstream.len() - order.len()
            )));
        }
        Ok(order)
    }
}

/// One execution instance of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: FlowRunId,
    pub flow_id: FlowId,
    pub name: String,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    /// Spawned by a deployment schedule.
    #[serde(default)]
    pub auto_scheduled: bool,
    #[serde(default)]
    pub expected_start_time: Option<DateTime<Utc>>,
    pub history: StateHistory,
    pub version: u64,
    #[serde(default)]
    pub task_runs: Vec<TaskRunId>,
    /// Snapshot taken at creation; later policy edits don't affect this run.
    #[serde(default)]
    pub empirical_policy: Option<EmpiricalPolicy>,
    #[serde(default)]
    pub run_graph: RunGraph,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Queue that admitted the run into Running.
    #[serde(default)]
    pub work_queue_id: Option<WorkQueueId>,
    #[serde(default)]
    pub retry: RetryLineage,
    pub created: DateTime<Utc>,
}

impl FlowRun {
    pub fn new(flow_id: FlowId, initial: State) -> Self {
        let id = FlowRunId::generate();
        Self {
            name: format!("run-{}", &id.as_str()[..8.min(id.as_str().len())]),
            id,
            flow_id,
            deployment_id: None,
            auto_scheduled: false,
            expected_start_time: initial.details.scheduled_time,
            created: initial.timestamp,
            history: StateHistory::new(initial),
            version: 1,
            task_runs: Vec::new(),
            empirical_policy: None,
            run_graph: RunGraph::default(),
            tags: BTreeSet::new(),
            parameters: serde_json::Map::new(),
            idempotency_key: None,
            work_queue_id: None,
            retry: RetryLineage::first(),
        }
    }

    pub fn with_id(mut self, id: FlowRunId) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_deployment(mut self, deployment_id: DeploymentId) -> Self {
        self.deployment_id = Some(deployment_id);
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, policy: EmpiricalPolicy) -> Self {
        self.empirical_policy = Some(policy);
        self
    }

    pub fn with_work_queue(mut self, queue: WorkQueueId) -> Self {
        self.work_queue_id = Some(queue);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// When the run is due: the Scheduled state's fire time, else the
    /// expected start time, else the current state's timestamp.
    pub fn fire_time(&self) -> DateTime<Utc> {
        let state = self.history.current();
        state
            .details
            .scheduled_time
            .or(self.expected_start_time)
            .unwrap_or(state.timestamp)
    }
}

impl OrchestratedRun for FlowRun {
    fn kind(&self) -> RunKind {
        RunKind::Flow
    }

    fn run_ref(&self) -> RunRef {
        RunRef::Flow(self.id.clone())
    }

    fn history(&self) -> &StateHistory {
        &self.history
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn empirical_policy(&self) -> Option<&EmpiricalPolicy> {
        self.empirical_policy.as_ref()
    }

    fn retry(&self) -> &RetryLineage {
        &self.retry
    }

    fn apply_state(&mut self, state: State) {
        self.history.push(state);
        self.version += 1;
    }

    fn schedule_origin(&self) -> Option<(&DeploymentId, DateTime<Utc>)> {
        match (&self.deployment_id, self.auto_scheduled) {
            (Some(deployment), true) => {
                Some((deployment, self.expected_start_time.unwrap_or(self.created)))
            }
            _ => None,
        }
    }
}

/// A task input: where a task run's argument comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "input_type", rename_all = "snake_case")]
pub enum TaskInput {
    Constant { value: serde_json::Value },
    TaskRunResult { task_run_id: TaskRunId },
    Parameter { name: String },
}

/// One execution of a task inside a flow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    /// Lookup key only; the flow run owns its task runs.
    pub flow_run_id: FlowRunId,
    pub task_key: String,
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    pub history: StateHistory,
    pub version: u64,
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub empirical_policy: Option<EmpiricalPolicy>,
    #[serde(default)]
    pub retry: RetryLineage,
}

impl TaskRun {
    pub fn new(flow_run_id: FlowRunId, task_key: impl Into<String>, initial: State) -> Self {
        Self {
            id: TaskRunId::generate(),
            flow_run_id,
            task_key: task_key.into(),
            inputs: Vec::new(),
            history: StateHistory::new(initial),
            version: 1,
            cache_key: None,
            empirical_policy: None,
            retry: RetryLineage::first(),
        }
    }

    pub fn with_id(mut self, id: TaskRunId) -> Self {
        self.id = id;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<TaskInput>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_policy(mut self, policy: EmpiricalPolicy) -> Self {
        self.empirical_policy = Some(policy);
        self
    }
}

impl OrchestratedRun for TaskRun {
    fn kind(&self) -> RunKind {
        RunKind::Task
    }

    fn run_ref(&self) -> RunRef {
        RunRef::Task(self.id.clone())
    }

    fn history(&self) -> &StateHistory {
        &self.history
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn empirical_policy(&self) -> Option<&EmpiricalPolicy> {
        self.empirical_policy.as_ref()
    }

    fn retry(&self) -> &RetryLineage {
        &self.retry
    }

    fn apply_state(&mut self, state: State) {
        self.history.push(state);
        self.version += 1;
    }

    fn parent(&self) -> Option<&FlowRunId> {
        Some(&self.flow_run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_history_current_is_last() {
        let mut run = FlowRun::new(FlowId::new("etl"), State::pending(t0()));
        run.apply_state(State::running(t0() + chrono::Duration::seconds(5)));
        assert_eq!(run.history.len(), 2);
        assert_eq!(run.state_type(), StateType::Running);
        assert_eq!(run.history.iter().last().unwrap().state_type, StateType::Running);
        assert_eq!(run.version, 2);
    }

    #[test]
    fn test_fire_time_prefers_scheduled_time() {
        let at = t0() + chrono::Duration::hours(3);
        let run = FlowRun::new(FlowId::new("etl"), State::scheduled(t0(), at));
        assert_eq!(run.fire_time(), at);

        let pending = FlowRun::new(FlowId::new("etl"), State::pending(t0()));
        assert_eq!(pending.fire_time(), t0());
    }

    #[test]
    fn test_run_graph_topological_order() {
        let parent = FlowRunId::new("fr");
        let a = TaskRun::new(parent.clone(), "extract", State::pending(t0()))
            .with_id(TaskRunId::new("a"));
        let b = TaskRun::new(parent.clone(), "transform", State::pending(t0()))
            .with_id(TaskRunId::new("b"))
            .with_inputs(vec![TaskInput::TaskRunResult {
                task_run_id: TaskRunId::new("a"),
            }]);
        let c = TaskRun::new(parent, "load", State::pending(t0()))
            .with_id(TaskRunId::new("c"))
            .with_inputs(vec![
                TaskInput::TaskRunResult {
                    task_run_id: TaskRunId::new("b"),
                },
                TaskInput::Parameter { name: "target".into() },
            ]);
        let graph = RunGraph::from_task_runs([&c, &b, &a]);
        let order = graph.topological_order().unwrap();
        assert_eq!(
            order,
            vec![TaskRunId::new("a"), TaskRunId::new("b"), TaskRunId::new("c")]
        );
    }

    #[test]
    fn test_run_graph_rejects_cycle() {
        let mut graph = RunGraph::default();
        graph
            .upstream
            .insert(TaskRunId::new("a"), [TaskRunId::new("b")].into());
        graph
            .upstream
            .insert(TaskRunId::new("b"), [TaskRunId::new("a")].into());
        assert!(matches!(
            graph.topological_order(),
            Err(RunloomError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_retry_lineage_next_keeps_group() {
        let first = RetryLineage::first();
        let second = first.next(1);
        assert_eq!(second.group, first.group);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.prior_failures, 1);
    }
}
