//! Run store: the persistence contract the orchestrator works against, an
//! in-memory implementation, and JSON snapshots of it.
//!
//! Writes of existing runs carry the version the caller read; a mismatch is
//! a `StaleVersion` rejection and nothing is written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use runloom_core::config::RunloomConfig;
use runloom_core::deployment::Deployment;
use runloom_core::error::{Result, RunloomError};
use runloom_core::ids::{DeploymentId, FlowId, FlowRunId, TaskRunId, WorkQueueId};
use runloom_core::queue::WorkQueue;
use runloom_core::run::{FlowRun, TaskRun};
use runloom_core::state::StateType;
use runloom_core::transition::{TransitionRecord, TransitionRejected};

/// Flow-run predicate for reads. Every set dimension must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowRunFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<FlowRunId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_ids: Option<BTreeSet<FlowId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_ids: Option<BTreeSet<DeploymentId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_types: Option<BTreeSet<StateType>>,
    /// Run must carry all of these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags_all: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_start_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_start_before: Option<DateTime<Utc>>,
}

impl FlowRunFilter {
    pub fn with_state_types<I: IntoIterator<Item = StateType>>(mut self, types: I) -> Self {
        self.state_types = Some(types.into_iter().collect());
        self
    }

    pub fn with_flow(mut self, flow_id: FlowId) -> Self {
        self.flow_ids.get_or_insert_with(BTreeSet::new).insert(flow_id);
        self
    }

    pub fn with_deployment(mut self, deployment_id: DeploymentId) -> Self {
        self.deployment_ids
            .get_or_insert_with(BTreeSet::new)
            .insert(deployment_id);
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags_all = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Expected start time in `[after, before)`.
    pub fn expected_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.expected_start_after = after;
        self.expected_start_before = before;
        self
    }

    pub fn matches(&self, run: &FlowRun) -> bool {
        let expected = run.fire_time();
        self.ids.as_ref().is_none_or(|ids| ids.contains(&run.id))
            && self.flow_ids.as_ref().is_none_or(|ids| ids.contains(&run.flow_id))
            && self.deployment_ids.as_ref().is_none_or(|ids| {
                run.deployment_id.as_ref().is_some_and(|id| ids.contains(id))
            })
            && self
                .state_types
                .as_ref()
                .is_none_or(|types| types.contains(&run.history.current().state_type))
            && self.tags_all.as_ref().is_none_or(|tags| tags.is_subset(&run.tags))
            && self.expected_start_after.is_none_or(|after| expected >= after)
            && self.expected_start_before.is_none_or(|before| expected < before)
    }
}

/// Read ordering for flow runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowRunSort {
    #[default]
    IdDesc,
    ExpectedStartTimeAsc,
    ExpectedStartTimeDesc,
    NameAsc,
    NameDesc,
}

impl FlowRunSort {
    fn sort(self, runs: &mut [FlowRun]) {
        match self {
            FlowRunSort::IdDesc => runs.sort_by(|a, b| b.id.cmp(&a.id)),
            FlowRunSort::ExpectedStartTimeAsc => {
                runs.sort_by(|a, b| (a.fire_time(), &a.id).cmp(&(b.fire_time(), &b.id)))
            }
            FlowRunSort::ExpectedStartTimeDesc => {
                runs.sort_by(|a, b| (b.fire_time(), &b.id).cmp(&(a.fire_time(), &a.id)))
            }
            FlowRunSort::NameAsc => runs.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id))),
            FlowRunSort::NameDesc => runs.sort_by(|a, b| (&b.name, &b.id).cmp(&(&a.name, &a.id))),
        }
    }
}

/// Offset pagination. `limit` defaults to, and may not exceed, the store's
/// default limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset,
        }
    }

    pub fn resolve_limit(&self, default_limit: usize) -> Result<usize> {
        match self.limit {
            None => Ok(default_limit),
            Some(limit) if limit > default_limit => Err(RunloomError::InvalidLimit(format!(
                "limit {limit} exceeds the maximum of {default_limit}"
            ))),
            Some(limit) => Ok(limit),
        }
    }
}

/// Persistence contract of the orchestrator.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a flow run. If one with the same flow and idempotency key
    /// exists, return that instead; the flag says whether a run was created.
    async fn create_flow_run(&self, run: FlowRun) -> Result<(FlowRun, bool)>;

    async fn read_flow_run(&self, id: &FlowRunId) -> Result<Option<FlowRun>>;

    /// Overwrite a flow run whose stored version is `expected_version`.
    /// The stored task run list and run graph are kept.
    async fn replace_flow_run(&self, run: FlowRun, expected_version: u64) -> Result<()>;

    /// Remove a flow run and its task runs. `false` if it did not exist.
    async fn delete_flow_run(&self, id: &FlowRunId) -> Result<bool>;

    async fn list_flow_runs(
        &self,
        filter: &FlowRunFilter,
        sort: FlowRunSort,
        page: Page,
    ) -> Result<Vec<FlowRun>>;

    async fn count_flow_runs(&self, filter: &FlowRunFilter) -> Result<usize>;

    /// Every matching flow run, unpaginated. For the engine's own scans.
    async fn scan_flow_runs(&self, filter: &FlowRunFilter) -> Result<Vec<FlowRun>>;

    /// Insert a task run and attach it to its flow run.
    async fn create_task_run(&self, run: TaskRun) -> Result<TaskRun>;

    async fn read_task_run(&self, id: &TaskRunId) -> Result<Option<TaskRun>>;

    async fn replace_task_run(&self, run: TaskRun, expected_version: u64) -> Result<()>;

    async fn list_task_runs(&self, flow_run_id: &FlowRunId) -> Result<Vec<TaskRun>>;

    async fn append_transition(&self, record: TransitionRecord) -> Result<()>;

    async fn transition_log(&self) -> Result<Vec<TransitionRecord>>;

    async fn put_work_queue(&self, queue: WorkQueue) -> Result<()>;

    async fn read_work_queue(&self, id: &WorkQueueId) -> Result<Option<WorkQueue>>;

    async fn list_work_queues(&self) -> Result<Vec<WorkQueue>>;

    async fn put_deployment(&self, deployment: Deployment) -> Result<()>;

    async fn read_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>>;

    async fn list_deployments(&self) -> Result<Vec<Deployment>>;
}

/// Everything an [`InMemoryRunStore`] holds, in serializable form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub flow_runs: Vec<FlowRun>,
    #[serde(default)]
    pub task_runs: Vec<TaskRun>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
    #[serde(default)]
    pub work_queues: Vec<WorkQueue>,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
}

#[derive(Debug, Default)]
struct Inner {
    flow_runs: BTreeMap<FlowRunId, FlowRun>,
    task_runs: BTreeMap<TaskRunId, TaskRun>,
    idempotency: HashMap<(FlowId, String), FlowRunId>,
    transitions: Vec<TransitionRecord>,
    work_queues: BTreeMap<WorkQueueId, WorkQueue>,
    deployments: BTreeMap<DeploymentId, Deployment>,
}

fn stale(expected: u64, actual: u64) -> RunloomError {
    RunloomError::Rejected(TransitionRejected::StaleVersion { expected, actual })
}

/// Store backed by in-process maps behind a tokio `RwLock`.
#[derive(Debug)]
pub struct InMemoryRunStore {
    inner: RwLock<Inner>,
    default_limit: usize,
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new(RunloomConfig::default().api.default_limit)
    }
}

impl InMemoryRunStore {
    pub fn new(default_limit: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            default_limit,
        }
    }

    pub fn from_snapshot(snapshot: Snapshot, default_limit: usize) -> Self {
        let mut inner = Inner::default();
        for run in snapshot.flow_runs {
            if let Some(key) = &run.idempotency_key {
                inner
                    .idempotency
                    .insert((run.flow_id.clone(), key.clone()), run.id.clone());
            }
            inner.flow_runs.insert(run.id.clone(), run);
        }
        inner.task_runs = snapshot
            .task_runs
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        inner.transitions = snapshot.transitions;
        inner.work_queues = snapshot
            .work_queues
            .into_iter()
            .map(|q| (q.id.clone(), q))
            .collect();
        inner.deployments = snapshot
            .deployments
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Self {
            inner: RwLock::new(inner),
            default_limit,
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().await;
        Snapshot {
            flow_runs: inner.flow_runs.values().cloned().collect(),
            task_runs: inner.task_runs.values().cloned().collect(),
            transitions: inner.transitions.clone(),
            work_queues: inner.work_queues.values().cloned().collect(),
            deployments: inner.deployments.values().cloned().collect(),
        }
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_flow_run(&self, run: FlowRun) -> Result<(FlowRun, bool)> {
        let mut inner = self.inner.write().await;
        if let Some(key) = &run.idempotency_key {
            let existing = inner
                .idempotency
                .get(&(run.flow_id.clone(), key.clone()))
                .and_then(|id| inner.flow_runs.get(id));
            if let Some(existing) = existing {
                return Ok((existing.clone(), false));
            }
        }
        if inner.flow_runs.contains_key(&run.id) {
            return Err(RunloomError::Store(format!("flow run {} already exists", run.id)));
        }
        if let Some(key) = &run.idempotency_key {
            inner
                .idempotency
                .insert((run.flow_id.clone(), key.clone()), run.id.clone());
        }
        inner.flow_runs.insert(run.id.clone(), run.clone());
        Ok((run, true))
    }

    async fn read_flow_run(&self, id: &FlowRunId) -> Result<Option<FlowRun>> {
        Ok(self.inner.read().await.flow_runs.get(id).cloned())
    }

    async fn replace_flow_run(&self, mut run: FlowRun, expected_version: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .flow_runs
            .get_mut(&run.id)
            .ok_or_else(|| RunloomError::NotFound(format!("flow run {}", run.id)))?;
        if stored.version != expected_version {
            return Err(stale(expected_version, stored.version));
        }
        run.task_runs = std::mem::take(&mut stored.task_runs);
        run.run_graph = std::mem::take(&mut stored.run_graph);
        *stored = run;
        Ok(())
    }

    async fn delete_flow_run(&self, id: &FlowRunId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(run) = inner.flow_runs.remove(id) else {
            return Ok(false);
        };
        if let Some(key) = run.idempotency_key {
            inner.idempotency.remove(&(run.flow_id, key));
        }
        inner.task_runs.retain(|_, task| &task.flow_run_id != id);
        tracing::debug!("🗑️ Deleted flow run {id}");
        Ok(true)
    }

    async fn list_flow_runs(
        &self,
        filter: &FlowRunFilter,
        sort: FlowRunSort,
        page: Page,
    ) -> Result<Vec<FlowRun>> {
        let limit = page.resolve_limit(self.default_limit)?;
        let mut runs = self.scan_flow_runs(filter).await?;
        sort.sort(&mut runs);
        Ok(runs.into_iter().skip(page.offset).take(limit).collect())
    }

    async fn count_flow_runs(&self, filter: &FlowRunFilter) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner.flow_runs.values().filter(|r| filter.matches(r)).count())
    }

    async fn scan_flow_runs(&self, filter: &FlowRunFilter) -> Result<Vec<FlowRun>> {
        let inner = self.inner.read().await;
        Ok(inner
            .flow_runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn create_task_run(&self, run: TaskRun) -> Result<TaskRun> {
        let mut inner = self.inner.write().await;
        if inner.task_runs.contains_key(&run.id) {
            return Err(RunloomError::Store(format!("task run {} already exists", run.id)));
        }
        let parent = inner
            .flow_runs
            .get_mut(&run.flow_run_id)
            .ok_or_else(|| RunloomError::NotFound(format!("flow run {}", run.flow_run_id)))?;
        parent.task_runs.push(run.id.clone());
        parent.run_graph.insert(&run);
        inner.task_runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn read_task_run(&self, id: &TaskRunId) -> Result<Option<TaskRun>> {
        Ok(self.inner.read().await.task_runs.get(id).cloned())
    }

    async fn replace_task_run(&self, run: TaskRun, expected_version: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .task_runs
            .get_mut(&run.id)
            .ok_or_else(|| RunloomError::NotFound(format!("task run {}", run.id)))?;
        if stored.version != expected_version {
            return Err(stale(expected_version, stored.version));
        }
        *stored = run;
        Ok(())
    }

    async fn list_task_runs(&self, flow_run_id: &FlowRunId) -> Result<Vec<TaskRun>> {
        let inner = self.inner.read().await;
        let Some(parent) = inner.flow_runs.get(flow_run_id) else {
            return Ok(Vec::new());
        };
        Ok(parent
            .task_runs
            .iter()
            .filter_map(|id| inner.task_runs.get(id).cloned())
            .collect())
    }

    async fn append_transition(&self, record: TransitionRecord) -> Result<()> {
        self.inner.write().await.transitions.push(record);
        Ok(())
    }

    async fn transition_log(&self) -> Result<Vec<TransitionRecord>> {
        Ok(self.inner.read().await.transitions.clone())
    }

    async fn put_work_queue(&self, queue: WorkQueue) -> Result<()> {
        queue.validate()?;
        self.inner.write().await.work_queues.insert(queue.id.clone(), queue);
        Ok(())
    }

    async fn read_work_queue(&self, id: &WorkQueueId) -> Result<Option<WorkQueue>> {
        Ok(self.inner.read().await.work_queues.get(id).cloned())
    }

    async fn list_work_queues(&self) -> Result<Vec<WorkQueue>> {
        Ok(self.inner.read().await.work_queues.values().cloned().collect())
    }

    async fn put_deployment(&self, deployment: Deployment) -> Result<()> {
        if let Some(schedule) = &deployment.schedule {
            crate::schedule::validate(schedule)?;
        }
        if let Some(policy) = &deployment.empirical_policy {
            policy.validate()?;
        }
        self.inner
            .write()
            .await
            .deployments
            .insert(deployment.id.clone(), deployment);
        Ok(())
    }

    async fn read_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>> {
        Ok(self.inner.read().await.deployments.get(id).cloned())
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(self.inner.read().await.deployments.values().cloned().collect())
    }
}

/// JSON snapshot file of an [`InMemoryRunStore`]. Human-readable.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `snapshot_path` from config, else `~/.runloom/snapshot.json`.
    pub fn from_config(config: &RunloomConfig) -> Self {
        match &config.store.snapshot_path {
            Some(path) => Self::new(shellexpand::tilde(path).into_owned()),
            None => Self::new(Self::default_path()),
        }
    }

    pub fn default_path() -> PathBuf {
        RunloomConfig::home_dir().join("snapshot.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&self.path, json)?;
        tracing::debug!(
            "💾 Saved {} flow runs to {}",
            snapshot.flow_runs.len(),
            self.path.display()
        );
        Ok(())
    }

    /// `None` when no snapshot has been written yet.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&json)?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use runloom_core::queue::WorkQueueFilter;
    use runloom_core::state::State;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn run(flow: &str, id: &str) -> FlowRun {
        FlowRun::new(FlowId::new(flow), State::pending(t0())).with_id(FlowRunId::new(id))
    }

    #[tokio::test]
    async fn test_idempotent_create() {
        let store = InMemoryRunStore::default();
        let (first, created) = store
            .create_flow_run(run("etl", "r1").with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(created);
        let (second, created) = store
            .create_flow_run(run("etl", "r2").with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);

        // Same key on another flow is a different run.
        let (_, created) = store
            .create_flow_run(run("other", "r3").with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_replace_checks_version() {
        let store = InMemoryRunStore::default();
        let (mut stored, _) = store.create_flow_run(run("etl", "r1")).await.unwrap();
        stored.version = 2;
        store.replace_flow_run(stored.clone(), 1).await.unwrap();

        let err = store.replace_flow_run(stored, 1).await.unwrap_err();
        assert!(matches!(
            err,
            RunloomError::Rejected(TransitionRejected::StaleVersion { expected: 1, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn test_task_runs_attach_and_survive_replace() {
        let store = InMemoryRunStore::default();
        let (parent, _) = store.create_flow_run(run("etl", "r1")).await.unwrap();
        let task = TaskRun::new(parent.id.clone(), "extract", State::pending(t0()));
        store.create_task_run(task.clone()).await.unwrap();

        // `parent` was read before the task existed.
        store.replace_flow_run(parent.clone(), 1).await.unwrap();
        let reread = store.read_flow_run(&parent.id).await.unwrap().unwrap();
        assert_eq!(reread.task_runs, vec![task.id.clone()]);
        assert_eq!(store.list_task_runs(&parent.id).await.unwrap().len(), 1);

        assert!(store.delete_flow_run(&parent.id).await.unwrap());
        assert!(store.read_task_run(&task.id).await.unwrap().is_none());
        assert!(!store.delete_flow_run(&parent.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_task_run_needs_parent() {
        let store = InMemoryRunStore::default();
        let orphan = TaskRun::new(FlowRunId::new("missing"), "t", State::pending(t0()));
        assert!(matches!(
            store.create_task_run(orphan).await,
            Err(RunloomError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_filter_sort_and_paginate() {
        let store = InMemoryRunStore::new(2);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let mut r = run("etl", id).with_tags(["prod"]);
            r.expected_start_time = Some(t0() + Duration::minutes(i as i64));
            store.create_flow_run(r).await.unwrap();
        }
        store.create_flow_run(run("etl", "d")).await.unwrap();

        let filter = FlowRunFilter::default().with_tags(["prod"]);
        assert_eq!(store.count_flow_runs(&filter).await.unwrap(), 3);

        let page = store
            .list_flow_runs(&filter, FlowRunSort::ExpectedStartTimeDesc, Page::new(2, 1))
            .await
            .unwrap();
        let ids: Vec<&str> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let default_page = store
            .list_flow_runs(&filter, FlowRunSort::IdDesc, Page::default())
            .await
            .unwrap();
        assert_eq!(default_page.len(), 2);
        assert_eq!(default_page[0].id.as_str(), "c");

        assert!(matches!(
            store
                .list_flow_runs(&filter, FlowRunSort::IdDesc, Page::new(3, 0))
                .await,
            Err(RunloomError::InvalidLimit(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_file() {
        let dir = std::env::temp_dir().join("runloom-test-snapshot");
        let file = SnapshotStore::new(dir.join("snapshot.json"));
        assert!(file.load().unwrap().is_none());

        let store = InMemoryRunStore::default();
        store.create_flow_run(run("etl", "r1").with_idempotency_key("k")).await.unwrap();
        store
            .put_work_queue(WorkQueue::new("default", 1, WorkQueueFilter::default()))
            .await
            .unwrap();
        file.save(&store.snapshot().await).unwrap();

        let restored = InMemoryRunStore::from_snapshot(file.load().unwrap().unwrap(), 200);
        let (again, created) = restored
            .create_flow_run(run("etl", "r9").with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id.as_str(), "r1");
        assert_eq!(restored.list_work_queues().await.unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
