//! Deployments: schedulable bindings of a flow to a work queue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ids::{DeploymentId, FlowId, WorkQueueId};
use crate::policy::EmpiricalPolicy;
use crate::schedule::Schedule;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    pub flow_id: FlowId,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default = "bool_true")]
    pub is_schedule_active: bool,
    #[serde(default)]
    pub work_queue_id: Option<WorkQueueId>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Copied onto every run the deployment spawns.
    #[serde(default)]
    pub empirical_policy: Option<EmpiricalPolicy>,
}

fn bool_true() -> bool { true }

impl Deployment {
    pub fn new(id: impl Into<String>, flow_id: FlowId) -> Self {
        let id = DeploymentId::new(id);
        Self {
            name: id.to_string(),
            id,
            flow_id,
            schedule: None,
            is_schedule_active: true,
            work_queue_id: None,
            parameters: serde_json::Map::new(),
            tags: BTreeSet::new(),
            empirical_policy: None,
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_work_queue(mut self, queue: WorkQueueId) -> Self {
        self.work_queue_id = Some(queue);
        self
    }

    pub fn with_policy(mut self, policy: EmpiricalPolicy) -> Self {
        self.empirical_policy = Some(policy);
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

    /// Schedule to fire from, if scheduling is switched on.
    pub fn active_schedule(&self) -> Option<&Schedule> {
        if self.is_schedule_active {
            self.schedule.as_ref()
        } else {
            None
        }
    }
}
