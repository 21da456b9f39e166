//! Work queues and their filters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Result, RunloomError};
use crate::ids::{DeploymentId, WorkQueueId};
use crate::run::FlowRun;

/// Tag predicate of a queue filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "tags", rename_all = "snake_case")]
pub enum TagFilter {
    /// Run must carry every tag.
    AllOf(BTreeSet<String>),
    /// Run must carry at least one tag.
    AnyOf(BTreeSet<String>),
}

impl TagFilter {
    fn tags(&self) -> &BTreeSet<String> {
        match self {
            TagFilter::AllOf(tags) | TagFilter::AnyOf(tags) => tags,
        }
    }

    pub fn matches(&self, run_tags: &BTreeSet<String>) -> bool {
        match self {
            TagFilter::AllOf(tags) => tags.is_subset(run_tags),
            TagFilter::AnyOf(tags) => !tags.is_disjoint(run_tags),
        }
    }
}

/// Predicate over runs. Dimensions are ANDed; a missing dimension matches
/// everything; deployment ids are ORed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_ids: Option<BTreeSet<DeploymentId>>,
}

impl WorkQueueFilter {
    pub fn all_of<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tags: Some(TagFilter::AllOf(tags.into_iter().map(Into::into).collect())),
            deployment_ids: None,
        }
    }

    pub fn any_of<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tags: Some(TagFilter::AnyOf(tags.into_iter().map(Into::into).collect())),
            deployment_ids: None,
        }
    }

    pub fn with_deployments<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = DeploymentId>,
    {
        self.deployment_ids = Some(ids.into_iter().collect());
        self
    }

    /// Reject filters that could never be intended: empty sets, blank tags.
    pub fn validate(&self) -> Result<()> {
        if let Some(tag_filter) = &self.tags {
            let tags = tag_filter.tags();
            if tags.is_empty() {
                return Err(RunloomError::MalformedFilter("tag set is empty".into()));
            }
            if tags.iter().any(|t| t.trim().is_empty()) {
                return Err(RunloomError::MalformedFilter("blank tag".into()));
            }
        }
        if let Some(ids) = &self.deployment_ids {
            if ids.is_empty() {
                return Err(RunloomError::MalformedFilter(
                    "deployment id set is empty".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn matches(&self, run: &FlowRun) -> bool {
        let tags_ok = self
            .tags
            .as_ref()
            .is_none_or(|filter| filter.matches(&run.tags));
        let deployment_ok = match (&self.deployment_ids, &run.deployment_id) {
            (None, _) => true,
            (Some(ids), Some(id)) => ids.contains(id),
            (Some(_), None) => false,
        };
        tags_ok && deployment_ok
    }
}

/// A filtered, priority-ranked, concurrency-limited dispatch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueue {
    pub id: WorkQueueId,
    pub name: String,
    /// 1 is the highest priority.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub filter: WorkQueueFilter,
    /// Max concurrently Running flow runs; `None` is unlimited.
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
    #[serde(default)]
    pub is_paused: bool,
}

fn default_priority() -> u32 { 1 }

impl WorkQueue {
    pub fn new(id: impl Into<String>, priority: u32, filter: WorkQueueFilter) -> Self {
        let id = WorkQueueId::new(id);
        Self {
            name: id.to_string(),
            id,
            priority,
            filter,
            concurrency_limit: None,
            is_paused: false,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn paused(mut self) -> Self {
        self.is_paused = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.priority == 0 {
            return Err(RunloomError::MalformedFilter(format!(
                "work queue {} has priority 0; priorities start at 1",
                self.id
            )));
        }
        self.filter.validate()
    }
}
