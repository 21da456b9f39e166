//! Strongly-typed identifiers.
//!
//! Ids are opaque strings (UUID v4 when generated). They order
//! lexicographically, which the queue matcher relies on for tie-breaking.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a flow definition.
    FlowId
);
string_id!(
    /// Identifier of a single flow run.
    FlowRunId
);
string_id!(
    /// Identifier of a single task run.
    TaskRunId
);
string_id!(
    /// Identifier of a deployment.
    DeploymentId
);
string_id!(
    /// Identifier of a work queue.
    WorkQueueId
);
string_id!(
    /// Shared by every attempt of one logical run.
    RetryGroupId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_order_lexicographically() {
        let a = WorkQueueId::new("alpha");
        let b = WorkQueueId::new("beta");
        assert!(a < b);
        assert_eq!(a.to_string(), "alpha");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(FlowRunId::generate(), FlowRunId::generate());
    }

    #[test]
    fn test_serde_transparent() {
        let id = TaskRunId::new("t-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"t-1\"");
    }
}
