//! Identifiers for ILM entities.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of a managed resource (an index name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a resource id from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the underlying name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can be used as a single path segment.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && !self.0.contains(['/', '\\', '\0'])
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from a node name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the node name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key of a scheduled job: one job per managed resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    /// Job name (the resource id)
    pub name: String,
    /// Job group
    pub group: String,
}

impl JobKey {
    /// Create a job key.
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Job key for a resource in the given group.
    pub fn for_resource(resource: &ResourceId, group: impl Into<String>) -> Self {
        Self::new(resource.as_str(), group)
    }

    /// The resource this job manages.
    pub fn resource(&self) -> ResourceId {
        ResourceId::new(self.name.clone())
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Key of a trigger attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TriggerKey {
    /// Trigger name
    pub name: String,
    /// Trigger group (same as the job's group)
    pub group: String,
}

impl TriggerKey {
    /// Generate a fresh trigger key for a job.
    pub fn unique(job: &JobKey) -> Self {
        Self::with_prefix("", job)
    }

    /// Generate a fresh trigger key for a job with a name prefix (e.g. `manual___`).
    pub fn with_prefix(prefix: &str, job: &JobKey) -> Self {
        Self {
            name: format!("{}{}___{}", prefix, job.name, Ulid::new()),
            group: job.group.clone(),
        }
    }
}

impl std::fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}
