//! Cluster topology view consumed by the scheduling drivers.

use crate::{NodeId, ResourceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Index setting naming the policy that manages an index.
pub const POLICY_NAME_SETTING: &str = "index.lifecycle.policy_name";

/// Metadata of one index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index settings (flattened keys)
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl IndexMetadata {
    /// Metadata managed by the given policy.
    pub fn managed_by(policy_name: impl Into<String>) -> Self {
        let mut settings = BTreeMap::new();
        settings.insert(POLICY_NAME_SETTING.to_string(), policy_name.into());
        Self { settings }
    }

    /// Policy name, if the setting is present and non-empty.
    pub fn policy_name(&self) -> Option<&str> {
        self.settings
            .get(POLICY_NAME_SETTING)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Snapshot of the cluster as seen by this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Monotonic state version
    pub version: u64,

    /// This node
    pub local_node: NodeId,

    /// All nodes currently in the cluster
    pub nodes: BTreeSet<NodeId>,

    /// Index metadata by index name
    pub indices: BTreeMap<ResourceId, IndexMetadata>,
}

impl ClusterState {
    /// A single-node cluster without indices.
    pub fn new(local_node: NodeId) -> Self {
        let mut nodes = BTreeSet::new();
        nodes.insert(local_node.clone());
        Self {
            version: 0,
            local_node,
            nodes,
            indices: BTreeMap::new(),
        }
    }

    /// Add a node.
    pub fn with_node(mut self, node: NodeId) -> Self {
        self.nodes.insert(node);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, id: ResourceId, metadata: IndexMetadata) -> Self {
        self.indices.insert(id, metadata);
        self
    }

    /// Resources whose configuration names a policy, with that policy name.
    pub fn managed_resources(&self) -> BTreeMap<ResourceId, String> {
        self.indices
            .iter()
            .filter_map(|(id, meta)| meta.policy_name().map(|p| (id.clone(), p.to_string())))
            .collect()
    }
}

/// A transition between two cluster states.
#[derive(Debug, Clone)]
pub struct ClusterChangedEvent {
    /// State before the change
    pub previous: Arc<ClusterState>,
    /// State after the change
    pub current: Arc<ClusterState>,
}

impl ClusterChangedEvent {
    /// Create an event.
    pub fn new(previous: Arc<ClusterState>, current: Arc<ClusterState>) -> Self {
        Self { previous, current }
    }

    /// Whether index metadata changed.
    pub fn metadata_changed(&self) -> bool {
        self.previous.indices != self.current.indices
    }

    /// Whether the node set changed.
    pub fn nodes_changed(&self) -> bool {
        self.previous.nodes != self.current.nodes
    }

    /// Indices present before and absent now.
    pub fn indices_deleted(&self) -> Vec<ResourceId> {
        self.previous
            .indices
            .keys()
            .filter(|id| !self.current.indices.contains_key(*id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_resources_require_policy_name() {
        let mut blank = IndexMetadata::default();
        blank.settings.insert(POLICY_NAME_SETTING.to_string(), "  ".to_string());

        let state = ClusterState::new(NodeId::new("n1"))
            .with_index(ResourceId::new("a"), IndexMetadata::managed_by("hot"))
            .with_index(ResourceId::new("b"), IndexMetadata::default())
            .with_index(ResourceId::new("c"), blank);

        let managed = state.managed_resources();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed.get(&ResourceId::new("a")).map(String::as_str), Some("hot"));
    }

    #[test]
    fn test_changed_event() {
        let before = Arc::new(
            ClusterState::new(NodeId::new("n1"))
                .with_index(ResourceId::new("a"), IndexMetadata::managed_by("hot")),
        );
        let after = Arc::new(ClusterState::new(NodeId::new("n1")).with_node(NodeId::new("n2")));

        let event = ClusterChangedEvent::new(before, after);
        assert!(event.metadata_changed());
        assert!(event.nodes_changed());
        assert_eq!(event.indices_deleted(), vec![ResourceId::new("a")]);
    }
}
