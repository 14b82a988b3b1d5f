//! Membership diffing between the desired and the managed resource sets.

use ilm_core::ResourceId;
use std::collections::BTreeMap;

/// What to stop and what to start managing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Resources to stop managing
    pub removed: Vec<ResourceId>,
    /// Resources to start managing, with their policy names
    pub added: BTreeMap<ResourceId, String>,
}

impl MembershipDiff {
    /// Whether nothing changes.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Diff `desired` against `managed` (both map resource to policy name).
///
/// A resource whose policy name changed is both removed and added.
pub fn diff_membership(
    desired: &BTreeMap<ResourceId, String>,
    managed: &BTreeMap<ResourceId, String>,
) -> MembershipDiff {
    let removed = managed
        .iter()
        .filter(|(id, policy)| desired.get(*id) != Some(*policy))
        .map(|(id, _)| id.clone())
        .collect();
    let added = desired
        .iter()
        .filter(|(id, policy)| managed.get(*id) != Some(*policy))
        .map(|(id, policy)| (id.clone(), policy.clone()))
        .collect();
    MembershipDiff { removed, added }
}
