//! Assignment of jobs to cluster nodes.

use crate::jobs::Result;
use ilm_core::{JobKey, NodeId};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

/// Decides which node runs a job.
pub trait JobDistributor: Send + Sync {
    /// Whether the local node owns the job.
    fn is_local(&self, job: &JobKey) -> bool;

    /// Recompute the eligible nodes. Returns true if the assignment may have changed.
    fn update(&self, nodes: &BTreeSet<NodeId>, node_filter: Option<&str>) -> Result<bool>;
}

/// Modulo hash distribution: a job belongs to the eligible node at
/// `hash(job) % eligible.len()` in name order.
pub struct HashJobDistributor {
    local: NodeId,
    eligible: RwLock<Vec<NodeId>>,
}

impl HashJobDistributor {
    /// Create a distributor where only the local node is eligible.
    pub fn new(local: NodeId) -> Self {
        Self {
            eligible: RwLock::new(vec![local.clone()]),
            local,
        }
    }

    /// Eligible nodes in assignment order.
    pub fn eligible(&self) -> Vec<NodeId> {
        self.eligible.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn owner(&self, job: &JobKey) -> Option<NodeId> {
        let eligible = self.eligible.read().unwrap_or_else(PoisonError::into_inner);
        if eligible.is_empty() {
            return None;
        }
        let hash = blake3::hash(job.to_string().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        let slot = u64::from_le_bytes(prefix) % eligible.len() as u64;
        eligible.get(slot as usize).cloned()
    }
}

impl JobDistributor for HashJobDistributor {
    fn is_local(&self, job: &JobKey) -> bool {
        self.owner(job).as_ref() == Some(&self.local)
    }

    fn update(&self, nodes: &BTreeSet<NodeId>, node_filter: Option<&str>) -> Result<bool> {
        let filter = node_filter.map(Regex::new).transpose()?;
        let next: Vec<NodeId> = nodes
            .iter()
            .filter(|n| filter.as_ref().map_or(true, |f| f.is_match(n.as_str())))
            .cloned()
            .collect();

        let mut eligible = self.eligible.write().unwrap_or_else(PoisonError::into_inner);
        if *eligible == next {
            return Ok(false);
        }
        tracing::info!("Eligible nodes changed: {:?} -> {:?}", *eligible, next);
        *eligible = next;
        Ok(true)
    }
}
