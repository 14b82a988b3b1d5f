//! State repository: the engine's only path to persisted instance states.

use super::{AuditLog, Result, StateStore, StorageError};
use ilm_core::{InstanceState, InstanceStatus, ResourceId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of a best-effort write. Callers are free to ignore it.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The state is durable
    Written,
    /// The write failed and was logged
    Failed(StorageError),
}

impl WriteOutcome {
    /// Whether the state is durable.
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written)
    }
}

/// Gateway over a [`StateStore`] that also feeds the state log.
#[derive(Clone)]
pub struct StateRepository {
    store: Arc<dyn StateStore>,
    audit: Option<Arc<AuditLog>>,
}

impl StateRepository {
    /// Create a repository that offers every written state to the audit log.
    pub fn new(store: Arc<dyn StateStore>, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            audit: Some(audit),
        }
    }

    /// Create a repository without a state log.
    pub fn without_audit(store: Arc<dyn StateStore>) -> Self {
        Self { store, audit: None }
    }

    /// Load one state.
    pub async fn get(&self, id: &ResourceId) -> Result<Option<InstanceState>> {
        self.store.get_state(id).await
    }

    /// Load several states. Ids that fail to load are logged and left out.
    pub async fn get_many(&self, ids: &[ResourceId]) -> BTreeMap<ResourceId, InstanceState> {
        let mut states = BTreeMap::new();
        for id in ids {
            match self.store.get_state(id).await {
                Ok(Some(state)) => {
                    states.insert(id.clone(), state);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to load state of {}: {}", id, e),
            }
        }
        states
    }

    /// Write one state and offer it to the audit log.
    pub async fn put(&self, id: &ResourceId, state: &InstanceState) -> WriteOutcome {
        match self.store.put_state(id, state).await {
            Ok(()) => {
                tracing::trace!("State of {} written: {} at {}", id, state.status, state.current_step);
                if let Some(audit) = &self.audit {
                    audit.offer(id, state).await;
                }
                WriteOutcome::Written
            }
            Err(e) => {
                tracing::warn!("Failed to write state of {}: {}", id, e);
                WriteOutcome::Failed(e)
            }
        }
    }

    /// Delete and create states in one request. Per-item failures are logged and returned.
    pub async fn bulk_delete_create(
        &self,
        delete: &[ResourceId],
        create: &BTreeMap<ResourceId, InstanceState>,
    ) -> Vec<(ResourceId, StorageError)> {
        if delete.is_empty() && create.is_empty() {
            return Vec::new();
        }
        let create: Vec<_> = create.iter().map(|(id, s)| (id.clone(), s.clone())).collect();
        let failures = self.store.bulk(delete, &create).await;
        for (id, e) in &failures {
            tracing::warn!("Bulk state operation failed for {}: {}", id, e);
        }
        failures
    }

    /// Whether a non-deleted state exists for the resource.
    pub async fn active_state_exists(&self, id: &ResourceId) -> bool {
        match self.store.get_state(id).await {
            Ok(Some(state)) => state.status != InstanceStatus::Deleted,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Failed to load state of {}: {}", id, e);
                false
            }
        }
    }

    /// List every state.
    pub async fn list(&self) -> Result<Vec<(ResourceId, InstanceState)>> {
        self.store.list_states().await
    }

    /// Physically remove every DELETED state. Returns the number removed.
    pub async fn purge_deleted(&self) -> Result<usize> {
        let deleted: Vec<ResourceId> = self
            .store
            .list_states()
            .await?
            .into_iter()
            .filter(|(_, s)| s.status == InstanceStatus::Deleted)
            .map(|(id, _)| id)
            .collect();

        let failures = self.store.bulk(&deleted, &[]).await;
        for (id, e) in &failures {
            tracing::warn!("Failed to purge state of {}: {}", id, e);
        }
        let purged = deleted.len() - failures.len();
        tracing::info!("Purged {} deleted states", purged);
        Ok(purged)
    }
}
