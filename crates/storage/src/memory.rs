//! In-memory storage backend.

use super::{AuditSink, Result, StateStore, StorageError, TriggerState, TriggerStateStore};
use async_trait::async_trait;
use ilm_core::{AuditRecord, InstanceState, JobKey, ResourceId, StateLogSettings};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct AuditLayout {
    templates: BTreeSet<String>,
    aliases: BTreeMap<String, String>,
    indices: BTreeMap<String, Vec<AuditRecord>>,
}

/// Process-local backend for tests and single-node runs.
pub struct MemoryStore {
    states: Arc<RwLock<BTreeMap<ResourceId, InstanceState>>>,
    audit: Arc<RwLock<AuditLayout>>,
    triggers: Arc<RwLock<BTreeMap<JobKey, TriggerState>>>,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(BTreeMap::new())),
            audit: Arc::new(RwLock::new(AuditLayout::default())),
            triggers: Arc::new(RwLock::new(BTreeMap::new())),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every write fail until switched back, as an unreachable store would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Other("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Number of audit records stored in all state log indices.
    pub async fn audit_len(&self) -> usize {
        self.audit.read().await.indices.values().map(Vec::len).sum()
    }

    /// Whether the state log layout exists.
    pub async fn audit_provisioned(&self, layout: &StateLogSettings) -> bool {
        let audit = self.audit.read().await;
        audit.templates.contains(&layout.index_template_name)
            && audit.aliases.contains_key(&layout.write_alias())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_state(&self, id: &ResourceId) -> Result<Option<InstanceState>> {
        Ok(self.states.read().await.get(id).cloned())
    }

    async fn put_state(&self, id: &ResourceId, state: &InstanceState) -> Result<()> {
        self.check_available()?;
        state.validate()?;
        self.states.write().await.insert(id.clone(), state.clone());
        Ok(())
    }

    async fn delete_state(&self, id: &ResourceId) -> Result<()> {
        self.check_available()?;
        self.states.write().await.remove(id);
        Ok(())
    }

    async fn list_states(&self) -> Result<Vec<(ResourceId, InstanceState)>> {
        Ok(self
            .states
            .read()
            .await
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn provision(&self, layout: &StateLogSettings) -> Result<()> {
        self.check_available()?;
        let mut audit = self.audit.write().await;
        audit.templates.insert(layout.index_template_name.clone());

        let write_alias = layout.write_alias();
        if !audit.aliases.contains_key(&write_alias) {
            let first = layout.first_index();
            audit.indices.entry(first.clone()).or_default();
            audit.aliases.insert(layout.alias_name.clone(), first.clone());
            audit.aliases.insert(write_alias, first);
        }
        Ok(())
    }

    async fn append(&self, write_alias: &str, record: &AuditRecord) -> Result<()> {
        self.check_available()?;
        let mut audit = self.audit.write().await;
        let index = audit
            .aliases
            .get(write_alias)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("alias {}", write_alias)))?;
        audit.indices.entry(index).or_default().push(record.clone());
        Ok(())
    }

    async fn tail(&self, alias: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        let audit = self.audit.read().await;
        let index = audit
            .aliases
            .get(alias)
            .ok_or_else(|| StorageError::NotFound(format!("alias {}", alias)))?;
        let records = audit.indices.get(index).map(Vec::as_slice).unwrap_or_default();
        let skip = records.len().saturating_sub(limit);
        Ok(records[skip..].to_vec())
    }
}

#[async_trait]
impl TriggerStateStore for MemoryStore {
    async fn get_trigger(&self, job: &JobKey) -> Result<Option<TriggerState>> {
        Ok(self.triggers.read().await.get(job).cloned())
    }

    async fn put_trigger(&self, state: &TriggerState) -> Result<()> {
        self.check_available()?;
        self.triggers.write().await.insert(state.job.clone(), state.clone());
        Ok(())
    }

    async fn delete_trigger(&self, job: &JobKey) -> Result<()> {
        self.check_available()?;
        self.triggers.write().await.remove(job);
        Ok(())
    }

    async fn list_triggers(&self) -> Result<Vec<TriggerState>> {
        Ok(self.triggers.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilm_core::InstanceStatus;

    #[tokio::test]
    async fn test_state_crud() {
        let store = MemoryStore::new();
        let id = ResourceId::new("logs-1");
        assert!(store.get_state(&id).await.unwrap().is_none());

        let mut state = InstanceState::new("hot");
        store.put_state(&id, &state).await.unwrap();
        state.status = InstanceStatus::Waiting;
        store.put_state(&id, &state).await.unwrap();
        assert_eq!(store.get_state(&id).await.unwrap(), Some(state));

        store.delete_state(&id).await.unwrap();
        store.delete_state(&id).await.unwrap();
        assert!(store.list_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_writes() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let failures = store
            .bulk(&[], &[(ResourceId::new("a"), InstanceState::new("hot"))])
            .await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ResourceId::new("a"));
    }

    #[tokio::test]
    async fn test_audit_requires_provisioning() {
        let store = MemoryStore::new();
        let layout = StateLogSettings::default();
        let record = AuditRecord::new(ResourceId::new("a"), InstanceState::new("hot"));

        assert!(store.append(&layout.write_alias(), &record).await.is_err());

        store.provision(&layout).await.unwrap();
        store.provision(&layout).await.unwrap();
        store.append(&layout.write_alias(), &record).await.unwrap();

        let tail = store.tail(&layout.alias_name, 10).await.unwrap();
        assert_eq!(tail, vec![record]);
        assert!(store.audit_provisioned(&layout).await);
    }
}
