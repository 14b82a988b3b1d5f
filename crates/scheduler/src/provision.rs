//! Builds instances for resources that start being managed.

use ilm_core::{InstanceState, InstanceStatus, ResourceId};
use ilm_execution::{InstanceFactory, InstanceHandle, Policy, PolicySource};
use ilm_storage::StateRepository;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Fetches or creates instance states and builds instances through the factory.
#[derive(Clone)]
pub struct InstanceProvisioner {
    repository: StateRepository,
    policies: Arc<dyn PolicySource>,
    factory: Arc<dyn InstanceFactory>,
}

impl InstanceProvisioner {
    /// Create a provisioner.
    pub fn new(repository: StateRepository, policies: Arc<dyn PolicySource>, factory: Arc<dyn InstanceFactory>) -> Self {
        Self {
            repository,
            policies,
            factory,
        }
    }

    /// The policy source
    pub fn policies(&self) -> &Arc<dyn PolicySource> {
        &self.policies
    }

    /// Build instances for `wanted` (resource to policy name).
    ///
    /// A persisted state is reused when it is not DELETED and belongs to the
    /// same policy; otherwise a fresh state is written. Resources whose policy
    /// cannot be loaded are skipped and logged.
    pub async fn provision(&self, wanted: &BTreeMap<ResourceId, String>) -> Vec<Arc<dyn InstanceHandle>> {
        if wanted.is_empty() {
            return Vec::new();
        }
        tracing::debug!("Provisioning instances for {} resources", wanted.len());

        let ids: Vec<ResourceId> = wanted.keys().cloned().collect();
        let mut existing = self.repository.get_many(&ids).await;

        let mut policies: BTreeMap<&str, Arc<Policy>> = BTreeMap::new();
        let names: BTreeSet<&str> = wanted.values().map(String::as_str).collect();
        for name in names {
            match self.policies.get_policy(name).await {
                Ok(Some(policy)) => {
                    policies.insert(name, policy);
                }
                Ok(None) => {
                    let resources: Vec<_> = wanted.iter().filter(|(_, p)| *p == name).map(|(id, _)| id.as_str()).collect();
                    tracing::warn!(
                        "Could not create instances for {:?} because policy {} does not exist",
                        resources,
                        name
                    );
                }
                Err(e) => tracing::warn!("Could not load policy {}: {}", name, e),
            }
        }

        let mut planned = Vec::new();
        let mut new_states = BTreeMap::new();
        for (id, policy_name) in wanted {
            let Some(policy) = policies.get(policy_name.as_str()) else {
                continue;
            };
            let state = match existing.remove(id) {
                Some(state) if state.status != InstanceStatus::Deleted && state.policy_name() == policy_name => {
                    tracing::trace!("Reusing state of {}: {} at {}", id, state.status, state.current_step);
                    state
                }
                _ => {
                    let state = InstanceState::new(policy_name.clone());
                    new_states.insert(id.clone(), state.clone());
                    state
                }
            };
            planned.push((id.clone(), policy.clone(), state));
        }

        self.repository.bulk_delete_create(&[], &new_states).await;

        let mut instances = Vec::with_capacity(planned.len());
        for (id, policy, state) in planned {
            instances.push(self.factory.create(id, policy, state).await);
        }
        instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilm_execution::testkit::{memory_context, ScriptedAction};
    use ilm_execution::{InMemoryPolicySource, RunnerFactory, Step};
    use ilm_storage::StateStore;

    async fn setup() -> (InstanceProvisioner, Arc<ilm_storage::MemoryStore>) {
        let (ctx, store) = memory_context();
        let source = Arc::new(InMemoryPolicySource::new());
        source
            .put(Policy::new("hot", vec![Step::new("s").with_action(ScriptedAction::succeeding("a"))]))
            .await;
        let provisioner = InstanceProvisioner::new(
            ctx.repository.clone(),
            source,
            Arc::new(RunnerFactory::new(ctx)),
        );
        (provisioner, store)
    }

    fn wanted(entries: &[(&str, &str)]) -> BTreeMap<ResourceId, String> {
        entries.iter().map(|(id, p)| (ResourceId::new(*id), p.to_string())).collect()
    }

    #[tokio::test]
    async fn test_creates_fresh_states() {
        let (provisioner, store) = setup().await;
        let instances = provisioner.provision(&wanted(&[("a", "hot"), ("b", "missing")])).await;

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].resource().as_str(), "a");
        let state = store.get_state(&ResourceId::new("a")).await.unwrap().unwrap();
        assert_eq!(state.status, InstanceStatus::NotStarted);
        assert!(store.get_state(&ResourceId::new("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reuses_live_state_only() {
        let (provisioner, store) = setup().await;
        let mut waiting = InstanceState::new("hot");
        waiting.status = InstanceStatus::Waiting;
        waiting.current_step = "s".to_string();
        store.put_state(&ResourceId::new("a"), &waiting).await.unwrap();

        let mut deleted = InstanceState::new("hot");
        deleted.status = InstanceStatus::Deleted;
        store.put_state(&ResourceId::new("b"), &deleted).await.unwrap();

        let mut other_policy = InstanceState::new("warm");
        other_policy.status = InstanceStatus::Failed;
        store.put_state(&ResourceId::new("c"), &other_policy).await.unwrap();

        provisioner.provision(&wanted(&[("a", "hot"), ("b", "hot"), ("c", "hot")])).await;

        assert_eq!(store.get_state(&ResourceId::new("a")).await.unwrap(), Some(waiting));
        for id in ["b", "c"] {
            let state = store.get_state(&ResourceId::new(id)).await.unwrap().unwrap();
            assert_eq!(state, InstanceState::new("hot"));
        }
    }
}
