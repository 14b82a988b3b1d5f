//! Distributed driver: jobs in a [`JobScheduler`], spread over eligible nodes.
//!
//! Each node only creates jobs for the resources its [`JobDistributor`]
//! assigns to it. A resource leaving the cluster (or switching policy) has
//! its job deleted and its instance marked DELETED. A resource that is merely
//! reassigned to another node has its local job dropped without touching the
//! persisted state, which the new owner picks up.

use crate::control::ManualControl;
use crate::jobs::{JobDetail, JobExecuted, JobScheduler, Trigger, JOB_GROUP};
use crate::{diff_membership, initial_delay, ClusterService, InstanceProvisioner, JobDistributor};
use async_trait::async_trait;
use ilm_core::{ClusterChangedEvent, ClusterState, DynamicSetting, JobKey, ResourceId, Settings};
use ilm_execution::PolicyEvent;
use ilm_storage::StateRepository;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

struct Inner {
    cluster: Arc<dyn ClusterService>,
    settings: Settings,
    provisioner: InstanceProvisioner,
    repository: StateRepository,
    scheduler: Arc<dyn JobScheduler>,
    distributor: Arc<dyn JobDistributor>,
    reconciling: Mutex<()>,
    listeners: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Drives instances through a job scheduler shared out across nodes.
#[derive(Clone)]
pub struct DistributedDriver {
    inner: Arc<Inner>,
}

impl DistributedDriver {
    /// Create a driver. Nothing is scheduled until [`start`](Self::start).
    pub fn new(
        cluster: Arc<dyn ClusterService>,
        settings: Settings,
        provisioner: InstanceProvisioner,
        repository: StateRepository,
        scheduler: Arc<dyn JobScheduler>,
        distributor: Arc<dyn JobDistributor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cluster,
                settings,
                provisioner,
                repository,
                scheduler,
                distributor,
                reconciling: Mutex::new(()),
                listeners: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to changes and create the jobs assigned to this node.
    pub async fn start(&self) {
        if !self.inner.settings.engine.enabled {
            tracing::info!("Lifecycle management is disabled on this node");
            return;
        }

        let state = self.inner.cluster.state();
        self.update_distribution(&state);

        let handles = vec![
            tokio::spawn(self.clone().cluster_listener(self.inner.cluster.subscribe())),
            tokio::spawn(self.clone().settings_listener(self.inner.settings.dynamic.subscribe())),
            tokio::spawn(self.clone().policy_listener(self.inner.provisioner.policies().subscribe())),
            tokio::spawn(self.clone().executed_listener(self.inner.scheduler.subscribe_executed())),
        ];
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(handles);

        tracing::info!("Distributed driver started");
        self.reconcile(&state).await;
    }

    /// Stop listening and drop every local job. Instance states are left untouched.
    pub async fn stop(&self) {
        let listeners: Vec<_> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for listener in listeners {
            listener.abort();
        }
        self.suspend().await;
        tracing::info!("Distributed driver stopped");
    }

    /// Reconcile against the current cluster state.
    pub async fn resync(&self) {
        let state = self.inner.cluster.state();
        self.reconcile(&state).await;
    }

    /// Handle a cluster change.
    pub async fn on_cluster_changed(&self, event: &ClusterChangedEvent) {
        if event.nodes_changed() {
            self.global_reschedule(&event.current).await;
        } else if event.metadata_changed() {
            self.reconcile(&event.current).await;
        }
    }

    fn job_key(resource: &ResourceId) -> JobKey {
        JobKey::for_resource(resource, JOB_GROUP)
    }

    fn default_trigger(&self, job: JobKey) -> Trigger {
        let values = self.inner.settings.dynamic.current();
        Trigger::interval(job, values.execution_period(), initial_delay(&values))
    }

    fn update_distribution(&self, state: &ClusterState) -> bool {
        let filter = self.inner.settings.dynamic.current().node_filter;
        match self.inner.distributor.update(&state.nodes, filter.as_deref()) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!("Keeping previous job distribution: {}", e);
                false
            }
        }
    }

    async fn local_jobs(&self) -> Vec<JobDetail> {
        let mut details = Vec::new();
        for key in self.inner.scheduler.job_keys(JOB_GROUP).await {
            if let Some(detail) = self.inner.scheduler.job_detail(&key).await {
                details.push(detail);
            }
        }
        details
    }

    async fn reconcile(&self, state: &ClusterState) {
        let _guard = self.inner.reconciling.lock().await;
        if !self.inner.settings.dynamic.current().active {
            tracing::debug!("Lifecycle management is inactive, skipping reconciliation");
            return;
        }

        let managed = state.managed_resources();
        let desired: BTreeMap<ResourceId, String> = managed
            .iter()
            .filter(|(id, _)| self.inner.distributor.is_local(&Self::job_key(id)))
            .map(|(id, policy)| (id.clone(), policy.clone()))
            .collect();

        let mut details: BTreeMap<ResourceId, JobDetail> = BTreeMap::new();
        for detail in self.local_jobs().await {
            details.insert(detail.key.resource(), detail);
        }
        let current = details
            .iter()
            .map(|(id, d)| (id.clone(), d.policy_name().to_string()))
            .collect();

        let diff = diff_membership(&desired, &current);
        if diff.is_empty() {
            return;
        }

        for id in &diff.removed {
            let Some(detail) = details.remove(id) else {
                continue;
            };
            if let Err(e) = self.inner.scheduler.delete_job(&detail.key).await {
                tracing::warn!("Failed to delete job {}: {}", detail.key, e);
            }
            if managed.get(id).map(String::as_str) == Some(detail.policy_name()) {
                tracing::debug!("{} is now assigned to another node", id);
                detail.instance.quiesce().await;
            } else {
                detail.instance.handle_delete().await;
                if diff.added.contains_key(id) {
                    detail.instance.quiesce().await;
                }
            }
        }

        for instance in self.inner.provisioner.provision(&diff.added).await {
            let detail = JobDetail::new(instance);
            let trigger = self.default_trigger(detail.key.clone());
            let key = detail.key.clone();
            if let Err(e) = self.inner.scheduler.schedule_job(detail, vec![trigger]).await {
                tracing::warn!("Failed to schedule job {}: {}", key, e);
            }
        }
    }

    /// Drop every local job and wait for their in-flight ticks. Instance states are left untouched.
    async fn suspend(&self) {
        let _guard = self.inner.reconciling.lock().await;
        let details = self.local_jobs().await;
        tracing::debug!("Dropping {} local jobs", details.len());
        self.inner.scheduler.clear().await;
        for detail in details {
            detail.instance.quiesce().await;
        }
    }

    /// Drop every local job and re-derive the local set from the current distribution.
    async fn global_reschedule(&self, state: &ClusterState) {
        self.update_distribution(state);
        self.suspend().await;
        self.reconcile(state).await;
    }

    /// Replace every interval trigger with one using the current period.
    async fn reschedule_periods(&self) {
        let _guard = self.inner.reconciling.lock().await;
        for key in self.inner.scheduler.job_keys(JOB_GROUP).await {
            for trigger in self.inner.scheduler.triggers_of_job(&key).await {
                if trigger.period().is_none() {
                    continue;
                }
                let replacement = self.default_trigger(key.clone());
                if let Err(e) = self.inner.scheduler.reschedule_job(&trigger.key, replacement).await {
                    tracing::warn!("Failed to reschedule job {}: {}", key, e);
                }
            }
        }
    }

    /// Drop the jobs of the given policies. `delete` marks their states DELETED.
    async fn drop_policies(&self, names: &[String], delete: bool) {
        let _guard = self.inner.reconciling.lock().await;
        for detail in self.local_jobs().await {
            if !names.iter().any(|n| n == detail.policy_name()) {
                continue;
            }
            if let Err(e) = self.inner.scheduler.delete_job(&detail.key).await {
                tracing::warn!("Failed to delete job {}: {}", detail.key, e);
            }
            if delete {
                detail.instance.handle_delete().await;
            } else {
                detail.instance.quiesce().await;
            }
        }
    }

    async fn on_settings_changed(&self, changed: &[DynamicSetting]) {
        if changed.contains(&DynamicSetting::Active) {
            if self.inner.settings.dynamic.current().active {
                tracing::info!("Lifecycle management activated");
                self.resync().await;
            } else {
                tracing::info!("Lifecycle management deactivated, dropping local jobs");
                self.suspend().await;
            }
            return;
        }
        if changed.contains(&DynamicSetting::NodeFilter) {
            let state = self.inner.cluster.state();
            self.global_reschedule(&state).await;
            return;
        }
        if changed.contains(&DynamicSetting::ExecutionPeriod) {
            self.reschedule_periods().await;
        }
    }

    async fn on_policy_event(&self, event: &PolicyEvent) {
        match event {
            PolicyEvent::Created(_) => self.resync().await,
            PolicyEvent::Updated(names) => {
                self.drop_policies(names, false).await;
                self.resync().await;
            }
            PolicyEvent::Deleted(names) => self.drop_policies(names, true).await,
        }
    }

    /// A fire of a trigger whose period no longer matches the setting replaces it.
    async fn on_job_executed(&self, executed: &JobExecuted) {
        let Some(period) = executed.trigger.period() else {
            return;
        };
        let expected = self.inner.settings.dynamic.current().execution_period();
        if period == expected {
            return;
        }
        tracing::debug!(
            "Trigger of {} runs every {:?} instead of {:?}, rescheduling",
            executed.job,
            period,
            expected
        );
        let replacement = self.default_trigger(executed.job.clone());
        if let Err(e) = self.inner.scheduler.reschedule_job(&executed.trigger.key, replacement).await {
            tracing::debug!("Could not reschedule job {}: {}", executed.job, e);
        }
    }

    async fn cluster_listener(self, mut events: broadcast::Receiver<ClusterChangedEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.on_cluster_changed(&event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} cluster events, rescheduling", n);
                    let state = self.inner.cluster.state();
                    self.global_reschedule(&state).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn settings_listener(self, mut changes: broadcast::Receiver<Vec<DynamicSetting>>) {
        loop {
            match changes.recv().await {
                Ok(changed) => self.on_settings_changed(&changed).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} settings changes, rescheduling", n);
                    self.reschedule_periods().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn policy_listener(self, mut events: broadcast::Receiver<PolicyEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.on_policy_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} policy events, resyncing", n);
                    self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn executed_listener(self, mut events: broadcast::Receiver<JobExecuted>) {
        loop {
            match events.recv().await {
                Ok(executed) => self.on_job_executed(&executed).await,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[async_trait]
impl ManualControl for DistributedDriver {
    async fn execute_now(&self, resource: &ResourceId) -> bool {
        let key = Self::job_key(resource);
        if !self.inner.scheduler.check_exists(&key).await {
            tracing::debug!("Job {} does not exist on this node", key);
            return false;
        }
        if !self.inner.repository.active_state_exists(resource).await {
            tracing::debug!("Instance for {} has no active state", resource);
            return false;
        }
        match self.inner.scheduler.schedule_trigger(Trigger::once(key.clone())).await {
            Ok(()) => {
                tracing::debug!("Job {} triggered", key);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to trigger job {}: {}", key, e);
                false
            }
        }
    }

    async fn request_retry(&self, resource: &ResourceId) -> bool {
        let Some(detail) = self.inner.scheduler.job_detail(&Self::job_key(resource)).await else {
            return false;
        };
        if !self.inner.repository.active_state_exists(resource).await {
            return false;
        }
        detail.instance.request_retry();
        true
    }

    async fn instance_exists_for_policy(&self, policy_name: &str) -> bool {
        self.local_jobs().await.iter().any(|d| d.policy_name() == policy_name)
    }
}
