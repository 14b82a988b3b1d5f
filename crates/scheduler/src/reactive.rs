//! Reactive driver: one local timer per managed resource.
//!
//! Every cluster metadata change is diffed against the managed set. Removed
//! resources have their timer cancelled and their instance deleted; added
//! resources get an instance and a periodic timer. Fires run on a bounded
//! worker pool. Cancelling a timer never aborts a tick that already started.
//!
//! Structural changes are serialized by one reconcile lock. An instance that
//! stops being scheduled without being deleted is quiesced under that lock,
//! so a replacement runner is only built once its last tick is over.

use crate::control::ManualControl;
use crate::{diff_membership, initial_delay, ClusterService, InstanceProvisioner};
use async_trait::async_trait;
use ilm_core::{ClusterChangedEvent, ClusterState, DynamicSetting, ResourceId, Settings};
use ilm_execution::{InstanceHandle, PolicyEvent};
use ilm_storage::StateRepository;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

struct Scheduled {
    timer: JoinHandle<()>,
    instance: Arc<dyn InstanceHandle>,
}

struct Inner {
    cluster: Arc<dyn ClusterService>,
    settings: Settings,
    provisioner: InstanceProvisioner,
    repository: StateRepository,
    managed: Mutex<HashMap<ResourceId, Scheduled>>,
    reconciling: Mutex<()>,
    workers: Arc<Semaphore>,
    listeners: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Drives instances with per-resource timers on this node.
#[derive(Clone)]
pub struct ReactiveDriver {
    inner: Arc<Inner>,
}

impl ReactiveDriver {
    /// Create a driver. Nothing is scheduled until [`start`](Self::start).
    pub fn new(
        cluster: Arc<dyn ClusterService>,
        settings: Settings,
        provisioner: InstanceProvisioner,
        repository: StateRepository,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.engine.thread_pool_size.max(1)));
        Self {
            inner: Arc::new(Inner {
                cluster,
                settings,
                provisioner,
                repository,
                managed: Mutex::new(HashMap::new()),
                reconciling: Mutex::new(()),
                workers,
                listeners: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to cluster, settings and policy changes and schedule the current managed set.
    pub async fn start(&self) {
        if !self.inner.settings.engine.enabled {
            tracing::info!("Lifecycle management is disabled on this node");
            return;
        }

        let cluster_events = self.inner.cluster.subscribe();
        let setting_changes = self.inner.settings.dynamic.subscribe();
        let policy_events = self.inner.provisioner.policies().subscribe();

        let handles = vec![
            tokio::spawn(self.clone().cluster_listener(cluster_events)),
            tokio::spawn(self.clone().settings_listener(setting_changes)),
            tokio::spawn(self.clone().policy_listener(policy_events)),
        ];
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(handles);

        tracing::info!("Reactive driver started");
        self.resync().await;
    }

    /// Stop listening and cancel every timer. Instance states are left untouched.
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
        tracing::info!("Reactive driver stopped");
    }

    /// Reconcile against the current cluster state.
    pub async fn resync(&self) {
        let state = self.inner.cluster.state();
        self.reconcile(&state).await;
    }

    /// Handle a cluster change.
    pub async fn on_cluster_changed(&self, event: &ClusterChangedEvent) {
        if !event.metadata_changed() {
            return;
        }
        self.reconcile(&event.current).await;
    }

    /// Resources currently managed, with their policy names.
    pub async fn managed(&self) -> BTreeMap<ResourceId, String> {
        self.inner
            .managed
            .lock()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.instance.policy_name().to_string()))
            .collect()
    }

    async fn reconcile(&self, state: &ClusterState) {
        let _guard = self.inner.reconciling.lock().await;
        if !self.inner.settings.dynamic.current().active {
            tracing::debug!("Lifecycle management is inactive, skipping reconciliation");
            return;
        }

        let diff = diff_membership(&state.managed_resources(), &self.managed().await);
        if diff.is_empty() {
            return;
        }

        if !diff.removed.is_empty() {
            tracing::debug!("Resources to delete instances for: {:?}", diff.removed);
        }
        let removed: Vec<Scheduled> = {
            let mut managed = self.inner.managed.lock().await;
            diff.removed.iter().filter_map(|id| managed.remove(id)).collect()
        };
        for scheduled in removed {
            scheduled.timer.abort();
            scheduled.instance.handle_delete().await;
            if diff.added.contains_key(scheduled.instance.resource()) {
                scheduled.instance.quiesce().await;
            }
        }

        if !diff.added.is_empty() {
            tracing::debug!("Resources to schedule instances for: {:?}", diff.added.keys().collect::<Vec<_>>());
        }
        let instances = self.inner.provisioner.provision(&diff.added).await;
        let mut managed = self.inner.managed.lock().await;
        for instance in instances {
            let timer = self.schedule(instance.clone());
            managed.insert(instance.resource().clone(), Scheduled { timer, instance });
        }
    }

    fn schedule(&self, instance: Arc<dyn InstanceHandle>) -> JoinHandle<()> {
        let values = self.inner.settings.dynamic.current();
        let period = values.execution_period();
        let delay = initial_delay(&values);
        tracing::trace!(
            "Scheduling {} every {:?} after {:?}",
            instance.resource(),
            period,
            delay
        );

        let workers = self.inner.workers.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                run_on_pool(&workers, instance.clone()).await;
            }
        })
    }

    /// Cancel every timer and reschedule the same instances with the current period.
    async fn reschedule_all(&self) {
        let _guard = self.inner.reconciling.lock().await;
        let mut managed = self.inner.managed.lock().await;
        tracing::debug!("Rescheduling {} instances", managed.len());
        for scheduled in managed.values_mut() {
            scheduled.timer.abort();
            scheduled.timer = self.schedule(scheduled.instance.clone());
        }
    }

    /// Cancel every timer, forget the managed set and wait for in-flight ticks.
    async fn suspend(&self) {
        let _guard = self.inner.reconciling.lock().await;
        let dropped: Vec<Scheduled> = self.inner.managed.lock().await.drain().map(|(_, s)| s).collect();
        for scheduled in &dropped {
            scheduled.timer.abort();
        }
        for scheduled in dropped {
            scheduled.instance.quiesce().await;
        }
    }

    /// Stop managing instances of the given policies. `delete` marks their states DELETED.
    async fn unschedule_policies(&self, names: &[String], delete: bool) {
        let _guard = self.inner.reconciling.lock().await;
        let dropped: Vec<Scheduled> = {
            let mut managed = self.inner.managed.lock().await;
            let ids: Vec<ResourceId> = managed
                .iter()
                .filter(|(_, s)| names.iter().any(|n| n == s.instance.policy_name()))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| managed.remove(id)).collect()
        };
        for scheduled in dropped {
            scheduled.timer.abort();
            if delete {
                scheduled.instance.handle_delete().await;
            } else {
                scheduled.instance.quiesce().await;
            }
        }
    }

    async fn on_settings_changed(&self, changed: &[DynamicSetting]) {
        if changed.contains(&DynamicSetting::Active) {
            if self.inner.settings.dynamic.current().active {
                tracing::info!("Lifecycle management activated");
                self.resync().await;
            } else {
                tracing::info!("Lifecycle management deactivated, suspending all schedules");
                self.suspend().await;
            }
            return;
        }
        if changed.contains(&DynamicSetting::ExecutionPeriod) {
            self.reschedule_all().await;
        }
    }

    async fn on_policy_event(&self, event: &PolicyEvent) {
        match event {
            PolicyEvent::Created(_) => self.resync().await,
            PolicyEvent::Updated(names) => {
                self.unschedule_policies(names, false).await;
                self.resync().await;
            }
            PolicyEvent::Deleted(names) => self.unschedule_policies(names, true).await,
        }
    }

    async fn cluster_listener(self, mut events: broadcast::Receiver<ClusterChangedEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.on_cluster_changed(&event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} cluster events, resyncing", n);
                    self.resync().await;
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
                    self.reschedule_all().await;
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

    async fn active_instance(&self, resource: &ResourceId) -> Option<Arc<dyn InstanceHandle>> {
        let instance = self.inner.managed.lock().await.get(resource).map(|s| s.instance.clone());
        let Some(instance) = instance else {
            tracing::debug!("Instance for {} does not exist", resource);
            return None;
        };
        if !self.inner.repository.active_state_exists(resource).await {
            tracing::debug!("Instance for {} has no active state", resource);
            return None;
        }
        Some(instance)
    }
}

/// Run one tick on the worker pool without waiting for it.
async fn run_on_pool(workers: &Arc<Semaphore>, instance: Arc<dyn InstanceHandle>) {
    let pending = instance.pending_tick();
    let Ok(permit) = workers.clone().acquire_owned().await else {
        return;
    };
    tokio::spawn(async move {
        let _pending = pending;
        let _permit = permit;
        let outcome = instance.tick().await;
        tracing::trace!("Tick of {} ended: {:?}", instance.resource(), outcome);
    });
}

#[async_trait]
impl ManualControl for ReactiveDriver {
    async fn execute_now(&self, resource: &ResourceId) -> bool {
        let Some(instance) = self.active_instance(resource).await else {
            return false;
        };
        run_on_pool(&self.inner.workers, instance).await;
        tracing::debug!("Instance for {} triggered", resource);
        true
    }

    async fn request_retry(&self, resource: &ResourceId) -> bool {
        let Some(instance) = self.active_instance(resource).await else {
            return false;
        };
        instance.request_retry();
        true
    }

    async fn instance_exists_for_policy(&self, policy_name: &str) -> bool {
        self.inner
            .managed
            .lock()
            .await
            .values()
            .any(|s| s.instance.policy_name() == policy_name)
    }
}

/// Settle spawned tasks under a paused clock.
#[cfg(test)]
pub(crate) async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use ilm_core::{IndexMetadata, InstanceStatus, NodeId, StaticSettings};
    use ilm_execution::testkit::{memory_context, FixedCondition, GatedAction, ScriptedAction};
    use ilm_execution::{InMemoryPolicySource, Policy, RunnerFactory, Step};
    use ilm_storage::{MemoryStore, StateStore};
    use crate::LocalClusterService;

    struct Fixture {
        driver: ReactiveDriver,
        cluster: Arc<LocalClusterService>,
        policies: Arc<InMemoryPolicySource>,
        store: Arc<MemoryStore>,
        settings: Settings,
        condition: Arc<FixedCondition>,
        action: Arc<ScriptedAction>,
    }

    async fn fixture() -> Fixture {
        let (mut ctx, store) = memory_context();
        let settings = Settings::new(StaticSettings::default(), ilm_core::DynamicValues {
            execution_period_ms: 1_000,
            execution_random_delay_enabled: false,
            ..Default::default()
        });
        ctx.settings = settings.clone();

        let condition = FixedCondition::new("max_age", true);
        let action = ScriptedAction::succeeding("rollover");
        let policies = Arc::new(InMemoryPolicySource::new());
        policies
            .put(Policy::new(
                "hot",
                vec![
                    Step::new("hot").with_condition(condition.clone()).with_action(action.clone()),
                    Step::new("delete").with_condition(FixedCondition::new("never", false)),
                ],
            ))
            .await;

        let cluster = Arc::new(LocalClusterService::new(ClusterState::new(NodeId::new("node-1"))));
        let provisioner = InstanceProvisioner::new(
            ctx.repository.clone(),
            policies.clone(),
            Arc::new(RunnerFactory::new(ctx.clone())),
        );
        let driver = ReactiveDriver::new(cluster.clone(), settings.clone(), provisioner, ctx.repository.clone());

        Fixture {
            driver,
            cluster,
            policies,
            store,
            settings,
            condition,
            action,
        }
    }

    fn add_index(cluster: &LocalClusterService, name: &str, policy: &str) {
        cluster.update(|s| {
            s.indices.insert(ResourceId::new(name), IndexMetadata::managed_by(policy));
        });
    }

    async fn status(store: &MemoryStore, name: &str) -> InstanceStatus {
        store.get_state(&ResourceId::new(name)).await.unwrap().unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedules_new_resources() {
        let f = fixture().await;
        f.driver.start().await;

        add_index(&f.cluster, "logs-1", "hot");
        settle().await;

        assert!(f.driver.managed().await.contains_key(&ResourceId::new("logs-1")));
        assert_eq!(status(&f.store, "logs-1").await, InstanceStatus::Waiting);
        assert_eq!(f.action.calls(), 1);
        assert!(f.driver.instance_exists_for_policy("hot").await);
        assert!(!f.driver.instance_exists_for_policy("warm").await);
        f.driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_periodically() {
        let f = fixture().await;
        f.condition.set(false);
        add_index(&f.cluster, "logs-1", "hot");
        f.driver.start().await;
        settle().await;
        assert_eq!(f.condition.evaluations(), 1);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(f.condition.evaluations(), 3);
        f.driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_policy_attribute_deletes_instance() {
        let f = fixture().await;
        f.condition.set(false);
        add_index(&f.cluster, "logs-1", "hot");
        f.driver.start().await;
        settle().await;
        assert_eq!(status(&f.store, "logs-1").await, InstanceStatus::Waiting);

        f.cluster.update(|s| {
            s.indices.insert(ResourceId::new("logs-1"), IndexMetadata::default());
        });
        settle().await;

        assert_eq!(status(&f.store, "logs-1").await, InstanceStatus::Deleted);
        assert!(!f.driver.execute_now(&ResourceId::new("logs-1")).await);
        assert!(!f.driver.request_retry(&ResourceId::new("logs-1")).await);

        let evaluations = f.condition.evaluations();
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(f.condition.evaluations(), evaluations);
        f.driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_now_and_retry() {
        let f = fixture().await;
        f.condition.set(false);
        add_index(&f.cluster, "logs-1", "hot");
        f.driver.start().await;
        settle().await;

        assert!(f.driver.execute_now(&ResourceId::new("logs-1")).await);
        settle().await;
        assert_eq!(f.condition.evaluations(), 2);

        assert!(f.driver.request_retry(&ResourceId::new("logs-1")).await);
        assert!(!f.driver.execute_now(&ResourceId::new("unknown")).await);
        f.driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_change_reschedules() {
        let f = fixture().await;
        f.condition.set(false);
        add_index(&f.cluster, "logs-1", "hot");
        f.driver.start().await;
        settle().await;
        assert_eq!(f.condition.evaluations(), 1);

        f.settings.dynamic.update(|v| v.execution_period_ms = 10_000);
        settle().await;
        // Rescheduled timers fire immediately without random delay
        assert_eq!(f.condition.evaluations(), 2);

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(f.condition.evaluations(), 2);
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(f.condition.evaluations(), 3);
        f.driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_suspends_schedules() {
        let f = fixture().await;
        f.condition.set(false);
        add_index(&f.cluster, "logs-1", "hot");
        f.driver.start().await;
        settle().await;

        f.settings.dynamic.update(|v| v.active = false);
        settle().await;
        assert!(f.driver.managed().await.is_empty());
        assert_eq!(status(&f.store, "logs-1").await, InstanceStatus::Waiting);

        let evaluations = f.condition.evaluations();
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(f.condition.evaluations(), evaluations);

        f.settings.dynamic.update(|v| v.active = true);
        settle().await;
        assert_eq!(f.driver.managed().await.len(), 1);
        assert_eq!(f.condition.evaluations(), evaluations + 1);
        f.driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_waits_for_running_action() {
        let f = fixture().await;
        let gate = GatedAction::new("force_merge");
        let never = FixedCondition::new("never", false);
        f.policies
            .put(Policy::new(
                "gated",
                vec![
                    Step::new("merge").with_action(gate.clone()),
                    Step::new("delete").with_condition(never.clone()),
                ],
            ))
            .await;
        add_index(&f.cluster, "logs-1", "gated");
        f.driver.start().await;
        gate.entered().await;
        assert_eq!(status(&f.store, "logs-1").await, InstanceStatus::Running);

        f.settings.dynamic.update(|v| v.active = false);
        settle().await;
        assert!(f.driver.managed().await.is_empty());
        f.settings.dynamic.update(|v| v.active = true);
        settle().await;

        gate.release();
        settle().await;
        tokio::time::sleep(Duration::from_millis(3_000)).await;

        assert_eq!(status(&f.store, "logs-1").await, InstanceStatus::Waiting);
        assert!(never.evaluations() > 0);
        assert_eq!(f.driver.managed().await.len(), 1);
        f.driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_events() {
        let f = fixture().await;
        add_index(&f.cluster, "logs-1", "warm");
        f.driver.start().await;
        settle().await;
        assert!(f.driver.managed().await.is_empty());

        f.policies.put(Policy::new("warm", vec![Step::new("s")])).await;
        settle().await;
        assert_eq!(status(&f.store, "logs-1").await, InstanceStatus::Finished);

        f.policies.remove("warm").await;
        settle().await;
        assert!(f.driver.managed().await.is_empty());
        assert_eq!(status(&f.store, "logs-1").await, InstanceStatus::Deleted);
        f.driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_update_keeps_state() {
        let f = fixture().await;
        f.condition.set(false);
        add_index(&f.cluster, "logs-1", "hot");
        f.driver.start().await;
        settle().await;

        let replacement = ScriptedAction::succeeding("shrink");
        f.policies
            .put(Policy::new("hot", vec![Step::new("hot").with_action(replacement.clone())]))
            .await;
        settle().await;

        assert_eq!(replacement.calls(), 1);
        assert_eq!(status(&f.store, "logs-1").await, InstanceStatus::Finished);
        assert_eq!(f.driver.managed().await.len(), 1);
        f.driver.stop().await;
    }
}
