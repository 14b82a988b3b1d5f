//! In-process job scheduler.
//!
//! Every trigger is a tokio task. Fires acquire a permit of the worker pool
//! and run the tick on their own task, so a slow instance never delays other
//! triggers. Interval trigger cadence is persisted when a
//! [`TriggerStateStore`] is configured and picked up again when the same job
//! is scheduled with the same period.

use crate::jobs::{JobDetail, JobExecuted, JobScheduler, Result, Schedule, SchedulerError, Trigger};
use async_trait::async_trait;
use chrono::Utc;
use ilm_core::{JobKey, TriggerKey};
use ilm_storage::{TriggerState, TriggerStateStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

struct JobEntry {
    detail: JobDetail,
    triggers: HashMap<TriggerKey, (Trigger, JoinHandle<()>)>,
}

struct Inner {
    jobs: Mutex<HashMap<JobKey, JobEntry>>,
    workers: Arc<Semaphore>,
    executed: broadcast::Sender<JobExecuted>,
    trigger_states: Option<Arc<dyn TriggerStateStore>>,
    shut_down: AtomicBool,
}

/// Job scheduler running on the local tokio runtime.
#[derive(Clone)]
pub struct LocalJobScheduler {
    inner: Arc<Inner>,
}

impl LocalJobScheduler {
    /// Create a scheduler running at most `pool_size` ticks at once.
    pub fn new(pool_size: usize, trigger_states: Option<Arc<dyn TriggerStateStore>>) -> Self {
        let (executed, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(pool_size.max(1))),
                executed,
                trigger_states,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::Shutdown);
        }
        Ok(())
    }

    /// Delay before the first fire, resuming a persisted cadence when possible.
    ///
    /// Trigger state persistence is best effort: a failed read or write is
    /// logged and the trigger starts after its own start delay.
    async fn first_delay(&self, trigger: &Trigger) -> Duration {
        let (Some(store), Some(period)) = (&self.inner.trigger_states, trigger.period()) else {
            return trigger.start_delay;
        };

        let now = Utc::now();
        let stored = match store.get_trigger(&trigger.job).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Failed to load trigger state of {}: {}", trigger.job, e);
                None
            }
        };
        let resumed = stored.as_ref().and_then(|s| {
            if s.period_ms != period.as_millis() as u64 {
                return None;
            }
            (s.next_fire_time - now).to_std().ok()
        });
        if let Some(delay) = resumed {
            tracing::debug!("Resuming cadence of {}, next fire in {:?}", trigger.job, delay);
        }
        let delay = resumed.unwrap_or(trigger.start_delay);

        let state = TriggerState {
            job: trigger.job.clone(),
            trigger: trigger.key.clone(),
            period_ms: period.as_millis() as u64,
            previous_fire_time: stored.and_then(|s| s.previous_fire_time),
            next_fire_time: now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        if let Err(e) = store.put_trigger(&state).await {
            tracing::warn!("Failed to persist trigger state of {}: {}", trigger.job, e);
        }
        delay
    }

    fn spawn_trigger(&self, detail: JobDetail, trigger: Trigger, delay: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match trigger.schedule {
                Schedule::Interval(period) => {
                    let mut interval = tokio::time::interval_at(Instant::now() + delay, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        inner.fire(&detail, &trigger).await;
                        inner.record_fire(&trigger, period).await;
                    }
                }
                Schedule::Once => {
                    tokio::time::sleep(delay).await;
                    inner.fire(&detail, &trigger).await;
                    if let Some(entry) = inner.jobs.lock().await.get_mut(&trigger.job) {
                        entry.triggers.remove(&trigger.key);
                    }
                }
            }
        })
    }
}

impl Inner {
    async fn fire(&self, detail: &JobDetail, trigger: &Trigger) {
        let pending = detail.instance.pending_tick();
        let Ok(permit) = self.workers.clone().acquire_owned().await else {
            return;
        };
        tracing::trace!("Trigger {} fired job {}", trigger.key, detail.key);

        let instance = detail.instance.clone();
        let executed = self.executed.clone();
        let job = detail.key.clone();
        let trigger = trigger.clone();
        tokio::spawn(async move {
            let _pending = pending;
            let _permit = permit;
            let outcome = instance.tick().await;
            let _ = executed.send(JobExecuted { job, trigger, outcome });
        });
    }

    async fn record_fire(&self, trigger: &Trigger, period: Duration) {
        let Some(store) = &self.trigger_states else {
            return;
        };
        let now = Utc::now();
        let state = TriggerState {
            job: trigger.job.clone(),
            trigger: trigger.key.clone(),
            period_ms: period.as_millis() as u64,
            previous_fire_time: Some(now),
            next_fire_time: now + chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        if let Err(e) = store.put_trigger(&state).await {
            tracing::warn!("Failed to persist trigger state of {}: {}", trigger.job, e);
        }
    }
}

#[async_trait]
impl JobScheduler for LocalJobScheduler {
    async fn schedule_job(&self, detail: JobDetail, triggers: Vec<Trigger>) -> Result<()> {
        self.check_running()?;
        if self.inner.jobs.lock().await.contains_key(&detail.key) {
            return Err(SchedulerError::JobExists(detail.key));
        }

        let mut delays = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            delays.push(self.first_delay(trigger).await);
        }

        let mut jobs = self.inner.jobs.lock().await;
        if jobs.contains_key(&detail.key) {
            return Err(SchedulerError::JobExists(detail.key));
        }
        let mut entry = JobEntry {
            detail: detail.clone(),
            triggers: HashMap::new(),
        };
        for (trigger, delay) in triggers.into_iter().zip(delays) {
            let handle = self.spawn_trigger(detail.clone(), trigger.clone(), delay);
            entry.triggers.insert(trigger.key.clone(), (trigger, handle));
        }
        tracing::debug!("Scheduled job {} with {} triggers", detail.key, entry.triggers.len());
        jobs.insert(detail.key, entry);
        Ok(())
    }

    async fn schedule_trigger(&self, trigger: Trigger) -> Result<()> {
        self.check_running()?;
        let detail = self
            .job_detail(&trigger.job)
            .await
            .ok_or_else(|| SchedulerError::JobNotFound(trigger.job.clone()))?;
        let delay = self.first_delay(&trigger).await;

        let mut jobs = self.inner.jobs.lock().await;
        let entry = jobs
            .get_mut(&trigger.job)
            .ok_or_else(|| SchedulerError::JobNotFound(trigger.job.clone()))?;
        let handle = self.spawn_trigger(detail, trigger.clone(), delay);
        entry.triggers.insert(trigger.key.clone(), (trigger, handle));
        Ok(())
    }

    async fn reschedule_job(&self, old: &TriggerKey, new: Trigger) -> Result<()> {
        self.check_running()?;
        let detail = self
            .job_detail(&new.job)
            .await
            .ok_or_else(|| SchedulerError::JobNotFound(new.job.clone()))?;
        if !self.triggers_of_job(&new.job).await.iter().any(|t| &t.key == old) {
            return Err(SchedulerError::TriggerNotFound(old.clone()));
        }
        let delay = self.first_delay(&new).await;

        let mut jobs = self.inner.jobs.lock().await;
        let entry = jobs
            .get_mut(&new.job)
            .ok_or_else(|| SchedulerError::JobNotFound(new.job.clone()))?;
        tracing::trace!("Replacing trigger {} with {}", old, new.key);
        let previous = entry.triggers.remove(old);
        let handle = self.spawn_trigger(detail, new.clone(), delay);
        entry.triggers.insert(new.key.clone(), (new, handle));
        if let Some((_, previous)) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn delete_job(&self, key: &JobKey) -> Result<bool> {
        let Some(entry) = self.inner.jobs.lock().await.remove(key) else {
            return Ok(false);
        };
        for (_, handle) in entry.triggers.into_values() {
            handle.abort();
        }
        if let Some(store) = &self.inner.trigger_states {
            if let Err(e) = store.delete_trigger(key).await {
                tracing::warn!("Failed to delete trigger state of {}: {}", key, e);
            }
        }
        tracing::debug!("Deleted job {}", key);
        Ok(true)
    }

    async fn check_exists(&self, key: &JobKey) -> bool {
        self.inner.jobs.lock().await.contains_key(key)
    }

    async fn job_detail(&self, key: &JobKey) -> Option<JobDetail> {
        self.inner.jobs.lock().await.get(key).map(|e| e.detail.clone())
    }

    async fn job_keys(&self, group: &str) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self
            .inner
            .jobs
            .lock()
            .await
            .keys()
            .filter(|k| k.group == group)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    async fn triggers_of_job(&self, key: &JobKey) -> Vec<Trigger> {
        self.inner
            .jobs
            .lock()
            .await
            .get(key)
            .map(|e| e.triggers.values().map(|(t, _)| t.clone()).collect())
            .unwrap_or_default()
    }

    fn subscribe_executed(&self) -> broadcast::Receiver<JobExecuted> {
        self.inner.executed.subscribe()
    }

    async fn clear(&self) {
        let mut jobs = self.inner.jobs.lock().await;
        for (_, entry) in jobs.drain() {
            for (_, handle) in entry.triggers.into_values() {
                handle.abort();
            }
        }
    }

    async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.clear().await;
        tracing::info!("Job scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JOB_GROUP;
    use crate::reactive::settle;
    use ilm_core::{InstanceStatus, ResourceId};
    use ilm_execution::{InstanceHandle, TickOutcome};
    use ilm_storage::MemoryStore;
    use std::sync::atomic::AtomicU32;

    struct CountingInstance {
        resource: ResourceId,
        ticks: AtomicU32,
    }

    #[async_trait]
    impl InstanceHandle for CountingInstance {
        fn resource(&self) -> &ResourceId {
            &self.resource
        }

        fn policy_name(&self) -> &str {
            "hot"
        }

        async fn tick(&self) -> TickOutcome {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            TickOutcome::Completed(InstanceStatus::Waiting)
        }

        async fn handle_delete(&self) {}

        fn request_retry(&self) {}
    }

    fn job(name: &str) -> (JobDetail, Arc<CountingInstance>) {
        let instance = Arc::new(CountingInstance {
            resource: ResourceId::new(name),
            ticks: AtomicU32::new(0),
        });
        (JobDetail::new(instance.clone()), instance)
    }

    fn ticks(instance: &CountingInstance) -> u32 {
        instance.ticks.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_trigger_fires_periodically() {
        let scheduler = LocalJobScheduler::new(2, None);
        let (detail, instance) = job("logs-1");
        let trigger = Trigger::interval(detail.key.clone(), Duration::from_secs(1), Duration::from_millis(500));
        scheduler.schedule_job(detail, vec![trigger]).await.unwrap();

        settle().await;
        assert_eq!(ticks(&instance), 0);
        tokio::time::sleep(Duration::from_millis(2_600)).await;
        assert_eq!(ticks(&instance), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_job_rejected() {
        let scheduler = LocalJobScheduler::new(2, None);
        let (detail, _) = job("logs-1");
        scheduler.schedule_job(detail.clone(), vec![]).await.unwrap();

        let result = scheduler.schedule_job(detail, vec![]).await;
        assert!(matches!(result, Err(SchedulerError::JobExists(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_trigger_fires_and_detaches() {
        let scheduler = LocalJobScheduler::new(2, None);
        let (detail, instance) = job("logs-1");
        let key = detail.key.clone();
        let periodic = Trigger::interval(key.clone(), Duration::from_secs(60), Duration::from_secs(60));
        scheduler.schedule_job(detail, vec![periodic]).await.unwrap();
        let mut executed = scheduler.subscribe_executed();

        scheduler.schedule_trigger(Trigger::once(key.clone())).await.unwrap();
        assert_eq!(scheduler.triggers_of_job(&key).await.len(), 2);
        settle().await;

        assert_eq!(ticks(&instance), 1);
        assert_eq!(scheduler.triggers_of_job(&key).await.len(), 1);
        let event = executed.recv().await.unwrap();
        assert_eq!(event.job, key);
        assert_eq!(event.trigger.schedule, Schedule::Once);
        assert_eq!(event.outcome, TickOutcome::Completed(InstanceStatus::Waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_trigger() {
        let scheduler = LocalJobScheduler::new(2, None);
        let (detail, instance) = job("logs-1");
        let key = detail.key.clone();
        let slow = Trigger::interval(key.clone(), Duration::from_secs(10), Duration::from_secs(10));
        let slow_key = slow.key.clone();
        scheduler.schedule_job(detail, vec![slow]).await.unwrap();

        let fast = Trigger::interval(key.clone(), Duration::from_secs(1), Duration::ZERO);
        scheduler.reschedule_job(&slow_key, fast.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(ticks(&instance), 3);
        assert_eq!(scheduler.triggers_of_job(&key).await, vec![fast]);

        let missing = scheduler
            .reschedule_job(&slow_key, Trigger::interval(key, Duration::from_secs(1), Duration::ZERO))
            .await;
        assert!(matches!(missing, Err(SchedulerError::TriggerNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_survives_unavailable_trigger_store() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = LocalJobScheduler::new(2, Some(store.clone()));
        let (detail, instance) = job("logs-1");
        let key = detail.key.clone();
        let slow = Trigger::interval(key.clone(), Duration::from_secs(10), Duration::from_secs(10));
        let slow_key = slow.key.clone();
        scheduler.schedule_job(detail, vec![slow]).await.unwrap();

        store.set_unavailable(true);
        let fast = Trigger::interval(key.clone(), Duration::from_secs(1), Duration::ZERO);
        scheduler.reschedule_job(&slow_key, fast.clone()).await.unwrap();
        assert_eq!(scheduler.triggers_of_job(&key).await, vec![fast]);
        store.set_unavailable(false);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(ticks(&instance), 3);
        let state = store.get_trigger(&key).await.unwrap().unwrap();
        assert_eq!(state.period_ms, 1_000);

        store.set_unavailable(true);
        assert!(scheduler.delete_job(&key).await.unwrap());
        assert!(!scheduler.check_exists(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_clear() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = LocalJobScheduler::new(2, Some(store.clone()));
        let (a, a_instance) = job("a");
        let (b, _) = job("b");
        let (a_key, b_key) = (a.key.clone(), b.key.clone());
        for detail in [a, b] {
            let trigger = Trigger::interval(detail.key.clone(), Duration::from_secs(1), Duration::from_secs(1));
            scheduler.schedule_job(detail, vec![trigger]).await.unwrap();
        }
        assert_eq!(scheduler.job_keys(JOB_GROUP).await, vec![a_key.clone(), b_key.clone()]);

        assert!(scheduler.delete_job(&a_key).await.unwrap());
        assert!(!scheduler.delete_job(&a_key).await.unwrap());
        assert!(store.get_trigger(&a_key).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(ticks(&a_instance), 0);

        scheduler.clear().await;
        assert!(!scheduler.check_exists(&b_key).await);
        assert!(store.get_trigger(&b_key).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_persisted_cadence() {
        let store = Arc::new(MemoryStore::new());
        let (detail, instance) = job("logs-1");
        let key = detail.key.clone();
        store
            .put_trigger(&TriggerState {
                job: key.clone(),
                trigger: TriggerKey::unique(&key),
                period_ms: 10_000,
                previous_fire_time: None,
                next_fire_time: Utc::now() + chrono::Duration::seconds(3),
            })
            .await
            .unwrap();

        let scheduler = LocalJobScheduler::new(2, Some(store.clone()));
        let trigger = Trigger::interval(key.clone(), Duration::from_secs(10), Duration::ZERO);
        scheduler.schedule_job(detail, vec![trigger]).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks(&instance), 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(ticks(&instance), 1);
        let state = store.get_trigger(&key).await.unwrap().unwrap();
        assert!(state.previous_fire_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_jobs() {
        let scheduler = LocalJobScheduler::new(2, None);
        scheduler.shutdown().await;
        let (detail, _) = job("logs-1");
        let result = scheduler.schedule_job(detail, vec![]).await;
        assert!(matches!(result, Err(SchedulerError::Shutdown)));
    }
}
