//! Job scheduler abstraction used by the distributed driver.
//!
//! A job is one managed resource. It carries one or more triggers: the
//! periodic trigger created with the job and one-shot manual triggers added by
//! [`ManualControl::execute_now`](crate::ManualControl::execute_now).

use async_trait::async_trait;
use ilm_core::{JobKey, TriggerKey};
use ilm_execution::{InstanceHandle, TickOutcome};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Group of all lifecycle jobs.
pub const JOB_GROUP: &str = "ilm";

/// Name prefix of one-shot triggers created on operator request.
pub const MANUAL_TRIGGER_PREFIX: &str = "manual___";

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job with the key is already scheduled
    #[error("Job already exists: {0}")]
    JobExists(JobKey),

    /// No such job
    #[error("Job not found: {0}")]
    JobNotFound(JobKey),

    /// No such trigger
    #[error("Trigger not found: {0}")]
    TriggerNotFound(TriggerKey),

    /// The node filter is not a valid regex
    #[error("Invalid node filter: {0}")]
    InvalidNodeFilter(#[from] regex::Error),

    /// The scheduler no longer accepts jobs
    #[error("Scheduler is shut down")]
    Shutdown,
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// A schedulable job and the instance it runs.
#[derive(Clone)]
pub struct JobDetail {
    /// Job key
    pub key: JobKey,
    /// Instance ticked on every fire
    pub instance: Arc<dyn InstanceHandle>,
}

impl JobDetail {
    /// Job for an instance in [`JOB_GROUP`].
    pub fn new(instance: Arc<dyn InstanceHandle>) -> Self {
        Self {
            key: JobKey::for_resource(instance.resource(), JOB_GROUP),
            instance,
        }
    }

    /// Name of the policy the job's instance executes.
    pub fn policy_name(&self) -> &str {
        self.instance.policy_name()
    }
}

impl std::fmt::Debug for JobDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDetail")
            .field("key", &self.key)
            .field("policy", &self.policy_name())
            .finish()
    }
}

/// When a trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Repeatedly with a fixed period
    Interval(Duration),
    /// Exactly once
    Once,
}

/// A trigger attached to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Trigger key
    pub key: TriggerKey,
    /// Job fired by the trigger
    pub job: JobKey,
    /// Firing schedule
    pub schedule: Schedule,
    /// Delay before the first fire
    pub start_delay: Duration,
}

impl Trigger {
    /// Periodic trigger with a fresh key.
    pub fn interval(job: JobKey, period: Duration, start_delay: Duration) -> Self {
        Self {
            key: TriggerKey::unique(&job),
            job,
            schedule: Schedule::Interval(period),
            start_delay,
        }
    }

    /// One-shot trigger firing immediately.
    pub fn once(job: JobKey) -> Self {
        Self {
            key: TriggerKey::with_prefix(MANUAL_TRIGGER_PREFIX, &job),
            job,
            schedule: Schedule::Once,
            start_delay: Duration::ZERO,
        }
    }

    /// The period of an interval trigger.
    pub fn period(&self) -> Option<Duration> {
        match self.schedule {
            Schedule::Interval(period) => Some(period),
            Schedule::Once => None,
        }
    }
}

/// Notification sent after a job has run.
#[derive(Debug, Clone)]
pub struct JobExecuted {
    /// Job that ran
    pub job: JobKey,
    /// Trigger that fired it
    pub trigger: Trigger,
    /// Outcome of the tick
    pub outcome: TickOutcome,
}

/// Stores jobs and fires them according to their triggers.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Add a job with its triggers. Fails if the key is taken.
    async fn schedule_job(&self, detail: JobDetail, triggers: Vec<Trigger>) -> Result<()>;

    /// Attach a trigger to an existing job.
    async fn schedule_trigger(&self, trigger: Trigger) -> Result<()>;

    /// Replace a trigger.
    async fn reschedule_job(&self, old: &TriggerKey, new: Trigger) -> Result<()>;

    /// Remove a job and all its triggers. False if it did not exist.
    async fn delete_job(&self, key: &JobKey) -> Result<bool>;

    /// Whether the job exists.
    async fn check_exists(&self, key: &JobKey) -> bool;

    /// Detail of a job.
    async fn job_detail(&self, key: &JobKey) -> Option<JobDetail>;

    /// Keys of all jobs in a group.
    async fn job_keys(&self, group: &str) -> Vec<JobKey>;

    /// Triggers attached to a job.
    async fn triggers_of_job(&self, key: &JobKey) -> Vec<Trigger>;

    /// Subscribe to execution notifications.
    fn subscribe_executed(&self) -> broadcast::Receiver<JobExecuted>;

    /// Drop every job without touching their persisted trigger states.
    async fn clear(&self);

    /// Stop firing and reject new jobs.
    async fn shutdown(&self);
}
