//! Scripted conditions and actions for tests.

use crate::{Action, Condition, ExecutionContext};
use async_trait::async_trait;
use ilm_core::{Failure, InstanceState, NodeId, ResourceId, Settings};
use ilm_storage::{AuditLog, MemoryStore, StateRepository};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Context over a fresh in-memory store with default settings.
pub fn memory_context() -> (ExecutionContext, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let settings = Settings::default();
    let audit = Arc::new(AuditLog::new(store.clone(), settings.clone()));
    let repository = StateRepository::new(store.clone(), audit);
    (ExecutionContext::new(settings, repository, NodeId::new("node-1")), store)
}

/// Condition with a switchable result.
pub struct FixedCondition {
    condition_type: String,
    result: AtomicBool,
    evaluations: AtomicU32,
}

impl FixedCondition {
    /// Condition always evaluating to `result` until switched.
    pub fn new(condition_type: &str, result: bool) -> Arc<Self> {
        Arc::new(Self {
            condition_type: condition_type.to_string(),
            result: AtomicBool::new(result),
            evaluations: AtomicU32::new(0),
        })
    }

    /// Switch the result.
    pub fn set(&self, result: bool) {
        self.result.store(result, Ordering::SeqCst);
    }

    /// Number of evaluations so far.
    pub fn evaluations(&self) -> u32 {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Condition for FixedCondition {
    fn type_name(&self) -> &str {
        &self.condition_type
    }

    async fn evaluate(&self, _: &ResourceId, _: &ExecutionContext, _: &InstanceState) -> Result<bool, Failure> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.load(Ordering::SeqCst))
    }
}

/// Condition that always fails.
pub struct FailingCondition {
    condition_type: String,
}

impl FailingCondition {
    /// Create a failing condition.
    pub fn new(condition_type: &str) -> Arc<Self> {
        Arc::new(Self {
            condition_type: condition_type.to_string(),
        })
    }
}

#[async_trait]
impl Condition for FailingCondition {
    fn type_name(&self) -> &str {
        &self.condition_type
    }

    async fn evaluate(&self, resource: &ResourceId, _: &ExecutionContext, _: &InstanceState) -> Result<bool, Failure> {
        Err(Failure::new("ConditionError", format!("cannot evaluate {} for {}", self.condition_type, resource)))
    }
}

enum Behavior {
    Succeed,
    FailTimes(AtomicU32),
    Panic,
    Snapshot(String),
}

/// Action with a scripted outcome that counts its executions.
pub struct ScriptedAction {
    action_type: String,
    behavior: Behavior,
    calls: AtomicU32,
}

impl ScriptedAction {
    fn with(action_type: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            action_type: action_type.to_string(),
            behavior,
            calls: AtomicU32::new(0),
        })
    }

    /// Always succeeds.
    pub fn succeeding(action_type: &str) -> Arc<Self> {
        Self::with(action_type, Behavior::Succeed)
    }

    /// Fails the first `times` executions, then succeeds.
    pub fn failing_times(action_type: &str, times: u32) -> Arc<Self> {
        Self::with(action_type, Behavior::FailTimes(AtomicU32::new(times)))
    }

    /// Always fails.
    pub fn failing(action_type: &str) -> Arc<Self> {
        Self::failing_times(action_type, u32::MAX)
    }

    /// Panics.
    pub fn panicking(action_type: &str) -> Arc<Self> {
        Self::with(action_type, Behavior::Panic)
    }

    /// Records a snapshot name in the state.
    pub fn snapshot(action_type: &str, snapshot_name: &str) -> Arc<Self> {
        Self::with(action_type, Behavior::Snapshot(snapshot_name.to_string()))
    }

    /// Number of executions so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for ScriptedAction {
    fn type_name(&self) -> &str {
        &self.action_type
    }

    async fn execute(&self, resource: &ResourceId, _: &ExecutionContext, state: &mut InstanceState) -> Result<(), Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::FailTimes(remaining) => {
                let failing = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    Err(Failure::new("ActionError", format!("{} failed for {}", self.action_type, resource)))
                } else {
                    Ok(())
                }
            }
            Behavior::Panic => panic!("{} exploded", self.action_type),
            Behavior::Snapshot(name) => {
                state.snapshot_name = Some(name.clone());
                Ok(())
            }
        }
    }
}

/// Action that blocks until released, signalling when it has been entered.
pub struct GatedAction {
    action_type: String,
    entered: Notify,
    release: Notify,
}

impl GatedAction {
    /// Create a gated action.
    pub fn new(action_type: &str) -> Arc<Self> {
        Arc::new(Self {
            action_type: action_type.to_string(),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Wait until an execution is blocked in the action.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let one blocked execution finish.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl Action for GatedAction {
    fn type_name(&self) -> &str {
        &self.action_type
    }

    async fn execute(&self, _: &ResourceId, _: &ExecutionContext, _: &mut InstanceState) -> Result<(), Failure> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}
