//! Instance runner - the per-resource policy state machine.
//!
//! A tick plans its work from the current status (see [`plan_tick`]), then
//! walks the policy from `current_step`, persisting every condition, action
//! and step outcome before it continues. Two locks keep it consistent:
//!
//! - the execution lock makes ticks of one instance exclusive; a tick that
//!   cannot take it returns immediately
//! - the state lock is held across every repository write, so a delete that
//!   lands while a tick is running is ordered after the tick's last write and
//!   every later tick write is discarded
//!
//! A state loaded as RUNNING may belong to a pass that is still alive on
//! another runner. It is only demoted to FAILED once the persisted record has
//! stayed unchanged between two ticks; if it settles first it is adopted.

use crate::plan::{plan_tick, SkipReason, TickPlan};
use crate::{ExecutionContext, PendingTick, Policy, Step};
use chrono::Utc;
use futures::FutureExt;
use ilm_core::{
    ActionState, ConditionState, Failure, InstanceState, InstanceStatus, ResourceId, StepState, UNKNOWN_STEP,
};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, trace, warn};

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do for the current status
    Skipped(SkipReason),
    /// Another tick of the same instance is in flight
    AlreadyRunning,
    /// The pass ended with this status
    Completed(InstanceStatus),
    /// The instance was deleted during the pass; its remaining writes were dropped
    Superseded,
}

/// The instance was deleted under a running pass.
struct Superseded;

type Pass<T> = Result<T, Superseded>;

/// Progress of verifying a state that was loaded as RUNNING.
enum Recovery {
    /// The in-memory state is authoritative
    Settled,
    /// Not looked at yet
    Unverified,
    /// Persisted RUNNING record seen by the previous tick
    Observed(InstanceState),
}

/// Executes one resource's policy.
pub struct InstanceRunner {
    resource: ResourceId,
    policy: Arc<Policy>,
    state: Mutex<InstanceState>,
    execution: Mutex<()>,
    retry_requested: AtomicBool,
    recovery: Mutex<Recovery>,
    pending: Arc<watch::Sender<usize>>,
    ctx: ExecutionContext,
}

impl InstanceRunner {
    /// Create a runner from the persisted state.
    ///
    /// A RUNNING state is verified by the first ticks before anything runs,
    /// see [`tick`](Self::tick).
    pub async fn new(resource: ResourceId, policy: Arc<Policy>, state: InstanceState, ctx: ExecutionContext) -> Self {
        let recovery = if state.status == InstanceStatus::Running {
            debug!("Instance {} was loaded while running step {}", resource, state.current_step);
            Recovery::Unverified
        } else {
            Recovery::Settled
        };

        Self {
            resource,
            policy,
            state: Mutex::new(state),
            execution: Mutex::new(()),
            retry_requested: AtomicBool::new(false),
            recovery: Mutex::new(recovery),
            pending: Arc::new(watch::channel(0).0),
            ctx,
        }
    }

    /// The managed resource
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// The policy being executed
    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Snapshot of the in-memory state.
    pub async fn state(&self) -> InstanceState {
        self.state.lock().await.clone()
    }

    /// Ask the next tick to retry a FAILED instance.
    pub fn request_retry(&self) {
        self.retry_requested.store(true, Ordering::SeqCst);
    }

    /// Whether a retry is pending.
    pub fn retry_requested(&self) -> bool {
        self.retry_requested.load(Ordering::SeqCst)
    }

    /// Announce a tick that a driver is about to run.
    pub fn pending_tick(&self) -> PendingTick {
        PendingTick::track(self.pending.clone())
    }

    /// Wait until no announced or running tick is left.
    pub async fn quiesce(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
        let _idle = self.execution.lock().await;
    }

    /// Mark the instance DELETED and persist it. Safe to call during a tick.
    pub async fn handle_delete(&self) {
        let mut state = self.state.lock().await;
        if state.status == InstanceStatus::Deleted {
            return;
        }
        state.status = InstanceStatus::Deleted;
        self.ctx.repository.put(&self.resource, &state).await;
        info!("Instance {} with policy {} deleted", self.resource, self.policy.name());
    }

    /// Run one pass.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_running) = self.execution.try_lock() else {
            debug!("Instance {} is already executing, skipping tick", self.resource);
            return TickOutcome::AlreadyRunning;
        };

        if let Some(outcome) = self.recover().await {
            return outcome;
        }

        let state = self.state.lock().await.clone();
        let plan = plan_tick(state.status, self.retry_requested());
        trace!(
            "Tick of {} with policy {}: status {}, plan {:?}",
            self.resource,
            self.policy.name(),
            state.status,
            plan
        );

        match plan {
            TickPlan::Skip(reason) => {
                if reason == SkipReason::StillRunning {
                    debug!("Instance {} could not start because it is still running", self.resource);
                }
                return TickOutcome::Skipped(reason);
            }
            TickPlan::Retry => {
                self.retry_requested.store(false, Ordering::SeqCst);
                debug!("Retrying instance {} at step {}", self.resource, state.current_step);
            }
            TickPlan::Start { .. } => {}
        }

        match AssertUnwindSafe(self.run(state, plan)).catch_unwind().await {
            Ok(Ok(status)) => TickOutcome::Completed(status),
            Ok(Err(Superseded)) => {
                debug!("Instance {} was deleted during execution", self.resource);
                TickOutcome::Superseded
            }
            Err(panic) => {
                let failure = Failure::new("Panic", panic_message(panic.as_ref()));
                error!("Unexpected failure while executing instance {}: {}", self.resource, failure.message);
                let state = self.state.lock().await.clone();
                match self.fail_unknown(state, failure).await {
                    Ok(status) => TickOutcome::Completed(status),
                    Err(Superseded) => TickOutcome::Superseded,
                }
            }
        }
    }

    /// Decide what a state loaded as RUNNING really is. Returns an outcome when
    /// the tick must stop here.
    async fn recover(&self) -> Option<TickOutcome> {
        let mut recovery = self.recovery.lock().await;
        if matches!(*recovery, Recovery::Settled) {
            return None;
        }

        let durable = match self.ctx.repository.get(&self.resource).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to reload state of {}: {}", self.resource, e);
                None
            }
        };
        let mut cell = self.state.lock().await;
        if cell.status == InstanceStatus::Deleted {
            *recovery = Recovery::Settled;
            return None;
        }
        let durable = durable
            .filter(|d| d.policy_name() == cell.policy_name())
            .unwrap_or_else(|| cell.clone());

        if durable.status != InstanceStatus::Running {
            debug!("Instance {} settled as {} in another pass, adopting it", self.resource, durable.status);
            *cell = durable;
            *recovery = Recovery::Settled;
            return None;
        }

        let unchanged = matches!(&*recovery, Recovery::Observed(seen) if *seen == durable);
        if !unchanged {
            trace!("Instance {} is running in another pass, waiting for it", self.resource);
            *cell = durable.clone();
            *recovery = Recovery::Observed(durable);
            return Some(TickOutcome::Skipped(SkipReason::StillRunning));
        }

        warn!("Instance {} was interrupted in step {}, marking it failed", self.resource, cell.current_step);
        mark_interrupted(&mut cell);
        self.ctx.repository.put(&self.resource, &cell).await;
        *recovery = Recovery::Settled;
        None
    }

    async fn run(&self, mut state: InstanceState, plan: TickPlan) -> Pass<InstanceStatus> {
        if let TickPlan::Start { seed_first_step: true } = plan {
            match self.policy.first_step() {
                Some(step) => state.current_step = step.name().to_string(),
                None => {
                    let failure = Failure::new("InvalidPolicy", format!("policy '{}' has no steps", self.policy.name()));
                    return self.fail_unknown(state, failure).await;
                }
            }
        }

        state.status = InstanceStatus::Running;
        self.persist(&state).await?;

        if plan == TickPlan::Retry {
            let Some(step) = self.policy.step(&state.current_step) else {
                return self.missing_step(state).await;
            };
            let step_retries = state.last_executed_step.as_ref().map_or(0, |s| s.retry_count) + 1;
            match self.failed_action(step, &state) {
                Some((index, action_retries)) => {
                    self.retry_actions(step, &mut state, step_retries, index, action_retries).await?
                }
                None => self.run_step(step, &mut state, step_retries).await?,
            }
            if state.status != InstanceStatus::Running || self.advance(step, &mut state).await? {
                return Ok(state.status);
            }
        }

        loop {
            let Some(step) = self.policy.step(&state.current_step) else {
                return self.missing_step(state).await;
            };
            self.run_step(step, &mut state, 0).await?;
            if state.status != InstanceStatus::Running || self.advance(step, &mut state).await? {
                return Ok(state.status);
            }
        }
    }

    /// Move past a completed step. Returns true when the policy is finished.
    async fn advance(&self, step: &Step, state: &mut InstanceState) -> Pass<bool> {
        match self.policy.next_step(step.name()) {
            Some(next) => {
                state.current_step = next.name().to_string();
                self.persist(state).await?;
                Ok(false)
            }
            None => {
                state.status = InstanceStatus::Finished;
                self.persist(state).await?;
                info!("Instance {} finished policy {}", self.resource, self.policy.name());
                Ok(true)
            }
        }
    }

    async fn run_step(&self, step: &Step, state: &mut InstanceState, retry_count: u32) -> Pass<()> {
        let start = Utc::now();
        let mut satisfied = step.conditions().is_empty();

        for condition in step.conditions() {
            let started = Utc::now();
            match condition.evaluate(&self.resource, &self.ctx, state).await {
                Ok(result) => {
                    state.last_executed_condition =
                        Some(ConditionState::new(condition.type_name(), started, Some(result), None));
                    self.persist(state).await?;
                    if result {
                        satisfied = true;
                        break;
                    }
                }
                Err(failure) => {
                    debug!("Condition {} failed for {}: {}", condition.type_name(), self.resource, failure);
                    let step_failure = Failure::new(
                        "ExecutionError",
                        format!("condition '{}' failed: {}", condition.type_name(), failure.message),
                    );
                    state.last_executed_condition =
                        Some(ConditionState::new(condition.type_name(), started, None, Some(failure)));
                    self.persist(state).await?;
                    return self.finish_step(step, state, start, retry_count, Some(step_failure)).await;
                }
            }
        }

        if !satisfied {
            trace!("Conditions of step {} not met for {}", step.name(), self.resource);
            state.status = InstanceStatus::Waiting;
            return self.finish_step(step, state, start, retry_count, None).await;
        }

        let failure = self.run_actions(step, state, 0, 0).await?;
        self.finish_step(step, state, start, retry_count, failure).await
    }

    async fn retry_actions(
        &self,
        step: &Step,
        state: &mut InstanceState,
        retry_count: u32,
        from: usize,
        action_retries: u32,
    ) -> Pass<()> {
        let start = Utc::now();
        let failure = self.run_actions(step, state, from, action_retries).await?;
        self.finish_step(step, state, start, retry_count, failure).await
    }

    /// Run the actions of a step from `from`, stopping at the first failure.
    async fn run_actions(
        &self,
        step: &Step,
        state: &mut InstanceState,
        from: usize,
        retries: u32,
    ) -> Pass<Option<Failure>> {
        for action in step.actions().iter().skip(from) {
            let started = Utc::now();
            let error = action.execute(&self.resource, &self.ctx, state).await.err();
            state.last_executed_action = Some(ActionState::new(action.type_name(), started, retries, error.clone()));
            self.persist(state).await?;

            if let Some(failure) = error {
                debug!("Action {} failed for {}: {}", action.type_name(), self.resource, failure);
                return Ok(Some(Failure::new(
                    "ExecutionError",
                    format!("action '{}' failed: {}", action.type_name(), failure.message),
                )));
            }
        }
        Ok(None)
    }

    async fn finish_step(
        &self,
        step: &Step,
        state: &mut InstanceState,
        start: ilm_core::Time,
        retry_count: u32,
        failure: Option<Failure>,
    ) -> Pass<()> {
        if failure.is_some() {
            state.status = InstanceStatus::Failed;
            warn!("Step {} of policy {} failed for {}", step.name(), self.policy.name(), self.resource);
        }
        state.last_executed_step = Some(StepState::new(step.name(), start, retry_count, failure));
        self.persist(state).await
    }

    /// Index and retry count to resume at, if the last failure was an action of this step.
    fn failed_action(&self, step: &Step, state: &InstanceState) -> Option<(usize, u32)> {
        let action = state.last_executed_action.as_ref().filter(|a| a.has_error())?;
        match step.action_index(&action.action_type) {
            Some(index) => Some((index, action.retries + 1)),
            None => {
                warn!(
                    "Failed action {} is no longer part of step {} for {}, retrying the whole step",
                    action.action_type,
                    step.name(),
                    self.resource
                );
                None
            }
        }
    }

    async fn missing_step(&self, state: InstanceState) -> Pass<InstanceStatus> {
        warn!("Could not find step {} of policy {} for {}", state.current_step, self.policy.name(), self.resource);
        let failure = Failure::new("InvalidPolicy", format!("step '{}' does not exist", state.current_step));
        self.fail_unknown(state, failure).await
    }

    async fn fail_unknown(&self, mut state: InstanceState, failure: Failure) -> Pass<InstanceStatus> {
        state.status = InstanceStatus::Failed;
        state.last_executed_step = Some(StepState::new(UNKNOWN_STEP, Utc::now(), 0, Some(failure)));
        self.persist(&state).await?;
        Ok(InstanceStatus::Failed)
    }

    /// Publish the working copy and write it, unless the instance was deleted meanwhile.
    async fn persist(&self, state: &InstanceState) -> Pass<()> {
        let mut current = self.state.lock().await;
        if current.status == InstanceStatus::Deleted {
            return Err(Superseded);
        }
        *current = state.clone();
        self.ctx.repository.put(&self.resource, state).await;
        Ok(())
    }
}

fn mark_interrupted(state: &mut InstanceState) {
    let retries = state
        .last_executed_step
        .as_ref()
        .filter(|s| s.name == state.current_step)
        .map_or(0, |s| s.retry_count);
    state.last_executed_step = Some(StepState::new(
        state.current_step.clone(),
        Utc::now(),
        retries,
        Some(Failure::new("Interrupted", "execution stopped before the step completed")),
    ));
    state.status = InstanceStatus::Failed;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{memory_context, FailingCondition, FixedCondition, GatedAction, ScriptedAction};
    use ilm_storage::StateStore;

    fn resource() -> ResourceId {
        ResourceId::new("logs-000001")
    }

    async fn runner(policy: Policy) -> (Arc<InstanceRunner>, Arc<ilm_storage::MemoryStore>) {
        let (ctx, store) = memory_context();
        let state = InstanceState::new(policy.name());
        let runner = InstanceRunner::new(resource(), Arc::new(policy), state, ctx).await;
        (Arc::new(runner), store)
    }

    async fn stored(store: &ilm_storage::MemoryStore) -> InstanceState {
        store.get_state(&resource()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_unmet_condition_waits() {
        let condition = FixedCondition::new("max_age", false);
        let policy = Policy::new("p", vec![Step::new("rollover").with_condition(condition.clone())]);
        let (runner, store) = runner(policy).await;

        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Waiting));
        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Waiting));
        assert_eq!(condition.evaluations(), 2);

        let state = stored(&store).await;
        assert_eq!(state.status, InstanceStatus::Waiting);
        assert_eq!(state.current_step, "rollover");
        let step = state.last_executed_step.unwrap();
        assert_eq!(step.name, "rollover");
        assert!(step.error.is_none());
        assert_eq!(state.last_executed_condition.unwrap().result, Some(false));
    }

    #[tokio::test]
    async fn test_waiting_resumes_same_step_when_met() {
        let condition = FixedCondition::new("max_age", false);
        let action = ScriptedAction::succeeding("rollover");
        let policy = Policy::new(
            "p",
            vec![
                Step::new("hot").with_condition(condition.clone()).with_action(action.clone()),
                Step::new("warm"),
            ],
        );
        let (runner, store) = runner(policy).await;

        runner.tick().await;
        assert_eq!(action.calls(), 0);

        condition.set(true);
        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Finished));
        assert_eq!(action.calls(), 1);
        let state = stored(&store).await;
        assert_eq!(state.current_step, "warm");
        assert_eq!(state.last_executed_step.unwrap().name, "warm");
    }

    #[tokio::test]
    async fn test_conditions_short_circuit() {
        let first = FixedCondition::new("a", true);
        let second = FixedCondition::new("b", true);
        let policy = Policy::new(
            "p",
            vec![Step::new("s").with_condition(first.clone()).with_condition(second.clone())],
        );
        let (runner, _) = runner(policy).await;

        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Finished));
        assert_eq!(first.evaluations(), 1);
        assert_eq!(second.evaluations(), 0);
    }

    #[tokio::test]
    async fn test_action_failure_then_retry_resumes_at_action() {
        let first = ScriptedAction::succeeding("set_priority");
        let flaky = ScriptedAction::failing_times("rollover", 1);
        let last = ScriptedAction::succeeding("set_replicas");
        let policy = Policy::new(
            "p",
            vec![Step::new("s")
                .with_action(first.clone())
                .with_action(flaky.clone())
                .with_action(last.clone())],
        );
        let (runner, store) = runner(policy).await;

        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Failed));
        let state = stored(&store).await;
        let action = state.last_executed_action.clone().unwrap();
        assert_eq!(action.action_type, "rollover");
        assert_eq!(action.retries, 0);
        assert!(action.error.is_some());
        let step = state.last_executed_step.unwrap();
        assert_eq!(step.retry_count, 0);
        assert!(step.error.is_some());

        // No retry requested: stays failed
        assert_eq!(runner.tick().await, TickOutcome::Skipped(SkipReason::AwaitingRetry));

        runner.request_retry();
        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Finished));
        assert!(!runner.retry_requested());
        assert_eq!(first.calls(), 1);
        assert_eq!(flaky.calls(), 2);
        assert_eq!(last.calls(), 1);

        let state = stored(&store).await;
        let action = state.last_executed_action.unwrap();
        assert_eq!(action.action_type, "set_replicas");
        assert_eq!(action.retries, 1);
        assert_eq!(state.last_executed_step.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_single_action_fails_once() {
        let action = ScriptedAction::failing_times("delete", 1);
        let policy = Policy::new("p", vec![Step::new("s").with_action(action.clone())]);
        let (runner, store) = runner(policy).await;

        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Failed));
        assert_eq!(stored(&store).await.last_executed_action.unwrap().retries, 0);

        runner.request_retry();
        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Finished));
        assert_eq!(stored(&store).await.last_executed_action.unwrap().retries, 1);
    }

    #[tokio::test]
    async fn test_failure_in_second_step() {
        let policy = Policy::new(
            "p",
            vec![
                Step::new("step1").with_action(ScriptedAction::succeeding("a")),
                Step::new("step2").with_action(ScriptedAction::failing("b")),
            ],
        );
        let (runner, store) = runner(policy).await;

        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Failed));
        let state = stored(&store).await;
        assert_eq!(state.current_step, "step2");
        assert_eq!(state.last_executed_step.unwrap().name, "step2");
    }

    #[tokio::test]
    async fn test_condition_failure_retries_whole_step() {
        let policy = Policy::new("p", vec![Step::new("s").with_condition(FailingCondition::new("doc_count"))]);
        let (runner, store) = runner(policy).await;

        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Failed));
        let state = stored(&store).await;
        let condition = state.last_executed_condition.unwrap();
        assert!(condition.result.is_none());
        assert!(condition.error.is_some());

        runner.request_retry();
        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Failed));
        assert_eq!(stored(&store).await.last_executed_step.unwrap().retry_count, 1);

        runner.request_retry();
        runner.tick().await;
        assert_eq!(stored(&store).await.last_executed_step.unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_removed_failed_action_reruns_step() {
        let (ctx, store) = memory_context();
        let mut state = InstanceState::new("p");
        state.status = InstanceStatus::Failed;
        state.current_step = "s".to_string();
        state.last_executed_step = Some(StepState::new("s", Utc::now(), 0, Some(Failure::new("E", "x"))));
        state.last_executed_action = Some(ActionState::new("gone", Utc::now(), 3, Some(Failure::new("E", "x"))));

        let action = ScriptedAction::succeeding("kept");
        let policy = Arc::new(Policy::new("p", vec![Step::new("s").with_action(action.clone())]));
        let runner = InstanceRunner::new(resource(), policy, state, ctx).await;

        runner.request_retry();
        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Finished));
        let state = stored(&store).await;
        assert_eq!(state.last_executed_action.unwrap().retries, 0);
        assert_eq!(state.last_executed_step.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_terminal_states_are_not_touched() {
        let action = ScriptedAction::succeeding("a");
        let policy = Policy::new("p", vec![Step::new("s").with_action(action.clone())]);
        let (runner, store) = runner(policy).await;

        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Finished));
        let before = stored(&store).await;
        assert_eq!(
            runner.tick().await,
            TickOutcome::Skipped(SkipReason::Terminal(InstanceStatus::Finished))
        );
        assert_eq!(stored(&store).await, before);
        assert_eq!(action.calls(), 1);

        runner.handle_delete().await;
        runner.request_retry();
        assert_eq!(
            runner.tick().await,
            TickOutcome::Skipped(SkipReason::Terminal(InstanceStatus::Deleted))
        );
        assert_eq!(stored(&store).await.status, InstanceStatus::Deleted);
    }

    #[tokio::test]
    async fn test_missing_step_fails_as_unknown() {
        let (ctx, store) = memory_context();
        let mut state = InstanceState::new("p");
        state.status = InstanceStatus::Waiting;
        state.current_step = "renamed".to_string();
        let policy = Arc::new(Policy::new("p", vec![Step::new("s")]));
        let runner = InstanceRunner::new(resource(), policy, state, ctx).await;

        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Failed));
        let step = stored(&store).await.last_executed_step.unwrap();
        assert_eq!(step.name, UNKNOWN_STEP);
        assert!(step.error.is_some());
    }

    #[tokio::test]
    async fn test_empty_policy_fails() {
        let (runner, store) = runner(Policy::new("p", vec![])).await;
        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Failed));
        assert_eq!(stored(&store).await.last_executed_step.unwrap().name, UNKNOWN_STEP);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let policy = Policy::new("p", vec![Step::new("s").with_action(ScriptedAction::panicking("boom"))]);
        let (runner, store) = runner(policy).await;

        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Failed));
        let state = stored(&store).await;
        assert_eq!(state.status, InstanceStatus::Failed);
        let step = state.last_executed_step.unwrap();
        assert_eq!(step.name, UNKNOWN_STEP);
        assert_eq!(step.error.unwrap().kind, "Panic");
    }

    #[tokio::test]
    async fn test_actions_update_auxiliary_fields() {
        let policy = Policy::new("p", vec![Step::new("s").with_action(ScriptedAction::snapshot("snapshot", "snap-1"))]);
        let (runner, store) = runner(policy).await;
        runner.tick().await;
        assert_eq!(stored(&store).await.snapshot_name.as_deref(), Some("snap-1"));
    }

    #[tokio::test]
    async fn test_audit_log_gets_only_settled_states() {
        let condition = FixedCondition::new("c", false);
        let policy = Policy::new("p", vec![Step::new("s").with_condition(condition.clone())]);
        let (runner, store) = runner(policy).await;

        runner.tick().await;
        assert_eq!(store.audit_len().await, 0);

        condition.set(true);
        runner.tick().await;
        assert_eq!(store.audit_len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_ticks_are_exclusive() {
        let gate = GatedAction::new("slow");
        let policy = Policy::new("p", vec![Step::new("s").with_action(gate.clone())]);
        let (runner, store) = runner(policy).await;

        let first = tokio::spawn({
            let runner = runner.clone();
            async move { runner.tick().await }
        });
        gate.entered().await;

        let before = stored(&store).await;
        assert_eq!(runner.tick().await, TickOutcome::AlreadyRunning);
        assert_eq!(stored(&store).await, before);

        gate.release();
        assert_eq!(first.await.unwrap(), TickOutcome::Completed(InstanceStatus::Finished));
    }

    #[tokio::test]
    async fn test_delete_during_tick_wins() {
        let gate = GatedAction::new("slow");
        let after = ScriptedAction::succeeding("after");
        let policy = Policy::new("p", vec![Step::new("s").with_action(gate.clone()).with_action(after.clone())]);
        let (runner, store) = runner(policy).await;

        let tick = tokio::spawn({
            let runner = runner.clone();
            async move { runner.tick().await }
        });
        gate.entered().await;

        runner.handle_delete().await;
        gate.release();

        assert_eq!(tick.await.unwrap(), TickOutcome::Superseded);
        assert_eq!(after.calls(), 0);
        assert_eq!(stored(&store).await.status, InstanceStatus::Deleted);
        assert_eq!(runner.state().await.status, InstanceStatus::Deleted);
    }

    #[tokio::test]
    async fn test_stale_running_state_fails_after_no_progress() {
        let (ctx, store) = memory_context();
        let mut state = InstanceState::new("p");
        state.status = InstanceStatus::Running;
        state.current_step = "s".to_string();
        store.put_state(&resource(), &state).await.unwrap();

        let action = ScriptedAction::succeeding("a");
        let policy = Arc::new(Policy::new("p", vec![Step::new("s").with_action(action.clone())]));
        let runner = InstanceRunner::new(resource(), policy, state, ctx).await;
        assert_eq!(stored(&store).await.status, InstanceStatus::Running);

        assert_eq!(runner.tick().await, TickOutcome::Skipped(SkipReason::StillRunning));
        assert_eq!(stored(&store).await.status, InstanceStatus::Running);

        assert_eq!(runner.tick().await, TickOutcome::Skipped(SkipReason::AwaitingRetry));
        let persisted = stored(&store).await;
        assert_eq!(persisted.status, InstanceStatus::Failed);
        assert_eq!(persisted.last_executed_step.unwrap().error.unwrap().kind, "Interrupted");

        runner.request_retry();
        assert_eq!(runner.tick().await, TickOutcome::Completed(InstanceStatus::Finished));
        assert_eq!(action.calls(), 1);
    }

    #[tokio::test]
    async fn test_running_state_of_live_pass_is_adopted() {
        let (ctx, store) = memory_context();
        let gate = GatedAction::new("slow");
        let later = FixedCondition::new("later", false);
        let policy = Arc::new(Policy::new(
            "p",
            vec![
                Step::new("s").with_action(gate.clone()),
                Step::new("t").with_condition(later.clone()),
            ],
        ));
        let first = Arc::new(InstanceRunner::new(resource(), policy.clone(), InstanceState::new("p"), ctx.clone()).await);
        let tick = tokio::spawn({
            let first = first.clone();
            async move { first.tick().await }
        });
        gate.entered().await;

        let loaded = stored(&store).await;
        assert_eq!(loaded.status, InstanceStatus::Running);
        let second = InstanceRunner::new(resource(), policy, loaded, ctx).await;
        assert_eq!(second.tick().await, TickOutcome::Skipped(SkipReason::StillRunning));
        assert_eq!(stored(&store).await.status, InstanceStatus::Running);

        gate.release();
        assert_eq!(tick.await.unwrap(), TickOutcome::Completed(InstanceStatus::Waiting));

        assert_eq!(second.tick().await, TickOutcome::Completed(InstanceStatus::Waiting));
        assert_eq!(later.evaluations(), 2);
        assert_eq!(stored(&store).await.current_step, "t");
    }

    #[tokio::test]
    async fn test_quiesce_waits_for_announced_ticks() {
        let policy = Policy::new("p", vec![Step::new("s").with_action(ScriptedAction::succeeding("a"))]);
        let (runner, _) = runner(policy).await;

        let pending = runner.pending_tick();
        let quiesced = tokio::spawn({
            let runner = runner.clone();
            async move { runner.quiesce().await }
        });
        tokio::task::yield_now().await;
        assert!(!quiesced.is_finished());

        drop(pending);
        quiesced.await.unwrap();
    }
}
