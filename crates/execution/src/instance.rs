//! The seam between scheduling drivers and instance runners.

use crate::{ExecutionContext, InstanceRunner, Policy, TickOutcome};
use async_trait::async_trait;
use ilm_core::{InstanceState, ResourceId};
use std::sync::Arc;
use tokio::sync::watch;

/// A tick a driver has committed to, counted from before it waits for a worker
/// until the tick returns. Dropping it ends the count.
pub struct PendingTick {
    ticks: Option<Arc<watch::Sender<usize>>>,
}

impl PendingTick {
    /// Count a tick on `ticks`.
    pub fn track(ticks: Arc<watch::Sender<usize>>) -> Self {
        ticks.send_modify(|n| *n += 1);
        Self { ticks: Some(ticks) }
    }

    /// A tick nobody waits for.
    pub fn detached() -> Self {
        Self { ticks: None }
    }
}

impl Drop for PendingTick {
    fn drop(&mut self) {
        if let Some(ticks) = &self.ticks {
            ticks.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

/// What a driver needs from a managed instance.
#[async_trait]
pub trait InstanceHandle: Send + Sync {
    /// The managed resource.
    fn resource(&self) -> &ResourceId;

    /// Name of the policy the instance executes.
    fn policy_name(&self) -> &str;

    /// Run one pass.
    async fn tick(&self) -> TickOutcome;

    /// Mark the instance deleted.
    async fn handle_delete(&self);

    /// Retry a failed instance on the next tick.
    fn request_retry(&self);

    /// Announce a tick before it is handed to a worker.
    fn pending_tick(&self) -> PendingTick {
        PendingTick::detached()
    }

    /// Wait until no announced or running tick of this instance is left.
    async fn quiesce(&self) {}
}

#[async_trait]
impl InstanceHandle for InstanceRunner {
    fn resource(&self) -> &ResourceId {
        InstanceRunner::resource(self)
    }

    fn policy_name(&self) -> &str {
        self.policy().name()
    }

    async fn tick(&self) -> TickOutcome {
        InstanceRunner::tick(self).await
    }

    async fn handle_delete(&self) {
        InstanceRunner::handle_delete(self).await
    }

    fn request_retry(&self) {
        InstanceRunner::request_retry(self)
    }

    fn pending_tick(&self) -> PendingTick {
        InstanceRunner::pending_tick(self)
    }

    async fn quiesce(&self) {
        InstanceRunner::quiesce(self).await
    }
}

/// Builds instance handles for the drivers.
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    /// Build an instance for a resource from its policy and persisted state.
    async fn create(&self, resource: ResourceId, policy: Arc<Policy>, state: InstanceState) -> Arc<dyn InstanceHandle>;
}

/// Factory producing [`InstanceRunner`]s bound to one execution context.
#[derive(Clone)]
pub struct RunnerFactory {
    ctx: ExecutionContext,
}

impl RunnerFactory {
    /// Create a factory.
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl InstanceFactory for RunnerFactory {
    async fn create(&self, resource: ResourceId, policy: Arc<Policy>, state: InstanceState) -> Arc<dyn InstanceHandle> {
        tracing::trace!("Building instance for {} with policy {}", resource, policy.name());
        Arc::new(InstanceRunner::new(resource, policy, state, self.ctx.clone()).await)
    }
}
