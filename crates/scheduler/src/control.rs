//! Operator control over managed instances.

use async_trait::async_trait;
use ilm_core::ResourceId;

/// Manual execution and retry of policy instances.
#[async_trait]
pub trait ManualControl: Send + Sync {
    /// Run the instance of a resource now. False if it is not managed here or has no active state.
    async fn execute_now(&self, resource: &ResourceId) -> bool;

    /// Retry a failed instance on its next tick. False if it is not managed here or has no active state.
    async fn request_retry(&self, resource: &ResourceId) -> bool;

    /// Whether any instance on this node executes the policy.
    async fn instance_exists_for_policy(&self, policy_name: &str) -> bool;
}
