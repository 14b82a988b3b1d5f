//! Policy model.
//!
//! A policy is an ordered list of steps. Each step is gated by conditions
//! (short-circuit OR, vacuously true when empty) and runs its actions in
//! order. Conditions and actions are supplied by the embedding application.

use crate::ExecutionContext;
use async_trait::async_trait;
use ilm_core::{Failure, InstanceState, ResourceId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// A condition gating the actions of a step.
#[async_trait]
pub trait Condition: Send + Sync {
    /// Condition type name, recorded in the instance state.
    fn type_name(&self) -> &str;

    /// Evaluate the condition for a resource.
    async fn evaluate(
        &self,
        resource: &ResourceId,
        ctx: &ExecutionContext,
        state: &InstanceState,
    ) -> Result<bool, Failure>;
}

/// An action executed when a step's conditions are met.
#[async_trait]
pub trait Action: Send + Sync {
    /// Action type name, recorded in the instance state.
    fn type_name(&self) -> &str;

    /// Execute the action. Auxiliary state fields (e.g. `snapshot_name`) may be updated.
    async fn execute(
        &self,
        resource: &ResourceId,
        ctx: &ExecutionContext,
        state: &mut InstanceState,
    ) -> Result<(), Failure>;
}

/// One stage of a policy.
#[derive(Clone)]
pub struct Step {
    name: String,
    conditions: Vec<Arc<dyn Condition>>,
    actions: Vec<Arc<dyn Action>>,
}

impl Step {
    /// Create a step without conditions or actions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Add a condition.
    pub fn with_condition(mut self, condition: Arc<dyn Condition>) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add an action.
    pub fn with_action(mut self, action: Arc<dyn Action>) -> Self {
        self.actions.push(action);
        self
    }

    /// Step name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Conditions in evaluation order
    pub fn conditions(&self) -> &[Arc<dyn Condition>] {
        &self.conditions
    }

    /// Actions in execution order
    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.actions
    }

    /// Index of the first action of the given type.
    pub fn action_index(&self, action_type: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.type_name() == action_type)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("conditions", &self.conditions.iter().map(|c| c.type_name()).collect::<Vec<_>>())
            .field("actions", &self.actions.iter().map(|a| a.type_name()).collect::<Vec<_>>())
            .finish()
    }
}

/// A named, immutable list of steps.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    steps: Vec<Step>,
}

impl Policy {
    /// Create a policy.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Policy name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Find a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// The first step, if any.
    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }

    /// The step positioned after `name`, if any.
    pub fn next_step(&self, name: &str) -> Option<&Step> {
        let index = self.steps.iter().position(|s| s.name == name)?;
        self.steps.get(index + 1)
    }
}

/// Errors raised by a policy source.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Policy does not exist
    #[error("policy not found: {0}")]
    NotFound(String),

    /// Policy exists but cannot be used
    #[error("invalid policy {name}: {reason}")]
    Invalid {
        /// Policy name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Source could not be reached
    #[error("policy source unavailable: {0}")]
    Unavailable(String),
}

/// Change notification from the policy store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// Policies were created
    Created(Vec<String>),
    /// Policies were replaced
    Updated(Vec<String>),
    /// Policies were removed
    Deleted(Vec<String>),
}

/// Where policies are loaded from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Load a policy by name.
    async fn get_policy(&self, name: &str) -> Result<Option<Arc<Policy>>, PolicyError>;

    /// Subscribe to policy change events.
    fn subscribe(&self) -> broadcast::Receiver<PolicyEvent>;
}

/// Policy source backed by a map, publishing change events on every mutation.
pub struct InMemoryPolicySource {
    policies: RwLock<HashMap<String, Arc<Policy>>>,
    events: broadcast::Sender<PolicyEvent>,
}

impl Default for InMemoryPolicySource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPolicySource {
    /// Create an empty source.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            policies: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create or replace a policy.
    pub async fn put(&self, policy: Policy) {
        let name = policy.name().to_string();
        let replaced = self
            .policies
            .write()
            .await
            .insert(name.clone(), Arc::new(policy))
            .is_some();

        let event = if replaced {
            PolicyEvent::Updated(vec![name])
        } else {
            PolicyEvent::Created(vec![name])
        };
        let _ = self.events.send(event);
    }

    /// Remove a policy. Returns whether it existed.
    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.policies.write().await.remove(name).is_some();
        if removed {
            let _ = self.events.send(PolicyEvent::Deleted(vec![name.to_string()]));
        }
        removed
    }
}

#[async_trait]
impl PolicySource for InMemoryPolicySource {
    async fn get_policy(&self, name: &str) -> Result<Option<Arc<Policy>>, PolicyError> {
        Ok(self.policies.read().await.get(name).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.subscribe()
    }
}
