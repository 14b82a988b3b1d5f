//! Execution layer - policies and the per-resource instance runner.

#![warn(missing_docs)]

pub mod policy;
pub mod context;
pub mod plan;
pub mod runner;
pub mod instance;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use policy::{Policy, Step, Condition, Action, PolicySource, InMemoryPolicySource, PolicyEvent, PolicyError};
pub use context::ExecutionContext;
pub use plan::{plan_tick, TickPlan, SkipReason};
pub use runner::{InstanceRunner, TickOutcome};
pub use instance::{InstanceHandle, InstanceFactory, RunnerFactory, PendingTick};
