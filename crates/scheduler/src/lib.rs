//! Scheduling drivers for policy instances.
//!
//! Two strategies drive the [`InstanceHandle`](ilm_execution::InstanceHandle)s:
//!
//! - [`ReactiveDriver`] keeps one timer per managed resource on this node and
//!   reacts directly to cluster metadata changes.
//! - [`DistributedDriver`] hands firing to a [`JobScheduler`] and only creates
//!   the jobs a [`JobDistributor`] assigns to this node.
//!
//! Both implement [`ManualControl`] for operator-triggered runs and retries.

#![warn(missing_docs)]

pub mod cluster;
pub mod membership;
pub mod provision;
pub mod control;
pub mod reactive;
pub mod jobs;
pub mod local;
pub mod distribution;
pub mod distributed;

pub use cluster::{ClusterService, LocalClusterService};
pub use membership::{diff_membership, MembershipDiff};
pub use provision::InstanceProvisioner;
pub use control::ManualControl;
pub use reactive::ReactiveDriver;
pub use jobs::{
    JobScheduler, JobDetail, Trigger, Schedule, JobExecuted, SchedulerError, Result, JOB_GROUP,
    MANUAL_TRIGGER_PREFIX,
};
pub use local::LocalJobScheduler;
pub use distribution::{JobDistributor, HashJobDistributor};
pub use distributed::DistributedDriver;

use rand::Rng;
use std::time::Duration;

/// Initial delay of a new schedule: the fixed delay plus, if enabled, a random
/// offset in `[0, period)` so that resources do not fire in lockstep.
pub fn initial_delay(values: &ilm_core::DynamicValues) -> Duration {
    let mut delay = values.fixed_delay();
    if values.execution_random_delay_enabled {
        let period = values.execution_period().as_millis() as u64;
        delay += Duration::from_millis(rand::thread_rng().gen_range(0..period.max(1)));
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilm_core::DynamicValues;

    #[test]
    fn test_initial_delay_range() {
        let values = DynamicValues {
            execution_period_ms: 1_000,
            execution_fixed_delay_ms: 500,
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = initial_delay(&values);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay < Duration::from_millis(1_500));
        }

        let fixed = DynamicValues {
            execution_random_delay_enabled: false,
            execution_fixed_delay_ms: 250,
            ..Default::default()
        };
        assert_eq!(initial_delay(&fixed), Duration::from_millis(250));
    }
}
