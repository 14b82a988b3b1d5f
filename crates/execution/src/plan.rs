//! Tick planning: what a tick does given the persisted status.

use ilm_core::InstanceStatus;

/// Why a tick does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// FINISHED or DELETED
    Terminal(InstanceStatus),
    /// FAILED and no retry was requested
    AwaitingRetry,
    /// A previous pass is still marked RUNNING
    StillRunning,
}

/// What a tick does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPlan {
    /// Do nothing
    Skip(SkipReason),
    /// Run the normal loop from `current_step`
    Start {
        /// Seed `current_step` with the first step first
        seed_first_step: bool,
    },
    /// Run the retry path
    Retry,
}

/// Decide what a tick does.
pub fn plan_tick(status: InstanceStatus, retry_requested: bool) -> TickPlan {
    match status {
        InstanceStatus::Finished | InstanceStatus::Deleted => TickPlan::Skip(SkipReason::Terminal(status)),
        InstanceStatus::NotStarted => TickPlan::Start { seed_first_step: true },
        InstanceStatus::Waiting => TickPlan::Start { seed_first_step: false },
        InstanceStatus::Failed if retry_requested => TickPlan::Retry,
        InstanceStatus::Failed => TickPlan::Skip(SkipReason::AwaitingRetry),
        InstanceStatus::Running => TickPlan::Skip(SkipReason::StillRunning),
    }
}
