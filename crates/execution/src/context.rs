//! Execution context handed to runners, conditions and actions.

use ilm_core::{NodeId, Settings};
use ilm_storage::StateRepository;

/// Services available while executing a policy instance.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Node settings
    pub settings: Settings,
    /// State persistence
    pub repository: StateRepository,
    /// Node executing the instance
    pub node: NodeId,
}

impl ExecutionContext {
    /// Create a context.
    pub fn new(settings: Settings, repository: StateRepository, node: NodeId) -> Self {
        Self {
            settings,
            repository,
            node,
        }
    }
}
