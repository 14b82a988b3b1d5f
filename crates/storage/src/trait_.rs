//! Storage ports.

use async_trait::async_trait;
use ilm_core::{AuditRecord, InstanceState, JobKey, ResourceId, StateLogSettings, Time, TriggerKey};
use serde::{Deserialize, Serialize};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored document is not a valid instance state
    #[error("Invalid state: {0}")]
    InvalidState(#[from] ilm_core::StateValidationError),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key cannot be stored by this backend
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Persisted cadence of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerState {
    /// Job the trigger belongs to
    pub job: JobKey,
    /// Trigger key
    pub trigger: TriggerKey,
    /// Period of the trigger
    pub period_ms: u64,
    /// Last time the trigger fired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_fire_time: Option<Time>,
    /// Next planned fire time
    pub next_fire_time: Time,
}

/// Instance state documents keyed by resource id.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load one state.
    async fn get_state(&self, id: &ResourceId) -> Result<Option<InstanceState>>;

    /// Create or replace one state.
    async fn put_state(&self, id: &ResourceId, state: &InstanceState) -> Result<()>;

    /// Delete one state. Deleting a missing state is not an error.
    async fn delete_state(&self, id: &ResourceId) -> Result<()>;

    /// List every stored state.
    async fn list_states(&self) -> Result<Vec<(ResourceId, InstanceState)>>;

    /// Delete and create states in one request, returning per-item failures.
    async fn bulk(
        &self,
        delete: &[ResourceId],
        create: &[(ResourceId, InstanceState)],
    ) -> Vec<(ResourceId, StorageError)> {
        let mut failures = Vec::new();
        for id in delete {
            if let Err(e) = self.delete_state(id).await {
                failures.push((id.clone(), e));
            }
        }
        for (id, state) in create {
            if let Err(e) = self.put_state(id, state).await {
                failures.push((id.clone(), e));
            }
        }
        failures
    }
}

/// Append-only state log with an alias layout.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Create the template, the first index and both aliases if missing.
    async fn provision(&self, layout: &StateLogSettings) -> Result<()>;

    /// Append a record through the write alias.
    async fn append(&self, write_alias: &str, record: &AuditRecord) -> Result<()>;

    /// Most recent records readable through an alias, oldest first.
    async fn tail(&self, alias: &str, limit: usize) -> Result<Vec<AuditRecord>>;
}

/// Trigger states keyed by job.
#[async_trait]
pub trait TriggerStateStore: Send + Sync {
    /// Load the trigger state of a job.
    async fn get_trigger(&self, job: &JobKey) -> Result<Option<TriggerState>>;

    /// Create or replace the trigger state of a job.
    async fn put_trigger(&self, state: &TriggerState) -> Result<()>;

    /// Delete the trigger state of a job.
    async fn delete_trigger(&self, job: &JobKey) -> Result<()>;

    /// List every trigger state.
    async fn list_triggers(&self) -> Result<Vec<TriggerState>>;
}
