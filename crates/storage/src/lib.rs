//! Persistence for the lifecycle engine.
//!
//! Storage backends implement the [`StateStore`], [`AuditSink`] and
//! [`TriggerStateStore`] ports. The engine talks to them only through the
//! [`StateRepository`] and [`AuditLog`] gateways, which log and swallow
//! failures instead of propagating them into a tick.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
pub mod json_storage;
pub mod audit;
pub mod repository;

pub use trait_::{StateStore, AuditSink, TriggerStateStore, TriggerState, StorageError, Result};
pub use memory::MemoryStore;
pub use json_storage::JsonStore;
pub use audit::AuditLog;
pub use repository::{StateRepository, WriteOutcome};

use ilm_core::StorageConfig;
use std::sync::Arc;

/// Backend handles opened from a [`StorageConfig`].
#[derive(Clone)]
pub struct Backend {
    /// Instance state documents
    pub states: Arc<dyn StateStore>,
    /// State log
    pub audit: Arc<dyn AuditSink>,
    /// Trigger states
    pub triggers: Arc<dyn TriggerStateStore>,
}

impl Backend {
    /// Open the configured backend.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        match config {
            StorageConfig::Memory => {
                let store = Arc::new(MemoryStore::new());
                Ok(Self {
                    states: store.clone(),
                    audit: store.clone(),
                    triggers: store,
                })
            }
            StorageConfig::Json { path } => {
                let store = Arc::new(JsonStore::new(path).await?);
                Ok(Self {
                    states: store.clone(),
                    audit: store.clone(),
                    triggers: store,
                })
            }
        }
    }
}
