//! State log gateway.
//!
//! Forwards settled instance states (neither WAITING nor RUNNING) to the
//! configured [`AuditSink`]. The sink is provisioned lazily on first use and
//! provisioning is retried on the next record after a failure. Nothing here
//! ever fails the caller.

use super::{AuditSink, Result};
use ilm_core::{AuditRecord, InstanceState, ResourceId, Settings};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Gateway to the state log.
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    settings: Settings,
    provisioned: Mutex<bool>,
}

impl AuditLog {
    /// Create a gateway over a sink.
    pub fn new(sink: Arc<dyn AuditSink>, settings: Settings) -> Self {
        Self {
            sink,
            settings,
            provisioned: Mutex::new(false),
        }
    }

    /// Whether records are currently forwarded.
    pub fn is_active(&self) -> bool {
        self.settings.engine.state_log.enabled && self.settings.dynamic.current().state_log_active
    }

    /// Offer a written state. Returns whether a record was appended.
    pub async fn offer(&self, id: &ResourceId, state: &InstanceState) -> bool {
        if state.status.is_transient() || !self.is_active() {
            return false;
        }

        if !self.ensure_provisioned().await {
            return false;
        }

        let layout = &self.settings.engine.state_log;
        let record = AuditRecord::new(id.clone(), state.clone());
        match self.sink.append(&layout.write_alias(), &record).await {
            Ok(()) => {
                tracing::trace!("State log record written for {}: {}", id, state.status);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to write state log record for {}: {}", id, e);
                false
            }
        }
    }

    /// Most recent records, oldest first.
    pub async fn tail(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        self.sink.tail(&self.settings.engine.state_log.alias_name, limit).await
    }

    async fn ensure_provisioned(&self) -> bool {
        let mut provisioned = self.provisioned.lock().await;
        if *provisioned {
            return true;
        }

        let layout = &self.settings.engine.state_log;
        match self.sink.provision(layout).await {
            Ok(()) => {
                tracing::info!(
                    "State log provisioned: template {}, write alias {}",
                    layout.index_template_name,
                    layout.write_alias()
                );
                *provisioned = true;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to provision state log, will retry: {}", e);
                false
            }
        }
    }
}
