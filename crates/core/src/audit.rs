//! Audit record of a terminal-ish instance state write.

use crate::{InstanceState, ResourceId, Time};
use serde::{Deserialize, Serialize};

/// One entry of the state log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// The managed resource
    pub resource_id: ResourceId,

    /// When the record was written
    pub timestamp: Time,

    /// Snapshot of the state that was written
    pub state: InstanceState,
}

impl AuditRecord {
    /// Record a state written now.
    pub fn new(resource_id: ResourceId, state: InstanceState) -> Self {
        Self {
            resource_id,
            timestamp: chrono::Utc::now(),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_document() {
        let record = AuditRecord::new(ResourceId::new("logs-1"), InstanceState::new("hot"));
        let doc = serde_json::to_value(&record).unwrap();
        assert_eq!(doc["resource_id"], "logs-1");
        assert_eq!(doc["state"]["policy_name"], "hot");
        assert!(doc["timestamp"].is_string());
    }
}
