//! Cluster topology source.

use ilm_core::{ClusterChangedEvent, ClusterState};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Provides the current cluster state and change events.
pub trait ClusterService: Send + Sync {
    /// Current state.
    fn state(&self) -> Arc<ClusterState>;

    /// Subscribe to state changes.
    fn subscribe(&self) -> broadcast::Receiver<ClusterChangedEvent>;
}

/// In-process cluster service fed by [`apply`](Self::apply).
pub struct LocalClusterService {
    state: watch::Sender<Arc<ClusterState>>,
    events: broadcast::Sender<ClusterChangedEvent>,
}

impl LocalClusterService {
    /// Create a service with an initial state.
    pub fn new(initial: ClusterState) -> Self {
        let (state, _) = watch::channel(Arc::new(initial));
        let (events, _) = broadcast::channel(256);
        Self { state, events }
    }

    /// Publish a new state. The version is bumped past the previous one.
    pub fn apply(&self, mut next: ClusterState) -> ClusterChangedEvent {
        let previous = self.state();
        next.version = previous.version + 1;
        let current = Arc::new(next);
        self.state.send_replace(current.clone());

        let event = ClusterChangedEvent::new(previous, current);
        tracing::debug!("Cluster state changed to version {}", event.current.version);
        let _ = self.events.send(event.clone());
        event
    }

    /// Publish a modified copy of the current state.
    pub fn update(&self, f: impl FnOnce(&mut ClusterState)) -> ClusterChangedEvent {
        let mut next = (*self.state()).clone();
        f(&mut next);
        self.apply(next)
    }
}

impl ClusterService for LocalClusterService {
    fn state(&self) -> Arc<ClusterState> {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterChangedEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilm_core::{IndexMetadata, NodeId, ResourceId};

    #[tokio::test]
    async fn test_apply_publishes_events() {
        let service = LocalClusterService::new(ClusterState::new(NodeId::new("n1")));
        let mut rx = service.subscribe();

        service.update(|s| {
            s.indices.insert(ResourceId::new("a"), IndexMetadata::managed_by("hot"));
        });

        let event = rx.recv().await.unwrap();
        assert!(event.metadata_changed());
        assert!(!event.nodes_changed());
        assert_eq!(service.state().version, 1);
    }
}
