//! Participant registry: name -> handler lookup shared across the engine.
//!
//! Read-mostly; registration normally happens before the engine starts, but
//! the map is concurrent so participants can be added while running.

use std::sync::Arc;

use dashmap::DashMap;

use crate::participant::Participant;

/// Concurrent participant lookup table.
#[derive(Clone, Default)]
pub struct ParticipantRegistry {
    participants: Arc<DashMap<String, Arc<dyn Participant>>>,
}

impl ParticipantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant under `name`, replacing any previous handler.
    pub fn register(&self, name: impl Into<String>, participant: Arc<dyn Participant>) {
        let name = name.into();
        tracing::debug!(participant = name.as_str(), "participant registered");
        self.participants.insert(name, participant);
    }

    /// Remove a participant.
    pub fn unregister(&self, name: &str) -> bool {
        self.participants.remove(name).is_some()
    }

    /// Resolve a participant by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Participant>> {
        self.participants.get(name).map(|entry| Arc::clone(&entry))
    }

    /// Number of registered participants.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

impl std::fmt::Debug for ParticipantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::ParticipantFuture;
    use branchline_types::fei::Fei;
    use branchline_types::message::CancelFlavour;
    use branchline_types::workitem::Workitem;

    struct Noop;

    impl Participant for Noop {
        fn consume(&self, _workitem: Workitem) -> ParticipantFuture<'_> {
            Box::pin(async { Ok(()) })
        }

        fn cancel<'a>(&'a self, _fei: &'a Fei, _flavour: CancelFlavour) -> ParticipantFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn register_and_resolve() {
        let registry = ParticipantRegistry::new();
        assert!(registry.is_empty());

        registry.register("alice", Arc::new(Noop));
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("alice").is_some());
        assert!(registry.resolve("bob").is_none());
    }

    #[test]
    fn register_replaces_previous() {
        let registry = ParticipantRegistry::new();
        registry.register("alice", Arc::new(Noop));
        registry.register("alice", Arc::new(Noop));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes() {
        let registry = ParticipantRegistry::new();
        registry.register("alice", Arc::new(Noop));
        assert!(registry.unregister("alice"));
        assert!(!registry.unregister("alice"));
        assert!(registry.resolve("alice").is_none());
    }
}
