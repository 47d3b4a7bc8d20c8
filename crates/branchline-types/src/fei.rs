//! Flow expression identity.
//!
//! A `Fei` uniquely addresses one live, applied instance of an expression
//! node for the life of a process instance. The `child_index` records the
//! position among the parent's children at apply time; it is the addressing
//! key the parent cursor uses to resume after a child reply.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique address of one live expression instance within a process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fei {
    /// The process instance this expression belongs to.
    pub process_id: Uuid,
    /// UUIDv7 assigned when the instance is applied. A retried attempt gets
    /// a fresh expression_id; replies addressed to the old one are stale.
    pub expression_id: Uuid,
    /// Position among the parent's children at apply time.
    pub child_index: usize,
}

impl Fei {
    /// Create the root identity for a new process instance.
    pub fn root(process_id: Uuid) -> Self {
        Self {
            process_id,
            expression_id: Uuid::now_v7(),
            child_index: 0,
        }
    }

    /// Create a fresh identity for a child applied at `child_index`.
    pub fn child(&self, child_index: usize) -> Self {
        Self {
            process_id: self.process_id,
            expression_id: Uuid::now_v7(),
            child_index,
        }
    }

    /// Create a fresh identity at the same position (a new attempt of the
    /// same definition node, e.g. after a retry).
    pub fn reissue(&self) -> Self {
        Self {
            process_id: self.process_id,
            expression_id: Uuid::now_v7(),
            child_index: self.child_index,
        }
    }
}

impl std::fmt::Display for Fei {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.process_id, self.expression_id, self.child_index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_keeps_process_id_and_records_index() {
        let root = Fei::root(Uuid::now_v7());
        let child = root.child(3);
        assert_eq!(child.process_id, root.process_id);
        assert_eq!(child.child_index, 3);
        assert_ne!(child.expression_id, root.expression_id);
    }

    #[test]
    fn reissue_changes_only_expression_id() {
        let fei = Fei::root(Uuid::now_v7()).child(2);
        let again = fei.reissue();
        assert_eq!(again.process_id, fei.process_id);
        assert_eq!(again.child_index, 2);
        assert_ne!(again.expression_id, fei.expression_id);
        assert_ne!(again, fei);
    }

    #[test]
    fn display_contains_index() {
        let fei = Fei::root(Uuid::now_v7()).child(5);
        assert!(fei.to_string().ends_with("#5"));
    }
}
