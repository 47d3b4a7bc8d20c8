//! Live expression instances.
//!
//! An instance exists from the moment a parent applies a node until the
//! node replies or is cancelled. It carries the applied definition node,
//! the workitem travelling through it, and the recovery clauses parsed
//! from the node's `on_error` attribute.
//!
//! Clause consumption is a cursor over the immutable parsed list: each
//! failure occurrence advances `consumed` by one, and a retry attempt (a
//! fresh instance for the same node) inherits the count so recovery stays
//! bounded by the declared clause total across attempts.

use branchline_types::fei::Fei;
use branchline_types::node::ExpressionNode;
use branchline_types::workitem::Workitem;

use crate::on_error::{self, ParsedClause};

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Dispatched or interpreting; normal progress.
    Active,
    /// A standing error: clauses exhausted (or none declared), waiting for
    /// external intervention.
    Failed,
}

/// One live, applied instance of a definition node.
#[derive(Debug, Clone)]
pub struct ExpressionInstance {
    pub fei: Fei,
    /// The applying parent, `None` for a process root.
    pub parent: Option<Fei>,
    /// The definition node this instance executes. Never mutated.
    pub node: ExpressionNode,
    /// Last known workitem for this instance.
    pub workitem: Workitem,
    pub state: InstanceState,
    clauses: Vec<ParsedClause>,
    consumed: usize,
}

impl ExpressionInstance {
    /// Create an instance for a freshly applied node.
    pub fn new(fei: Fei, parent: Option<Fei>, node: ExpressionNode, workitem: Workitem) -> Self {
        let clauses = node
            .on_error()
            .map(on_error::parse_policy)
            .unwrap_or_default();
        Self {
            fei,
            parent,
            node,
            workitem,
            state: InstanceState::Active,
            clauses,
            consumed: 0,
        }
    }

    /// Create a retry attempt of this instance at a new fei.
    ///
    /// The fresh instance starts over with the given workitem but inherits
    /// the consumed-clause count.
    pub fn reissue(&self, fei: Fei, workitem: Workitem) -> Self {
        Self {
            fei,
            parent: self.parent.clone(),
            node: self.node.clone(),
            workitem,
            state: InstanceState::Active,
            clauses: self.clauses.clone(),
            consumed: self.consumed,
        }
    }

    /// Consume the next recovery clause, if any remain.
    pub fn next_clause(&mut self) -> Option<ParsedClause> {
        let clause = self.clauses.get(self.consumed).cloned()?;
        self.consumed += 1;
        if let Ok(c) = &clause {
            tracing::debug!(
                fei = %self.fei,
                consumed = self.consumed,
                remaining = self.remaining_clauses(),
                command = ?c.command,
                "recovery clause consumed"
            );
        }
        Some(clause)
    }

    /// Clauses not yet consumed.
    pub fn remaining_clauses(&self) -> usize {
        self.clauses.len().saturating_sub(self.consumed)
    }

    /// Clauses consumed so far, across this attempt.
    pub fn consumed_clauses(&self) -> usize {
        self.consumed
    }
}
