//! Expression tree nodes.
//!
//! `ExpressionNode` is the canonical, immutable process definition: a named
//! node with string-keyed attributes and an ordered list of children. The
//! DSL front end (out of scope here) produces these trees; the engine only
//! ever reads them. Runtime mutation -- like consuming `on_error` clauses --
//! happens on the live instance's state, never on the definition.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::CommandKind;

/// Attribute carrying the declarative recovery policy.
pub const ON_ERROR_ATTR: &str = "on_error";

/// A node in the process definition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionNode {
    /// The expression name (e.g. `sequence`, `loop`, `participant`, `alice`).
    pub name: String,
    /// Declarative attributes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Value>,
    /// Ordered child expressions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ExpressionNode>,
}

impl ExpressionNode {
    /// Create a node with no attributes or children.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: HashMap::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style: add an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Builder-style: append a child.
    pub fn child(mut self, child: ExpressionNode) -> Self {
        self.children.push(child);
        self
    }

    /// Look up an attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Look up an attribute as a string slice.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// The raw `on_error` clause string, if declared on this node.
    pub fn on_error(&self) -> Option<&str> {
        self.attribute_str(ON_ERROR_ATTR)
    }

    /// Whether this node executes its children as an ordered sequence
    /// (`sequence`, `cursor`, `loop`, `repeat`).
    pub fn is_sequence_kind(&self) -> bool {
        matches!(self.name.as_str(), "sequence" | "cursor" | "loop" | "repeat")
    }

    /// Whether exhausting the children wraps back to child 0 instead of
    /// replying to the parent.
    pub fn is_loop(&self) -> bool {
        matches!(self.name.as_str(), "loop" | "repeat")
    }

    /// Whether this node is an inline flow-control command
    /// (`rewind`, `break`, `skip`, `back`, `jump`, `continue`).
    pub fn is_command(&self) -> bool {
        CommandKind::from_name(&self.name).is_some()
    }

    /// The participant name this node dispatches to, if it is a participant
    /// reference.
    ///
    /// Two forms are recognized: an explicit `participant` node with a `ref`
    /// attribute, and the shorthand of naming the participant directly as a
    /// childless, non-command leaf.
    pub fn participant_ref(&self) -> Option<&str> {
        if self.name == "participant" {
            return self.attribute_str("ref");
        }
        if self.children.is_empty() && !self.is_command() && !self.is_sequence_kind() {
            return Some(&self.name);
        }
        None
    }
}
