//! Flow-control commands understood by the cursor interpreter.
//!
//! A command reaches the cursor one of two ways, both with the same shape:
//! an inline command node in the definition (`{name, to?, if?}`), or the
//! reserved [`COMMAND_FIELD`] on the replying workitem (either a string like
//! `"skip 2"` or an object `{command, to?, if?}`).
//!
//! [`COMMAND_FIELD`]: crate::workitem::COMMAND_FIELD

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::ExpressionNode;

/// The kind of flow-control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Restart the cursor at child 0.
    Rewind,
    /// Reply to the parent immediately, unconditionally.
    Break,
    /// Advance by the argument (default 1) extra children.
    Skip,
    /// Move back by the argument (default 1) children.
    Back,
    /// Jump to an absolute index, or to the first child matching the
    /// argument by name, `ref` or `tag`.
    Jump,
    /// Synonym for rewind.
    Continue,
}

impl CommandKind {
    /// Parse a command name, returning `None` for anything unrecognized.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rewind" => Some(Self::Rewind),
            "break" => Some(Self::Break),
            "skip" => Some(Self::Skip),
            "back" => Some(Self::Back),
            "jump" => Some(Self::Jump),
            "continue" => Some(Self::Continue),
            _ => None,
        }
    }
}

/// A flow-control command with its optional argument and guard condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCommand {
    pub kind: CommandKind,
    /// Textual argument (`to`): a count for skip/back, a target for jump.
    /// Variable substitution is applied by the interpreter before use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<String>,
    /// Boolean guard expression (`if`), evaluated against the current
    /// workitem; the command is honored only when it holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl FlowCommand {
    /// Read a command from an inline command node, if the node is one.
    pub fn from_node(node: &ExpressionNode) -> Option<Self> {
        let kind = CommandKind::from_name(&node.name)?;
        Some(Self {
            kind,
            arg: node.attribute_str("to").map(str::to_owned),
            condition: node.attribute_str("if").map(str::to_owned),
        })
    }

    /// Read a command from a reserved workitem control field.
    ///
    /// Accepts either a string (`"skip 2"`, `"break"`) or an object
    /// (`{"command": "jump", "to": "review", "if": "approved == true"}`).
    /// Malformed values yield `None` -- the channel is shared and a bad
    /// control field is ignored like any unrecognized message.
    pub fn from_field(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => {
                let mut words = s.split_whitespace();
                let kind = CommandKind::from_name(words.next()?)?;
                Some(Self {
                    kind,
                    arg: words.next().map(str::to_owned),
                    condition: None,
                })
            }
            Value::Object(map) => {
                let kind = CommandKind::from_name(map.get("command")?.as_str()?)?;
                Some(Self {
                    kind,
                    arg: map.get("to").and_then(Value::as_str).map(str::to_owned),
                    condition: map.get("if").and_then(Value::as_str).map(str::to_owned),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -------------------------------------------------------------------
    // from_node
    // -------------------------------------------------------------------

    #[test]
    fn from_node_reads_to_and_if() {
        let node = ExpressionNode::new("jump")
            .attr("to", "review")
            .attr("if", "approved == true");
        let cmd = FlowCommand::from_node(&node).unwrap();
        assert_eq!(cmd.kind, CommandKind::Jump);
        assert_eq!(cmd.arg.as_deref(), Some("review"));
        assert_eq!(cmd.condition.as_deref(), Some("approved == true"));
    }

    #[test]
    fn from_node_rejects_non_command() {
        assert!(FlowCommand::from_node(&ExpressionNode::new("alice")).is_none());
    }

    // -------------------------------------------------------------------
    // from_field
    // -------------------------------------------------------------------

    #[test]
    fn from_field_string_with_arg() {
        let cmd = FlowCommand::from_field(&json!("skip 2")).unwrap();
        assert_eq!(cmd.kind, CommandKind::Skip);
        assert_eq!(cmd.arg.as_deref(), Some("2"));
        assert!(cmd.condition.is_none());
    }

    #[test]
    fn from_field_bare_string() {
        let cmd = FlowCommand::from_field(&json!("break")).unwrap();
        assert_eq!(cmd.kind, CommandKind::Break);
        assert!(cmd.arg.is_none());
    }

    #[test]
    fn from_field_object() {
        let cmd = FlowCommand::from_field(&json!({
            "command": "jump",
            "to": "y",
            "if": "n > 3"
        }))
        .unwrap();
        assert_eq!(cmd.kind, CommandKind::Jump);
        assert_eq!(cmd.arg.as_deref(), Some("y"));
        assert_eq!(cmd.condition.as_deref(), Some("n > 3"));
    }

    #[test]
    fn from_field_malformed_is_none() {
        assert!(FlowCommand::from_field(&json!(42)).is_none());
        assert!(FlowCommand::from_field(&json!("launch missiles")).is_none());
        assert!(FlowCommand::from_field(&json!({"to": "y"})).is_none());
    }
}
