//! The cursor interpreter: position arithmetic for sequence-kind nodes.
//!
//! A cursor walks its children in order. After each child replies, the
//! position advances by one unless a flow command says otherwise:
//!
//! - `rewind` / `continue` restart at child 0.
//! - `break` replies to the parent immediately.
//! - `skip n` / `back n` move the position by `n` (default 1).
//! - `jump <target>` moves to an absolute index or to the first child whose
//!   name, `ref` or `tag` matches the target.
//!
//! Commands arrive from the replying workitem's reserved control field or as
//! inline command nodes in the definition; the field takes precedence and is
//! consumed one-shot. Loop variants wrap an exhausted position back to 0;
//! everything else replies to the parent.

use branchline_types::command::{CommandKind, FlowCommand};
use branchline_types::node::ExpressionNode;
use branchline_types::workitem::{COMMAND_FIELD, Workitem};

use crate::eval::{ConditionEvaluator, substitute};

/// What the cursor decided after a reply (or the initial transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOutcome {
    /// Apply the child at this index.
    Apply(usize),
    /// The node is done; reply to the parent.
    ReplyToParent,
}

/// Compute the cursor's next step.
///
/// `reply_index` is the `child_index` of the replying child, or `None` for
/// the initial transition when the node is first applied. The workitem is
/// mutable because the reserved control field is consumed here.
pub fn next_step(
    node: &ExpressionNode,
    reply_index: Option<usize>,
    workitem: &mut Workitem,
    evaluator: &ConditionEvaluator,
) -> CursorOutcome {
    let len = node.children.len() as i64;
    let mut position: i64 = match reply_index {
        Some(index) => index as i64 + 1,
        None => 0,
    };

    // A control field on the replying workitem outranks inline commands.
    if let Some(value) = workitem.take_field(COMMAND_FIELD) {
        if let Some(command) = FlowCommand::from_field(&value) {
            if guard_holds(&command, workitem, evaluator) {
                match adjust(position, &command, node, workitem) {
                    Some(adjusted) => position = adjusted,
                    None => return CursorOutcome::ReplyToParent,
                }
            }
        } else {
            tracing::debug!(field = %value, "ignoring malformed cursor control field");
        }
    }

    // Inline command nodes are consumed in place as the cursor reaches them.
    // The budget bounds pathological definitions (e.g. a loop of nothing but
    // back commands) instead of spinning forever.
    let mut budget = node.children.len() * 2 + 2;
    loop {
        if position >= len {
            if node.is_loop() && len > 0 {
                position = 0;
            } else {
                return CursorOutcome::ReplyToParent;
            }
        }
        if position < 0 {
            return CursorOutcome::ReplyToParent;
        }

        let index = position as usize;
        let Some(command) = FlowCommand::from_node(&node.children[index]) else {
            return CursorOutcome::Apply(index);
        };

        if budget == 0 {
            tracing::warn!(
                node = node.name.as_str(),
                "cursor command scan exceeded its budget, completing node"
            );
            return CursorOutcome::ReplyToParent;
        }
        budget -= 1;

        if guard_holds(&command, workitem, evaluator) {
            match adjust(position + 1, &command, node, workitem) {
                Some(adjusted) => position = adjusted,
                None => return CursorOutcome::ReplyToParent,
            }
        } else {
            position += 1;
        }
    }
}

/// Apply a command to the already-incremented position.
///
/// Returns `None` for `break` (reply to the parent, position discarded).
fn adjust(
    position: i64,
    command: &FlowCommand,
    node: &ExpressionNode,
    workitem: &Workitem,
) -> Option<i64> {
    let arg = command
        .arg
        .as_deref()
        .map(|raw| substitute(raw, workitem));

    match command.kind {
        CommandKind::Break => None,
        CommandKind::Rewind | CommandKind::Continue => Some(0),
        CommandKind::Skip => Some(position + count(arg.as_deref())),
        CommandKind::Back => Some(position - count(arg.as_deref())),
        CommandKind::Jump => Some(jump_to(node, workitem, position, arg.as_deref())),
    }
}

/// Parse a skip/back count, defaulting to 1.
fn count(arg: Option<&str>) -> i64 {
    arg.and_then(|a| a.trim().parse().ok()).unwrap_or(1)
}

/// Resolve a jump target.
///
/// An integer argument is an absolute index. Otherwise children are scanned
/// in definition order, matching the argument against each child's name,
/// `ref` and `tag` (variables substituted) before moving to the next child.
/// An unresolvable target leaves the position unchanged.
fn jump_to(node: &ExpressionNode, workitem: &Workitem, position: i64, arg: Option<&str>) -> i64 {
    let Some(target) = arg.map(str::trim).filter(|t| !t.is_empty()) else {
        return position;
    };

    if let Ok(index) = target.parse::<i64>() {
        return index;
    }

    for (index, child) in node.children.iter().enumerate() {
        if child.name == target {
            return index as i64;
        }
        for attr in ["ref", "tag"] {
            if let Some(value) = child.attribute_str(attr) {
                if substitute(value, workitem) == target {
                    return index as i64;
                }
            }
        }
    }

    tracing::debug!(target, "jump target matched no child, keeping position");
    position
}

/// Evaluate a command's `if` guard. A command with no guard always holds;
/// a guard that fails to evaluate is treated as not holding.
fn guard_holds(command: &FlowCommand, workitem: &Workitem, evaluator: &ConditionEvaluator) -> bool {
    let Some(condition) = command.condition.as_deref() else {
        return true;
    };
    let condition = substitute(condition, workitem);
    match evaluator.holds(&condition, workitem) {
        Ok(holds) => holds,
        Err(error) => {
            tracing::warn!(
                condition = condition.as_str(),
                error = %error,
                "command guard failed to evaluate, ignoring command"
            );
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
