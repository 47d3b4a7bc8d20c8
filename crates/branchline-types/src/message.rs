//! The engine message protocol.
//!
//! `EngineMessage` is the sole unit of inter-component communication. Every
//! state transition in the engine is consume-one-message, act, emit the next
//! message(s); the channel carrying these (plus persisted tree state) is all
//! that is needed to resume after a crash. Consumers ignore actions they do
//! not handle -- the channel is shared.

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::fei::Fei;
use crate::node::ExpressionNode;
use crate::workitem::Workitem;

/// How a cancellation should behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelFlavour {
    /// Graceful: cancellation errors propagate.
    Cancel,
    /// Best-effort: cancellation errors are suppressed (and recorded).
    Kill,
}

/// A message on the engine channel, tagged by `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EngineMessage {
    /// Apply the root of a definition tree, starting a process instance.
    Launch {
        node: ExpressionNode,
        workitem: Workitem,
    },
    /// Hand a workitem to a participant.
    Dispatch {
        fei: Fei,
        /// Explicit participant override; falls back to the workitem's
        /// participant name when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant: Option<String>,
        workitem: Workitem,
    },
    /// Ask a participant to cancel an in-flight workitem.
    DispatchCancel {
        fei: Fei,
        flavour: CancelFlavour,
        workitem: Workitem,
    },
    /// Bookkeeping notification that a dispatch reached its participant.
    /// Idempotent; not a reply.
    Dispatched { fei: Fei, participant_name: String },
    /// An expression instance (or participant) reporting completion.
    Reply { fei: Fei, workitem: Workitem },
    /// A failure to be routed through the error & retry manager.
    Fail {
        fei: Fei,
        workitem: Workitem,
        kind: FailureKind,
        error: String,
    },
    /// A scheduled recovery (retry) is due for this instance.
    ErrorIntercepted { fei: Fei },
    /// Cancel an expression instance and everything it owns.
    Cancel { fei: Fei, flavour: CancelFlavour },
}

impl EngineMessage {
    /// The `action` tag, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            EngineMessage::Launch { .. } => "launch",
            EngineMessage::Dispatch { .. } => "dispatch",
            EngineMessage::DispatchCancel { .. } => "dispatch_cancel",
            EngineMessage::Dispatched { .. } => "dispatched",
            EngineMessage::Reply { .. } => "reply",
            EngineMessage::Fail { .. } => "fail",
            EngineMessage::ErrorIntercepted { .. } => "error_intercepted",
            EngineMessage::Cancel { .. } => "cancel",
        }
    }

    /// The identity the message is addressed to, when it has one.
    pub fn fei(&self) -> Option<&Fei> {
        match self {
            EngineMessage::Launch { workitem, .. } => Some(&workitem.fei),
            EngineMessage::Dispatch { fei, .. }
            | EngineMessage::DispatchCancel { fei, .. }
            | EngineMessage::Dispatched { fei, .. }
            | EngineMessage::Reply { fei, .. }
            | EngineMessage::Fail { fei, .. }
            | EngineMessage::ErrorIntercepted { fei }
            | EngineMessage::Cancel { fei, .. } => Some(fei),
        }
    }
}
