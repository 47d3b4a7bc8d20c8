//! Workitem: the mutable payload threaded through the expression tree.
//!
//! A workitem carries JSON-valued fields from node to node and is the unit
//! of data handed to participants. A copy is made before handing it to any
//! independently scheduled task -- it is never shared mutably across a
//! concurrency boundary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fei::Fei;

/// Reserved field a participant (or embedder) may set to inject a
/// flow-control command into the replying workitem.
pub const COMMAND_FIELD: &str = "__command__";

/// Reserved field carrying an explicit participant override for dynamic
/// routing.
pub const PARTICIPANT_FIELD: &str = "__participant__";

/// Mutable data payload threaded through the tree and handed to participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workitem {
    /// Identity of the expression instance currently holding the workitem.
    pub fei: Fei,
    /// Name of the participant the workitem is (to be) dispatched to.
    pub participant_name: String,
    /// Accumulated fields.
    #[serde(default)]
    pub fields: HashMap<String, Value>,
    /// Stamped by the dispatcher just before handing to a participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl Workitem {
    /// Create a workitem addressed to `fei` with the given initial fields.
    pub fn new(fei: Fei, fields: HashMap<String, Value>) -> Self {
        Self {
            fei,
            participant_name: String::new(),
            fields,
            dispatched_at: None,
        }
    }

    /// Set a field, replacing any previous value.
    pub fn set_field(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Look up a field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Remove and return a field. Used for one-shot control fields such as
    /// [`COMMAND_FIELD`] so a command is honored exactly once.
    pub fn take_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Stamp the dispatch timestamp.
    pub fn stamp_dispatched(&mut self, at: DateTime<Utc>) {
        self.dispatched_at = Some(at);
    }

    /// Re-address the workitem to another expression instance, keeping the
    /// accumulated fields.
    pub fn readdress(mut self, fei: Fei) -> Self {
        self.fei = fei;
        self
    }
}
