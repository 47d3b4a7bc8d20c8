//! Failure taxonomy and the append-only error record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fei::Fei;

/// What kind of failure an error record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Raised by external handler code during consume; subject to `on_error`.
    Participant,
    /// Malformed declarative attribute (e.g. a bad delay unit); always
    /// recorded, never retried.
    Configuration,
    /// Raised during cancel; suppressed under `kill`, propagated otherwise.
    Cancellation,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Participant => "participant",
            FailureKind::Configuration => "configuration",
            FailureKind::Cancellation => "cancellation",
        };
        f.write_str(s)
    }
}

/// One entry in the process-wide, append-only error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The expression instance the failure occurred on.
    pub fei: Fei,
    /// Failure description, including the originating kind.
    pub message: String,
    /// Failure kind.
    pub kind: FailureKind,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Create a record stamped with the current time.
    pub fn now(fei: Fei, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            fei,
            message: message.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Errors raised by participant handler code.
#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("{0}")]
    Failed(String),

    #[error("cancel failed: {0}")]
    CancelFailed(String),
}

impl ParticipantError {
    /// Shorthand for a consume failure with the given description.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
