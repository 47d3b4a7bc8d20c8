//! Parsing of `on_error` recovery policies.
//!
//! An `on_error` attribute is a comma-separated list of clauses, each of the
//! form `[<delay>: ]<command>`:
//!
//! - `retry` -- cancel the failed instance and dispatch it afresh.
//! - `pass` -- swallow the failure and let the flow continue.
//! - `5m: retry` -- as above, after a five-minute timer.
//!
//! Delay units are `s`, `m`, `h`, `d`. Parsing is lenient at attribute-read
//! time: each clause parses independently into a [`ParsedClause`], and a
//! malformed clause only becomes a configuration error when the failure
//! handler actually reaches it.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a clause does once any delay has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryCommand {
    /// Cancel the failed instance and re-dispatch a fresh attempt.
    Retry,
    /// Treat the failure as handled; the flow continues past the step.
    Pass,
}

/// One parsed recovery clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClause {
    pub delay: Option<Duration>,
    pub command: RecoveryCommand,
}

/// A clause that failed to parse.
///
/// These are configuration errors, and configuration errors are not
/// recoverable: consuming one fails the instance for good.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClauseError {
    #[error("unknown delay unit '{unit}' in on_error clause '{clause}'")]
    BadUnit { unit: char, clause: String },

    #[error("malformed delay in on_error clause '{clause}'")]
    BadDelay { clause: String },

    #[error("unknown recovery command '{command}' in on_error clause '{clause}'")]
    UnknownCommand { command: String, clause: String },

    #[error("empty on_error clause")]
    Empty,
}

/// A clause as stored on an instance: either usable or a deferred error.
pub type ParsedClause = Result<ErrorClause, ClauseError>;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a full `on_error` attribute into its clause list.
///
/// Clauses are consumed left to right, one per failure occurrence; when the
/// list is exhausted the failure stands.
pub fn parse_policy(attribute: &str) -> Vec<ParsedClause> {
    attribute
        .split(',')
        .map(|clause| parse_clause(clause.trim()))
        .collect()
}

/// Parse one `[<delay>: ]<command>` clause.
pub fn parse_clause(clause: &str) -> ParsedClause {
    if clause.is_empty() {
        return Err(ClauseError::Empty);
    }

    let (delay, command) = match clause.split_once(':') {
        Some((delay_part, command_part)) => {
            (Some(parse_delay(delay_part.trim(), clause)?), command_part.trim())
        }
        None => (None, clause),
    };

    let command = match command {
        "retry" => RecoveryCommand::Retry,
        "pass" => RecoveryCommand::Pass,
        other => {
            return Err(ClauseError::UnknownCommand {
                command: other.to_string(),
                clause: clause.to_string(),
            });
        }
    };

    Ok(ErrorClause { delay, command })
}

/// Parse `<int><unit>` where unit is one of `s`, `m`, `h`, `d`.
fn parse_delay(delay: &str, clause: &str) -> Result<Duration, ClauseError> {
    let mut chars = delay.chars();
    let unit = chars.next_back().ok_or_else(|| ClauseError::BadDelay {
        clause: clause.to_string(),
    })?;
    let magnitude: u64 = chars
        .as_str()
        .parse()
        .map_err(|_| ClauseError::BadDelay {
            clause: clause.to_string(),
        })?;

    let seconds = match unit {
        's' => magnitude,
        'm' => magnitude * 60,
        'h' => magnitude * 60 * 60,
        'd' => magnitude * 60 * 60 * 24,
        other => {
            return Err(ClauseError::BadUnit {
                unit: other,
                clause: clause.to_string(),
            });
        }
    };

    Ok(Duration::from_secs(seconds))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
