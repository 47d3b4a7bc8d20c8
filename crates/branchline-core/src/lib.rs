//! Workflow-execution core: message-driven engine over tree-shaped process
//! definitions.
//!
//! The engine drives a process definition to completion by dispatching
//! workitems to participants, interpreting cursor/loop control flow, and
//! recovering from failures via declarative `on_error` policies:
//! - `channel` -- the engine mailbox (single-consumer message channel)
//! - `bus` -- broadcast bus for engine lifecycle events
//! - `context` -- shared execution context handle
//! - `participant` / `registry` -- external handler surface and lookup
//! - `dispatcher` -- dispatch / dispatch_cancel handling, threading policy
//! - `cursor` -- position arithmetic and flow-control command interpretation
//! - `on_error` -- declarative recovery-clause parsing
//! - `timer` -- one-shot per-instance timers with cancellation
//! - `error_log` -- process-wide append-only failure journal
//! - `instance` -- live expression-instance state
//! - `engine` -- the mailbox loop tying it all together

pub mod bus;
pub mod channel;
pub mod context;
pub mod cursor;
pub mod dispatcher;
pub mod engine;
pub mod error_log;
pub mod eval;
pub mod instance;
pub mod on_error;
pub mod participant;
pub mod registry;
pub mod timer;
