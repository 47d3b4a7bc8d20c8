//! Observability wiring for the branchline engine: subscriber setup and an
//! event-bus log bridge.

pub mod events;
pub mod tracing_setup;

pub use events::spawn_event_logger;
pub use tracing_setup::{TracingConfig, init_tracing, shutdown_tracing};
