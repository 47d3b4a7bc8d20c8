//! Shared engine context.
//!
//! One explicit bundle of the shared services every engine component needs,
//! passed by clone instead of reached for through globals. All members are
//! cheap handles over `Arc`-backed state.

use crate::bus::EventBus;
use crate::channel::MessageSender;
use crate::dispatcher::DispatchPool;
use crate::error_log::ErrorLog;
use crate::registry::ParticipantRegistry;
use crate::timer::TimerPool;

/// Shared services: registry, engine channel, error log, timers, events and
/// the dispatch admission pool.
#[derive(Clone, Debug)]
pub struct EngineContext {
    pub registry: ParticipantRegistry,
    pub sender: MessageSender,
    pub error_log: ErrorLog,
    pub timers: TimerPool,
    pub events: EventBus,
    pub pool: DispatchPool,
}

impl EngineContext {
    pub fn new(sender: MessageSender, pool: DispatchPool) -> Self {
        Self {
            registry: ParticipantRegistry::new(),
            sender,
            error_log: ErrorLog::new(),
            timers: TimerPool::new(),
            events: EventBus::new(256),
            pool,
        }
    }
}
