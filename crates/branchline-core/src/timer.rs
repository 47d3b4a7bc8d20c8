//! One-shot timers owned by expression instances.
//!
//! A timer sleeps for its delay on a spawned task, then emits its message on
//! the engine channel. Each timer carries a `CancellationToken`; cancelling
//! the owning instance cancels every still-pending timer so a retry can
//! never fire against a torn-down instance.

use std::sync::Arc;
use std::time::Duration;

use branchline_types::fei::Fei;
use branchline_types::message::EngineMessage;
use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::MessageSender;

struct TimerEntry {
    id: Uuid,
    token: CancellationToken,
}

/// Per-fei table of pending one-shot timers.
#[derive(Clone, Default)]
pub struct TimerPool {
    pending: Arc<DashMap<Fei, Vec<TimerEntry>>>,
}

impl TimerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `message` to be sent after `delay`, owned by `fei`.
    ///
    /// Returns the timer id. The entry removes itself when it fires.
    pub fn schedule(
        &self,
        fei: Fei,
        delay: Duration,
        message: EngineMessage,
        sender: MessageSender,
    ) -> Uuid {
        let id = Uuid::now_v7();
        let token = CancellationToken::new();

        self.pending.entry(fei.clone()).or_default().push(TimerEntry {
            id,
            token: token.clone(),
        });

        tracing::debug!(
            fei = %fei,
            timer_id = %id,
            delay_ms = delay.as_millis() as u64,
            fire_at = %(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())),
            "timer scheduled"
        );

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(fei = %fei, timer_id = %id, "timer cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    // Deregister before emitting so a cancel racing the fire
                    // finds nothing left to cancel.
                    if let Some(mut entries) = pending.get_mut(&fei) {
                        entries.retain(|e| e.id != id);
                    }
                    tracing::debug!(fei = %fei, timer_id = %id, "timer fired");
                    sender.send(message);
                }
            }
        });

        id
    }

    /// Cancel every pending timer owned by `fei`. Returns how many were
    /// still pending.
    pub fn cancel_for(&self, fei: &Fei) -> usize {
        match self.pending.remove(fei) {
            Some((_, entries)) => {
                for entry in &entries {
                    entry.token.cancel();
                }
                entries.len()
            }
            None => 0,
        }
    }

    /// Number of timers still pending for `fei`.
    pub fn pending_count(&self, fei: &Fei) -> usize {
        self.pending.get(fei).map(|e| e.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for TimerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerPool")
            .field("instances_with_timers", &self.pending.len())
            .finish()
    }
}
