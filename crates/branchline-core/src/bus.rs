//! Broadcast event bus for engine lifecycle events.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.
//! Events are observability only -- nothing in the engine depends on anyone
//! listening.

use branchline_types::fei::Fei;
use branchline_types::message::CancelFlavour;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

/// An engine lifecycle event.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A process instance was launched.
    ProcessLaunched { process_id: Uuid },
    /// A process instance ran to completion (its root replied).
    ProcessCompleted { process_id: Uuid },
    /// A workitem was handed to a participant.
    WorkitemDispatched {
        fei: Fei,
        participant_name: String,
        /// Whether consume ran on an independent task.
        threaded: bool,
    },
    /// A participant's cancel operation was invoked.
    DispatchCancelled {
        fei: Fei,
        participant_name: String,
        flavour: CancelFlavour,
    },
    /// A participant consume raised a failure.
    ParticipantFailed { fei: Fei, error: String },
    /// A recovery timer was scheduled.
    TimerScheduled { fei: Fei, fire_at: DateTime<Utc> },
    /// Pending timers for an instance were cancelled.
    TimersCancelled { fei: Fei, count: usize },
    /// A failed attempt is being cancelled and re-applied.
    RetryAttempted { fei: Fei },
    /// A failure was converted into a normal reply (`pass`).
    PassApplied { fei: Fei },
    /// Recovery clauses are exhausted (or absent); the instance is parked
    /// in a failed state pending external intervention.
    StandingError { fei: Fei, error: String },
    /// An expression instance was cancelled.
    InstanceCancelled { fei: Fei },
}

/// Multi-consumer bus for [`EngineEvent`].
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> EngineEvent {
        EngineEvent::ProcessLaunched {
            process_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, EngineEvent::ProcessLaunched { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event());

        assert!(matches!(
            rx1.recv().await.unwrap(),
            EngineEvent::ProcessLaunched { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            EngineEvent::ProcessLaunched { .. }
        ));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(sample_event());
        bus.publish(sample_event());
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(sample_event());

        assert!(rx.try_recv().is_ok());
    }
}
