//! Bridge from the engine's broadcast event bus to tracing.
//!
//! The engine publishes lifecycle events whether or not anyone listens;
//! [`spawn_event_logger`] turns that stream into structured log lines so an
//! operator can follow dispatches, retries and standing errors without
//! instrumenting participants.

use branchline_core::bus::EngineEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// One-line description of an engine event.
pub fn describe(event: &EngineEvent) -> String {
    match event {
        EngineEvent::ProcessLaunched { process_id } => {
            format!("process {process_id} launched")
        }
        EngineEvent::ProcessCompleted { process_id } => {
            format!("process {process_id} completed")
        }
        EngineEvent::WorkitemDispatched {
            fei,
            participant_name,
            threaded,
        } => {
            let mode = if *threaded { "threaded" } else { "inline" };
            format!("{fei} dispatched to '{participant_name}' ({mode})")
        }
        EngineEvent::DispatchCancelled {
            fei,
            participant_name,
            flavour,
        } => format!("{fei} cancel ({flavour:?}) delivered to '{participant_name}'"),
        EngineEvent::ParticipantFailed { fei, error } => {
            format!("{fei} participant failed: {error}")
        }
        EngineEvent::TimerScheduled { fei, fire_at } => {
            format!("{fei} retry timer set for {fire_at}")
        }
        EngineEvent::TimersCancelled { fei, count } => {
            format!("{fei} cancelled {count} pending timer(s)")
        }
        EngineEvent::RetryAttempted { fei } => format!("{fei} retrying"),
        EngineEvent::PassApplied { fei } => format!("{fei} failure passed"),
        EngineEvent::StandingError { fei, error } => {
            format!("{fei} standing error: {error}")
        }
        EngineEvent::InstanceCancelled { fei } => format!("{fei} cancelled"),
    }
}

fn is_warning(event: &EngineEvent) -> bool {
    matches!(
        event,
        EngineEvent::ParticipantFailed { .. } | EngineEvent::StandingError { .. }
    )
}

/// Spawn a task logging every event on the bus until it closes.
///
/// Failures and standing errors log at `warn`, everything else at `info`. A
/// lagged receiver logs the number of missed events and keeps going.
pub fn spawn_event_logger(mut events: broadcast::Receiver<EngineEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if is_warning(&event) => {
                    tracing::warn!(target: "branchline::events", "{}", describe(&event));
                }
                Ok(event) => {
                    tracing::info!(target: "branchline::events", "{}", describe(&event));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(target: "branchline::events", missed, "event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchline_core::bus::EventBus;
    use branchline_types::fei::Fei;
    use uuid::Uuid;

    #[test]
    fn dispatch_description_names_participant_and_mode() {
        let fei = Fei::root(Uuid::now_v7());
        let text = describe(&EngineEvent::WorkitemDispatched {
            fei,
            participant_name: "alice".to_string(),
            threaded: false,
        });
        assert!(text.contains("'alice'"), "{text}");
        assert!(text.contains("inline"), "{text}");
    }

    #[test]
    fn failures_carry_the_error_and_log_as_warnings() {
        let fei = Fei::root(Uuid::now_v7());
        let event = EngineEvent::StandingError {
            fei,
            error: "flaky".to_string(),
        };
        assert!(is_warning(&event));
        assert!(describe(&event).contains("flaky"));
        assert!(!is_warning(&EngineEvent::ProcessLaunched {
            process_id: Uuid::now_v7(),
        }));
    }

    #[tokio::test]
    async fn logger_stops_when_the_bus_closes() {
        let bus = EventBus::new(16);
        let task = spawn_event_logger(bus.subscribe());
        bus.publish(EngineEvent::ProcessLaunched {
            process_id: Uuid::now_v7(),
        });
        drop(bus);

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("logger task did not stop")
            .expect("logger task panicked");
    }
}
