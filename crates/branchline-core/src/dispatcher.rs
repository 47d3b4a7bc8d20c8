//! The dispatcher: hands workitems to participants and asks them to cancel.
//!
//! Consumes `dispatch` and `dispatch_cancel`; produces `dispatched`, `reply`
//! and `fail` messages on the engine channel.
//!
//! Threading policy: each participant declares its capability up front
//! ([`DoNotThread`]); the dispatcher never probes the handler at call time.
//! A threadable consume runs on its own task with a deep copy of the
//! workitem, and anything that goes wrong on that task -- an error return or
//! a panic -- is caught at the task boundary and forwarded as a `fail`
//! message, never dropped.
//!
//! [`DoNotThread`]: crate::participant::DoNotThread

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use branchline_types::error::{FailureKind, ParticipantError};
use branchline_types::fei::Fei;
use branchline_types::message::{CancelFlavour, EngineMessage};
use branchline_types::workitem::{PARTICIPANT_FIELD, Workitem};
use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::Semaphore;

use crate::bus::{EngineEvent, EventBus};
use crate::channel::MessageSender;
use crate::context::EngineContext;
use crate::participant::Participant;

// ---------------------------------------------------------------------------
// DispatchPool
// ---------------------------------------------------------------------------

/// Admission control for threaded dispatches.
///
/// `unbounded` spawns freely; `bounded(n)` caps concurrently running
/// threaded consumes at `n`, with excess dispatches waiting their turn on
/// their own tasks (the engine loop itself never blocks on admission).
#[derive(Clone)]
pub struct DispatchPool {
    permits: Option<Arc<Semaphore>>,
}

impl DispatchPool {
    /// No admission control.
    pub fn unbounded() -> Self {
        Self { permits: None }
    }

    /// At most `limit` threaded consumes at once.
    pub fn bounded(limit: usize) -> Self {
        Self {
            permits: Some(Arc::new(Semaphore::new(limit))),
        }
    }

    /// Acquire a permit, waiting if the pool is bounded and full. The permit
    /// is held for the duration of the consume.
    async fn admit(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        match &self.permits {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        }
    }
}

impl std::fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.permits {
            Some(s) => write!(f, "DispatchPool::Bounded(available={})", s.available_permits()),
            None => f.write_str("DispatchPool::Unbounded"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Dispatcher-level failures returned to the engine loop.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The message named no participant and the workitem carried none.
    #[error("dispatch named no participant")]
    MissingParticipant,

    /// No handler registered under the name.
    #[error("no participant named '{0}' is registered")]
    UnknownParticipant(String),

    /// A graceful cancel was refused by the participant.
    #[error("participant '{participant}' failed to cancel: {source}")]
    CancelFailed {
        participant: String,
        source: ParticipantError,
    },
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Hands workitems to participants; see the module docs.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    ctx: EngineContext,
}

impl Dispatcher {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Handle a `dispatch` message.
    ///
    /// Resolution failures come back as an error for the caller to route
    /// through the failure path. The consume runs first; only a consume that
    /// accepted the work produces the `dispatched` notification, while a
    /// failing or panicking consume produces a `fail` message instead --
    /// from whichever task ran it.
    pub async fn dispatch(
        &self,
        fei: Fei,
        participant: Option<String>,
        mut workitem: Workitem,
    ) -> Result<(), DispatchError> {
        let name = resolve_participant(participant.as_deref(), &workitem)?;
        let handler = self
            .ctx
            .registry
            .resolve(&name)
            .ok_or_else(|| DispatchError::UnknownParticipant(name.clone()))?;

        workitem.participant_name = name.clone();
        workitem.stamp_dispatched(Utc::now());

        let threaded = !handler.do_not_thread().decide(&workitem);
        tracing::info!(fei = %fei, participant = name.as_str(), threaded, "dispatching workitem");

        if threaded {
            // Deep copy: the engine keeps mutating its own workitem while
            // the participant runs.
            let copy = workitem.clone();
            let sender = self.ctx.sender.clone();
            let events = self.ctx.events.clone();
            let pool = self.ctx.pool.clone();
            tokio::spawn(async move {
                let _permit = pool.admit().await;
                match consume_guarded(handler.as_ref(), copy).await {
                    None => report_dispatched(&sender, &events, fei, name, true),
                    Some(error) => sender.send(EngineMessage::Fail {
                        fei,
                        workitem,
                        kind: FailureKind::Participant,
                        error,
                    }),
                }
            });
        } else {
            match consume_guarded(handler.as_ref(), workitem.clone()).await {
                None => report_dispatched(&self.ctx.sender, &self.ctx.events, fei, name, false),
                Some(error) => self.ctx.sender.send(EngineMessage::Fail {
                    fei,
                    workitem,
                    kind: FailureKind::Participant,
                    error,
                }),
            }
        }

        Ok(())
    }

    /// Handle a `dispatch_cancel` message.
    ///
    /// A `reply` with the original fei/workitem is always emitted, whatever
    /// the cancel itself did -- the tree must never stall waiting on a
    /// cancel completion. Under [`CancelFlavour::Kill`] a cancel failure is
    /// recorded and suppressed; under the graceful flavour it is returned.
    pub async fn dispatch_cancel(
        &self,
        fei: Fei,
        flavour: CancelFlavour,
        workitem: Workitem,
    ) -> Result<(), DispatchError> {
        let name = workitem.participant_name.clone();
        let outcome = match self.ctx.registry.resolve(&name) {
            Some(handler) => handler.cancel(&fei, flavour).await,
            None if name.is_empty() => Ok(()),
            None => {
                // Nothing to cancel; the reply below still unblocks the tree.
                tracing::warn!(fei = %fei, participant = name.as_str(), "cancel for unknown participant");
                Ok(())
            }
        };

        self.ctx.events.publish(EngineEvent::DispatchCancelled {
            fei: fei.clone(),
            participant_name: name.clone(),
            flavour,
        });
        self.ctx.sender.send(EngineMessage::Reply {
            fei: fei.clone(),
            workitem,
        });

        match (outcome, flavour) {
            (Ok(()), _) => Ok(()),
            (Err(error), CancelFlavour::Kill) => {
                self.ctx.error_log.append(branchline_types::error::ErrorRecord::now(
                    fei,
                    FailureKind::Cancellation,
                    error.to_string(),
                ));
                Ok(())
            }
            (Err(source), CancelFlavour::Cancel) => Err(DispatchError::CancelFailed {
                participant: name,
                source,
            }),
        }
    }
}

/// Pick the participant name: explicit override, then the reserved routing
/// field, then the workitem's own participant name.
///
/// Shared with the engine loop, which stamps the same name onto its own copy
/// of the instance when it issues the dispatch.
pub(crate) fn resolve_participant(
    participant: Option<&str>,
    workitem: &Workitem,
) -> Result<String, DispatchError> {
    if let Some(name) = participant.filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }
    if let Some(name) = workitem.field(PARTICIPANT_FIELD).and_then(|v| v.as_str()) {
        return Ok(name.to_string());
    }
    if !workitem.participant_name.is_empty() {
        return Ok(workitem.participant_name.clone());
    }
    Err(DispatchError::MissingParticipant)
}

/// Emit the `dispatched` notification once a consume has accepted the work.
fn report_dispatched(
    sender: &MessageSender,
    events: &EventBus,
    fei: Fei,
    participant_name: String,
    threaded: bool,
) {
    sender.send(EngineMessage::Dispatched {
        fei: fei.clone(),
        participant_name: participant_name.clone(),
    });
    events.publish(EngineEvent::WorkitemDispatched {
        fei,
        participant_name,
        threaded,
    });
}

/// Run a consume with the task-boundary guard: error returns and panics both
/// come back as a failure description.
async fn consume_guarded(handler: &dyn Participant, workitem: Workitem) -> Option<String> {
    match AssertUnwindSafe(handler.consume(workitem)).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(error.to_string()),
        Err(panic) => Some(panic_description(panic)),
    }
}

fn panic_description(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("participant panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("participant panicked: {s}")
    } else {
        "participant panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use crate::participant::{DoNotThread, ParticipantFuture};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Recording {
        consumed: Arc<Mutex<Vec<Workitem>>>,
        cancelled: Arc<Mutex<Vec<(Fei, CancelFlavour)>>>,
        consume_result: Result<(), String>,
        cancel_result: Result<(), String>,
        do_not_thread: DoNotThread,
    }

    impl Recording {
        fn ok() -> Self {
            Self {
                consumed: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                consume_result: Ok(()),
                cancel_result: Ok(()),
                do_not_thread: DoNotThread::Unspecified,
            }
        }

        fn failing(error: &str) -> Self {
            Self {
                consume_result: Err(error.to_string()),
                ..Self::ok()
            }
        }
    }

    impl Participant for Recording {
        fn consume(&self, workitem: Workitem) -> ParticipantFuture<'_> {
            self.consumed.lock().unwrap().push(workitem);
            let result = self.consume_result.clone();
            Box::pin(async move { result.map_err(ParticipantError::Failed) })
        }

        fn cancel<'a>(&'a self, fei: &'a Fei, flavour: CancelFlavour) -> ParticipantFuture<'a> {
            self.cancelled.lock().unwrap().push((fei.clone(), flavour));
            let result = self.cancel_result.clone();
            Box::pin(async move { result.map_err(ParticipantError::CancelFailed) })
        }

        fn do_not_thread(&self) -> DoNotThread {
            self.do_not_thread.clone()
        }
    }

    struct Panicking;

    impl Participant for Panicking {
        fn consume(&self, _workitem: Workitem) -> ParticipantFuture<'_> {
            Box::pin(async { panic!("boom") })
        }

        fn cancel<'a>(&'a self, _fei: &'a Fei, _flavour: CancelFlavour) -> ParticipantFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    fn setup() -> (Dispatcher, MessageChannel) {
        let channel = MessageChannel::new();
        let ctx = EngineContext::new(channel.sender.clone(), DispatchPool::unbounded());
        (Dispatcher::new(ctx), channel)
    }

    fn workitem(fei: &Fei) -> Workitem {
        Workitem::new(fei.clone(), HashMap::new())
    }

    async fn recv(channel: &mut MessageChannel) -> EngineMessage {
        tokio::time::timeout(std::time::Duration::from_secs(1), channel.receiver.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    // -------------------------------------------------------------------
    // dispatch
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn dispatch_emits_dispatched_and_consumes() {
        let (dispatcher, mut channel) = setup();
        let alice = Arc::new(Recording::ok());
        dispatcher.ctx.registry.register("alice", alice.clone());

        let fei = Fei::root(Uuid::now_v7());
        dispatcher
            .dispatch(fei.clone(), Some("alice".to_string()), workitem(&fei))
            .await
            .unwrap();

        match recv(&mut channel).await {
            EngineMessage::Dispatched { participant_name, .. } => {
                assert_eq!(participant_name, "alice");
            }
            other => panic!("expected dispatched, got {}", other.action()),
        }

        // The threaded consume runs on its own task.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let consumed = alice.consumed.lock().unwrap();
        assert_eq!(consumed.len(), 1);
        assert!(consumed[0].dispatched_at.is_some());
        assert_eq!(consumed[0].participant_name, "alice");
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_workitem_participant() {
        let (dispatcher, mut channel) = setup();
        let bob = Arc::new(Recording::ok());
        dispatcher.ctx.registry.register("bob", bob.clone());

        let fei = Fei::root(Uuid::now_v7());
        let mut wi = workitem(&fei);
        wi.participant_name = "bob".to_string();
        dispatcher.dispatch(fei, None, wi).await.unwrap();

        match recv(&mut channel).await {
            EngineMessage::Dispatched { participant_name, .. } => {
                assert_eq!(participant_name, "bob");
            }
            other => panic!("expected dispatched, got {}", other.action()),
        }
    }

    #[tokio::test]
    async fn dispatch_honors_routing_field_override() {
        let (dispatcher, mut channel) = setup();
        dispatcher.ctx.registry.register("carol", Arc::new(Recording::ok()));

        let fei = Fei::root(Uuid::now_v7());
        let mut wi = workitem(&fei);
        wi.participant_name = "bob".to_string();
        wi.set_field(PARTICIPANT_FIELD, serde_json::json!("carol"));
        dispatcher.dispatch(fei, None, wi).await.unwrap();

        match recv(&mut channel).await {
            EngineMessage::Dispatched { participant_name, .. } => {
                assert_eq!(participant_name, "carol");
            }
            other => panic!("expected dispatched, got {}", other.action()),
        }
    }

    #[tokio::test]
    async fn unknown_participant_is_a_dispatch_error() {
        let (dispatcher, _channel) = setup();
        let fei = Fei::root(Uuid::now_v7());
        let result = dispatcher
            .dispatch(fei.clone(), Some("ghost".to_string()), workitem(&fei))
            .await;
        assert!(matches!(result, Err(DispatchError::UnknownParticipant(n)) if n == "ghost"));
    }

    #[tokio::test]
    async fn missing_participant_is_a_dispatch_error() {
        let (dispatcher, _channel) = setup();
        let fei = Fei::root(Uuid::now_v7());
        let result = dispatcher.dispatch(fei.clone(), None, workitem(&fei)).await;
        assert!(matches!(result, Err(DispatchError::MissingParticipant)));
    }

    #[tokio::test]
    async fn threaded_failure_is_forwarded_as_fail() {
        let (dispatcher, mut channel) = setup();
        dispatcher
            .ctx
            .registry
            .register("alice", Arc::new(Recording::failing("badly")));

        let fei = Fei::root(Uuid::now_v7());
        dispatcher
            .dispatch(fei.clone(), Some("alice".to_string()), workitem(&fei))
            .await
            .unwrap();

        // A failed consume never reports `dispatched`; the fail comes first.
        match recv(&mut channel).await {
            EngineMessage::Fail { fei: failed, kind, error, .. } => {
                assert_eq!(failed, fei);
                assert_eq!(kind, FailureKind::Participant);
                assert_eq!(error, "badly");
            }
            other => panic!("expected fail, got {}", other.action()),
        }
    }

    #[tokio::test]
    async fn panic_is_caught_at_the_task_boundary() {
        let (dispatcher, mut channel) = setup();
        dispatcher.ctx.registry.register("alice", Arc::new(Panicking));

        let fei = Fei::root(Uuid::now_v7());
        dispatcher
            .dispatch(fei.clone(), Some("alice".to_string()), workitem(&fei))
            .await
            .unwrap();

        match recv(&mut channel).await {
            EngineMessage::Fail { error, .. } => {
                assert!(error.contains("panicked"), "{error}");
                assert!(error.contains("boom"), "{error}");
            }
            other => panic!("expected fail, got {}", other.action()),
        }
    }

    #[tokio::test]
    async fn do_not_thread_runs_inline() {
        let (dispatcher, mut channel) = setup();
        let alice = Arc::new(Recording {
            do_not_thread: DoNotThread::Fixed(true),
            ..Recording::ok()
        });
        dispatcher.ctx.registry.register("alice", alice.clone());

        let fei = Fei::root(Uuid::now_v7());
        dispatcher
            .dispatch(fei.clone(), Some("alice".to_string()), workitem(&fei))
            .await
            .unwrap();

        // Consume already happened by the time dispatch returned.
        assert_eq!(alice.consumed.lock().unwrap().len(), 1);
        match recv(&mut channel).await {
            EngineMessage::Dispatched { participant_name, .. } => {
                assert_eq!(participant_name, "alice");
            }
            other => panic!("expected dispatched, got {}", other.action()),
        }
    }

    #[tokio::test]
    async fn failed_inline_consume_reports_fail_not_dispatched() {
        let (dispatcher, mut channel) = setup();
        let alice = Arc::new(Recording {
            do_not_thread: DoNotThread::Fixed(true),
            ..Recording::failing("badly")
        });
        dispatcher.ctx.registry.register("alice", alice.clone());

        let fei = Fei::root(Uuid::now_v7());
        dispatcher
            .dispatch(fei.clone(), Some("alice".to_string()), workitem(&fei))
            .await
            .unwrap();

        assert_eq!(alice.consumed.lock().unwrap().len(), 1);
        match recv(&mut channel).await {
            EngineMessage::Fail { fei: failed, kind, .. } => {
                assert_eq!(failed, fei);
                assert_eq!(kind, FailureKind::Participant);
            }
            other => panic!("expected fail, got {}", other.action()),
        }
    }

    #[tokio::test]
    async fn bounded_pool_still_runs_everything() {
        let channel = MessageChannel::new();
        let ctx = EngineContext::new(channel.sender.clone(), DispatchPool::bounded(1));
        let dispatcher = Dispatcher::new(ctx);
        let alice = Arc::new(Recording::ok());
        dispatcher.ctx.registry.register("alice", alice.clone());

        for _ in 0..3 {
            let fei = Fei::root(Uuid::now_v7());
            dispatcher
                .dispatch(fei.clone(), Some("alice".to_string()), workitem(&fei))
                .await
                .unwrap();
        }

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(alice.consumed.lock().unwrap().len(), 3);
    }

    // -------------------------------------------------------------------
    // dispatch_cancel
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn cancel_always_replies() {
        let (dispatcher, mut channel) = setup();
        let alice = Arc::new(Recording::ok());
        dispatcher.ctx.registry.register("alice", alice.clone());

        let fei = Fei::root(Uuid::now_v7());
        let mut wi = workitem(&fei);
        wi.participant_name = "alice".to_string();
        dispatcher
            .dispatch_cancel(fei.clone(), CancelFlavour::Cancel, wi)
            .await
            .unwrap();

        assert_eq!(alice.cancelled.lock().unwrap().len(), 1);
        match recv(&mut channel).await {
            EngineMessage::Reply { fei: replied, .. } => assert_eq!(replied, fei),
            other => panic!("expected reply, got {}", other.action()),
        }
    }

    #[tokio::test]
    async fn graceful_cancel_failure_propagates_after_replying() {
        let (dispatcher, mut channel) = setup();
        let alice = Arc::new(Recording {
            cancel_result: Err("stuck".to_string()),
            ..Recording::ok()
        });
        dispatcher.ctx.registry.register("alice", alice);

        let fei = Fei::root(Uuid::now_v7());
        let mut wi = workitem(&fei);
        wi.participant_name = "alice".to_string();
        let result = dispatcher
            .dispatch_cancel(fei.clone(), CancelFlavour::Cancel, wi)
            .await;

        assert!(matches!(result, Err(DispatchError::CancelFailed { .. })));
        match recv(&mut channel).await {
            EngineMessage::Reply { fei: replied, .. } => assert_eq!(replied, fei),
            other => panic!("expected reply, got {}", other.action()),
        }
    }

    #[tokio::test]
    async fn kill_suppresses_and_records_cancel_failure() {
        let (dispatcher, mut channel) = setup();
        let alice = Arc::new(Recording {
            cancel_result: Err("stuck".to_string()),
            ..Recording::ok()
        });
        dispatcher.ctx.registry.register("alice", alice);

        let fei = Fei::root(Uuid::now_v7());
        let mut wi = workitem(&fei);
        wi.participant_name = "alice".to_string();
        dispatcher
            .dispatch_cancel(fei.clone(), CancelFlavour::Kill, wi)
            .await
            .unwrap();

        match recv(&mut channel).await {
            EngineMessage::Reply { .. } => {}
            other => panic!("expected reply, got {}", other.action()),
        }
        assert_eq!(dispatcher.ctx.error_log.for_fei(&fei).len(), 1);
    }
}
