//! The engine: single-consumer message loop driving the expression tree.
//!
//! One task owns the mailbox receiver and handles one message completely
//! before the next, which is what gives messages addressed to the same fei
//! their causal order. Everything else -- threaded participant consumes,
//! recovery timers -- feeds its outcome back through the same mailbox.
//!
//! Message routing:
//! - `launch` applies a definition tree's root, starting a process instance.
//! - `dispatch` / `dispatch_cancel` go to the [`Dispatcher`].
//! - `reply` advances the replying instance's parent cursor; a reply for an
//!   instance no longer in the table is stale (a cancelled or retried
//!   attempt) and is discarded.
//! - `fail` routes through the error & retry manager: record first, then
//!   consume the next `on_error` clause, if any.
//! - `error_intercepted` is a due retry: cancel the failed attempt, re-apply
//!   the same definition node as a fresh instance.
//! - `cancel` tears down an instance, its subtree and its timers.

use std::collections::HashMap;
use std::sync::Arc;

use branchline_types::error::{ErrorRecord, FailureKind};
use branchline_types::fei::Fei;
use branchline_types::message::{CancelFlavour, EngineMessage};
use branchline_types::node::ExpressionNode;
use branchline_types::workitem::Workitem;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::bus::{EngineEvent, EventBus};
use crate::channel::MessageChannel;
use crate::context::EngineContext;
use crate::cursor::{self, CursorOutcome};
use crate::dispatcher::{DispatchPool, Dispatcher, resolve_participant};
use crate::error_log::ErrorLog;
use crate::eval::ConditionEvaluator;
use crate::instance::{ExpressionInstance, InstanceState};
use crate::on_error::RecoveryCommand;
use crate::registry::ParticipantRegistry;
use crate::timer::TimerPool;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on concurrently running threaded dispatches. `None` spawns
    /// freely.
    pub dispatch_limit: Option<usize>,
    /// Event bus buffer per subscriber.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_limit: None,
            event_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The message loop state. Constructed and consumed by [`Engine::start`].
pub struct Engine {
    ctx: EngineContext,
    dispatcher: Dispatcher,
    instances: Arc<DashMap<Fei, ExpressionInstance>>,
    roots: Arc<DashMap<Uuid, Fei>>,
    results: Arc<DashMap<Uuid, Workitem>>,
}

impl Engine {
    /// Spawn the engine loop and return a handle to it.
    ///
    /// The loop runs until every sender is gone; dropping the last handle
    /// (with no work in flight) shuts it down.
    pub fn start(config: EngineConfig) -> EngineHandle {
        let channel = MessageChannel::new();
        let pool = match config.dispatch_limit {
            Some(limit) => DispatchPool::bounded(limit),
            None => DispatchPool::unbounded(),
        };
        let ctx = EngineContext {
            registry: ParticipantRegistry::new(),
            sender: channel.sender.clone(),
            error_log: ErrorLog::new(),
            timers: TimerPool::new(),
            events: EventBus::new(config.event_capacity),
            pool,
        };

        let engine = Engine {
            ctx: ctx.clone(),
            dispatcher: Dispatcher::new(ctx.clone()),
            instances: Arc::new(DashMap::new()),
            roots: Arc::new(DashMap::new()),
            results: Arc::new(DashMap::new()),
        };

        let handle = EngineHandle {
            ctx,
            roots: Arc::clone(&engine.roots),
            results: Arc::clone(&engine.results),
        };

        tokio::spawn(engine.run(channel));
        handle
    }

    async fn run(self, mut channel: MessageChannel) {
        tracing::info!("engine loop started");
        while let Some(message) = channel.receiver.recv().await {
            self.handle_message(message).await;
        }
        tracing::info!("engine loop stopped");
    }

    async fn handle_message(&self, message: EngineMessage) {
        tracing::debug!(action = message.action(), fei = message.fei().map(tracing::field::display), "handling message");
        match message {
            EngineMessage::Launch { node, workitem } => self.handle_launch(node, workitem),
            EngineMessage::Dispatch {
                fei,
                participant,
                workitem,
            } => {
                // Stamp the live instance before handing off: a later cancel
                // needs to know a dispatch is in flight, and the `dispatched`
                // notification only comes back once the consume succeeds.
                if let Ok(name) = resolve_participant(participant.as_deref(), &workitem) {
                    if let Some(mut instance) = self.instances.get_mut(&fei) {
                        instance.workitem.participant_name = name;
                        instance.workitem.stamp_dispatched(chrono::Utc::now());
                    }
                }
                if let Err(error) = self
                    .dispatcher
                    .dispatch(fei.clone(), participant, workitem.clone())
                    .await
                {
                    self.ctx.sender.send(EngineMessage::Fail {
                        fei,
                        workitem,
                        kind: FailureKind::Configuration,
                        error: error.to_string(),
                    });
                }
            }
            EngineMessage::DispatchCancel {
                fei,
                flavour,
                workitem,
            } => {
                if let Err(error) = self
                    .dispatcher
                    .dispatch_cancel(fei.clone(), flavour, workitem)
                    .await
                {
                    // The graceful flavour propagates cancel failures; the
                    // reply already went out, so recording is all that's left.
                    self.ctx.error_log.append(ErrorRecord::now(
                        fei,
                        FailureKind::Cancellation,
                        error.to_string(),
                    ));
                }
            }
            EngineMessage::Dispatched {
                fei,
                participant_name,
            } => {
                tracing::debug!(fei = %fei, participant = participant_name.as_str(), "participant accepted workitem");
            }
            EngineMessage::Reply { fei, workitem } => self.handle_reply(fei, workitem),
            EngineMessage::Fail {
                fei,
                workitem,
                kind,
                error,
            } => self.handle_fail(fei, workitem, kind, error),
            EngineMessage::ErrorIntercepted { fei } => self.handle_error_intercepted(fei),
            EngineMessage::Cancel { fei, flavour } => {
                self.cancel_instance(&fei, flavour);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Launch / apply
    // -----------------------------------------------------------------------

    fn handle_launch(&self, node: ExpressionNode, workitem: Workitem) {
        let fei = workitem.fei.clone();
        tracing::info!(process_id = %fei.process_id, root = node.name.as_str(), "process launched");
        self.roots.insert(fei.process_id, fei.clone());
        self.ctx.events.publish(EngineEvent::ProcessLaunched {
            process_id: fei.process_id,
        });
        self.apply(fei, None, node, workitem);
    }

    /// Apply a definition node at `fei`: create the live instance and take
    /// its initial transition.
    fn apply(&self, fei: Fei, parent: Option<Fei>, node: ExpressionNode, workitem: Workitem) {
        let instance = ExpressionInstance::new(fei.clone(), parent, node, workitem.clone());
        self.instances.insert(fei.clone(), instance);
        self.initial_transition(&fei, workitem);
    }

    /// First step of a freshly created instance (including retry attempts).
    fn initial_transition(&self, fei: &Fei, workitem: Workitem) {
        let Some(instance) = self.instances.get(fei).map(|i| i.value().clone()) else {
            return;
        };

        if instance.node.is_sequence_kind() {
            let evaluator = ConditionEvaluator::new();
            let mut workitem = workitem;
            match cursor::next_step(&instance.node, None, &mut workitem, &evaluator) {
                CursorOutcome::Apply(index) => self.apply_child(&instance, index, workitem),
                CursorOutcome::ReplyToParent => self.finish(fei.clone(), workitem),
            }
        } else if let Some(name) = instance.node.participant_ref() {
            self.ctx.sender.send(EngineMessage::Dispatch {
                fei: fei.clone(),
                participant: Some(name.to_string()),
                workitem,
            });
        } else if instance.node.is_command() {
            // A command applied outside any cursor has no position to steer;
            // it replies immediately.
            self.finish(fei.clone(), workitem);
        } else {
            self.ctx.sender.send(EngineMessage::Fail {
                fei: fei.clone(),
                workitem,
                kind: FailureKind::Configuration,
                error: format!("unknown expression '{}'", instance.node.name),
            });
        }
    }

    /// Apply one child of a cursor instance.
    fn apply_child(&self, parent: &ExpressionInstance, index: usize, workitem: Workitem) {
        let node = parent.node.children[index].clone();
        let child_fei = parent.fei.child(index);
        let workitem = workitem.readdress(child_fei.clone());
        tracing::debug!(parent = %parent.fei, child = %child_fei, node = node.name.as_str(), "applying child");
        self.apply(child_fei, Some(parent.fei.clone()), node, workitem);
    }

    // -----------------------------------------------------------------------
    // Replies
    // -----------------------------------------------------------------------

    fn handle_reply(&self, fei: Fei, workitem: Workitem) {
        if self.instances.contains_key(&fei) {
            self.finish(fei, workitem);
        } else {
            // A cancelled or superseded attempt completing late.
            tracing::debug!(fei = %fei, "discarding stale reply");
        }
    }

    /// Complete the instance at `fei` with `workitem` and advance its parent.
    fn finish(&self, fei: Fei, workitem: Workitem) {
        let Some((_, instance)) = self.instances.remove(&fei) else {
            return;
        };
        let cancelled_timers = self.ctx.timers.cancel_for(&fei);
        if cancelled_timers > 0 {
            self.ctx.events.publish(EngineEvent::TimersCancelled {
                fei: fei.clone(),
                count: cancelled_timers,
            });
        }

        match instance.parent {
            Some(parent_fei) => self.advance_parent(parent_fei, fei.child_index, workitem),
            None => {
                tracing::info!(process_id = %fei.process_id, "process completed");
                self.roots.remove(&fei.process_id);
                self.results.insert(fei.process_id, workitem);
                self.ctx.events.publish(EngineEvent::ProcessCompleted {
                    process_id: fei.process_id,
                });
            }
        }
    }

    /// A child at `reply_index` finished; move the parent cursor.
    fn advance_parent(&self, parent_fei: Fei, reply_index: usize, mut workitem: Workitem) {
        let Some(parent) = self.instances.get(&parent_fei).map(|i| i.value().clone()) else {
            tracing::debug!(parent = %parent_fei, "parent gone, dropping child reply");
            return;
        };

        let evaluator = ConditionEvaluator::new();
        workitem = workitem.readdress(parent_fei.clone());
        match cursor::next_step(&parent.node, Some(reply_index), &mut workitem, &evaluator) {
            CursorOutcome::Apply(index) => self.apply_child(&parent, index, workitem),
            CursorOutcome::ReplyToParent => self.finish(parent_fei, workitem),
        }
    }

    // -----------------------------------------------------------------------
    // Error & retry manager
    // -----------------------------------------------------------------------

    /// Route a failure: record it, then consume the instance's next
    /// recovery clause.
    fn handle_fail(&self, fei: Fei, workitem: Workitem, kind: FailureKind, error: String) {
        // Record before any recovery decision; the log keeps every
        // occurrence whatever happens next.
        self.ctx
            .error_log
            .append(ErrorRecord::now(fei.clone(), kind, error.clone()));
        if kind == FailureKind::Participant {
            self.ctx.events.publish(EngineEvent::ParticipantFailed {
                fei: fei.clone(),
                error: error.clone(),
            });
        }

        let Some(mut instance) = self.instances.get_mut(&fei) else {
            tracing::debug!(fei = %fei, "failure for an instance no longer live");
            return;
        };
        instance.workitem = workitem;

        if kind != FailureKind::Participant {
            // Configuration and cancellation failures are not recoverable
            // via on_error.
            self.stand(&mut instance, error);
            return;
        }

        match instance.next_clause() {
            None => self.stand(&mut instance, error),
            Some(Err(clause_error)) => {
                let message = clause_error.to_string();
                drop(instance);
                self.ctx.error_log.append(ErrorRecord::now(
                    fei.clone(),
                    FailureKind::Configuration,
                    message.clone(),
                ));
                if let Some(mut instance) = self.instances.get_mut(&fei) {
                    self.stand(&mut instance, message);
                }
            }
            Some(Ok(clause)) => match clause.command {
                RecoveryCommand::Retry => {
                    instance.state = InstanceState::Failed;
                    match clause.delay {
                        Some(delay) => {
                            drop(instance);
                            let fire_at = chrono::Utc::now()
                                + chrono::Duration::from_std(delay)
                                    .unwrap_or_else(|_| chrono::Duration::zero());
                            self.ctx.timers.schedule(
                                fei.clone(),
                                delay,
                                EngineMessage::ErrorIntercepted { fei: fei.clone() },
                                self.ctx.sender.clone(),
                            );
                            self.ctx
                                .events
                                .publish(EngineEvent::TimerScheduled { fei, fire_at });
                        }
                        None => {
                            drop(instance);
                            self.ctx
                                .sender
                                .send(EngineMessage::ErrorIntercepted { fei });
                        }
                    }
                }
                RecoveryCommand::Pass => {
                    let workitem = instance.workitem.clone();
                    drop(instance);
                    tracing::info!(fei = %fei, "failure passed, continuing flow");
                    self.ctx
                        .events
                        .publish(EngineEvent::PassApplied { fei: fei.clone() });
                    self.ctx.sender.send(EngineMessage::Reply { fei, workitem });
                }
            },
        }
    }

    /// Park an instance as a standing error.
    fn stand(&self, instance: &mut ExpressionInstance, error: String) {
        tracing::warn!(fei = %instance.fei, error = error.as_str(), "standing error, awaiting intervention");
        instance.state = InstanceState::Failed;
        self.ctx.events.publish(EngineEvent::StandingError {
            fei: instance.fei.clone(),
            error,
        });
    }

    /// A retry is due: cancel the failed attempt and re-apply the node as a
    /// brand-new instance, inheriting the consumed-clause count.
    fn handle_error_intercepted(&self, fei: Fei) {
        let Some((_, old)) = self.instances.remove(&fei) else {
            tracing::debug!(fei = %fei, "retry due for an instance no longer live");
            return;
        };
        self.ctx.timers.cancel_for(&fei);
        self.ctx
            .events
            .publish(EngineEvent::RetryAttempted { fei: fei.clone() });

        // Gracefully cancel whatever the failed attempt left in flight. Its
        // completion reply will be stale and discarded.
        if old.node.participant_ref().is_some() {
            self.ctx.sender.send(EngineMessage::DispatchCancel {
                fei: fei.clone(),
                flavour: CancelFlavour::Cancel,
                workitem: old.workitem.clone(),
            });
        } else {
            self.cancel_children(&fei, CancelFlavour::Cancel);
        }

        let new_fei = fei.reissue();
        let workitem = old.workitem.clone().readdress(new_fei.clone());
        tracing::info!(failed = %fei, attempt = %new_fei, "retrying");
        let attempt = old.reissue(new_fei.clone(), workitem.clone());
        self.instances.insert(new_fei.clone(), attempt);
        self.initial_transition(&new_fei, workitem);
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Tear down an instance: its timers, its subtree and any in-flight
    /// dispatch. Does not reply to the parent.
    fn cancel_instance(&self, fei: &Fei, flavour: CancelFlavour) {
        let Some((_, instance)) = self.instances.remove(fei) else {
            tracing::debug!(fei = %fei, "cancel for an instance no longer live");
            return;
        };

        let cancelled_timers = self.ctx.timers.cancel_for(fei);
        if cancelled_timers > 0 {
            self.ctx.events.publish(EngineEvent::TimersCancelled {
                fei: fei.clone(),
                count: cancelled_timers,
            });
        }

        self.cancel_children(fei, flavour);

        if instance.node.participant_ref().is_some() && instance.workitem.dispatched_at.is_some() {
            self.ctx.sender.send(EngineMessage::DispatchCancel {
                fei: fei.clone(),
                flavour,
                workitem: instance.workitem.clone(),
            });
        }

        if instance.parent.is_none() {
            self.roots.remove(&fei.process_id);
        }

        tracing::info!(fei = %fei, ?flavour, "instance cancelled");
        self.ctx
            .events
            .publish(EngineEvent::InstanceCancelled { fei: fei.clone() });
    }

    /// Cancel every live child of `fei`, transitively.
    fn cancel_children(&self, fei: &Fei, flavour: CancelFlavour) {
        let children: Vec<Fei> = self
            .instances
            .iter()
            .filter(|entry| entry.value().parent.as_ref() == Some(fei))
            .map(|entry| entry.key().clone())
            .collect();
        for child in children {
            self.cancel_instance(&child, flavour);
        }
    }
}

// ---------------------------------------------------------------------------
// EngineHandle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running engine.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    ctx: EngineContext,
    roots: Arc<DashMap<Uuid, Fei>>,
    results: Arc<DashMap<Uuid, Workitem>>,
}

impl EngineHandle {
    /// Register a participant.
    pub fn register(
        &self,
        name: impl Into<String>,
        participant: Arc<dyn crate::participant::Participant>,
    ) {
        self.ctx.registry.register(name, participant);
    }

    /// Launch a process instance from a definition tree. Returns the process
    /// id; completion is observable via [`EngineHandle::wait`] or the event
    /// bus.
    pub fn launch(&self, node: ExpressionNode, fields: HashMap<String, Value>) -> Uuid {
        let process_id = Uuid::now_v7();
        let fei = Fei::root(process_id);
        let workitem = Workitem::new(fei, fields);
        self.ctx.sender.send(EngineMessage::Launch { node, workitem });
        process_id
    }

    /// Send a reply on behalf of a participant. The workitem's fei says
    /// which instance completed.
    pub fn reply(&self, workitem: Workitem) {
        self.ctx.sender.send(EngineMessage::Reply {
            fei: workitem.fei.clone(),
            workitem,
        });
    }

    /// Enqueue a raw engine message.
    pub fn send(&self, message: EngineMessage) {
        self.ctx.sender.send(message);
    }

    /// Cancel a whole process instance.
    pub fn cancel_process(&self, process_id: Uuid, flavour: CancelFlavour) {
        if let Some(root) = self.roots.get(&process_id).map(|r| r.value().clone()) {
            self.ctx.sender.send(EngineMessage::Cancel { fei: root, flavour });
        } else {
            tracing::debug!(%process_id, "cancel for unknown or completed process");
        }
    }

    /// Subscribe to engine lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    /// The shared error log.
    pub fn error_log(&self) -> &ErrorLog {
        &self.ctx.error_log
    }

    /// The participant registry.
    pub fn registry(&self) -> &ParticipantRegistry {
        &self.ctx.registry
    }

    /// Wait for a process instance to complete and return its final
    /// workitem. Never resolves for a process parked on a standing error;
    /// pair with a timeout when that is possible.
    pub async fn wait(&self, process_id: Uuid) -> Workitem {
        let mut events = self.ctx.events.subscribe();
        loop {
            if let Some(result) = self.results.get(&process_id) {
                return result.clone();
            }
            match events.recv().await {
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    // Unreachable while this handle is alive; spin down
                    // politely anyway.
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
