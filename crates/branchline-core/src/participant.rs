//! The participant surface: external handlers the engine dispatches to.
//!
//! `Participant` is object-safe via boxed futures so implementations can be
//! stored behind `Arc<dyn Participant>` in the registry. A participant's
//! threading preference is a registration-time capability descriptor
//! ([`DoNotThread`]), not something probed from call signatures at runtime.

use std::sync::Arc;

use branchline_types::error::ParticipantError;
use branchline_types::fei::Fei;
use branchline_types::message::CancelFlavour;
use branchline_types::workitem::Workitem;
use futures_util::future::BoxFuture;

/// Boxed future returned by participant operations.
pub type ParticipantFuture<'a> = BoxFuture<'a, Result<(), ParticipantError>>;

/// An external handler capable of consuming a workitem and being cancelled.
///
/// `consume` receives an owned workitem (the dispatcher deep-copies before
/// crossing a task boundary). Completion is reported back to the engine out
/// of band, as a `reply` message on the engine channel -- consume returning
/// `Ok` only means the handler accepted the work.
pub trait Participant: Send + Sync {
    /// Accept a workitem. An error here is forwarded to the error & retry
    /// manager as a participant failure.
    fn consume(&self, workitem: Workitem) -> ParticipantFuture<'_>;

    /// Cancel an in-flight workitem. Errors are suppressed (and recorded)
    /// under [`CancelFlavour::Kill`], propagated otherwise.
    fn cancel<'a>(&'a self, fei: &'a Fei, flavour: CancelFlavour) -> ParticipantFuture<'a>;

    /// The participant's threading capability. Defaults to unspecified,
    /// which the dispatcher treats as threadable.
    fn do_not_thread(&self) -> DoNotThread {
        DoNotThread::Unspecified
    }
}

/// Registration-time threading capability of a participant.
#[derive(Clone)]
pub enum DoNotThread {
    /// No preference declared; the dispatcher threads by default.
    Unspecified,
    /// A fixed preference: `true` means consume must run on the engine task.
    Fixed(bool),
    /// A workitem-dependent preference, for handlers that are only
    /// occasionally unsafe to thread.
    PerWorkitem(Arc<dyn Fn(&Workitem) -> bool + Send + Sync>),
}

impl DoNotThread {
    /// Resolve the preference against a concrete workitem.
    ///
    /// Returns `true` when consume must stay on the engine task.
    pub fn decide(&self, workitem: &Workitem) -> bool {
        match self {
            DoNotThread::Unspecified => false,
            DoNotThread::Fixed(value) => *value,
            DoNotThread::PerWorkitem(f) => f(workitem),
        }
    }
}

impl std::fmt::Debug for DoNotThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DoNotThread::Unspecified => f.write_str("Unspecified"),
            DoNotThread::Fixed(v) => write!(f, "Fixed({v})"),
            DoNotThread::PerWorkitem(_) => f.write_str("PerWorkitem(..)"),
        }
    }
}
