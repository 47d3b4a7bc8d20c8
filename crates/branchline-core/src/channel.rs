//! The engine mailbox: an unbounded, single-consumer message channel.
//!
//! All inter-component communication travels as `EngineMessage` values on
//! this channel. The engine loop is the sole consumer, which is what gives
//! messages addressed to the same fei their causal order: one message is
//! consumed and fully handled before the next. Senders are cheap clones and
//! never block.

use branchline_types::message::EngineMessage;
use tokio::sync::mpsc;

/// Cloneable sending half of the engine channel.
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl MessageSender {
    /// Enqueue a message for the engine loop. Never blocks.
    ///
    /// A send after the engine has shut down is dropped with a debug trace;
    /// producers (timers, threaded dispatches) may legitimately outlive the
    /// loop briefly.
    pub fn send(&self, message: EngineMessage) {
        let action = message.action();
        if self.tx.send(message).is_err() {
            tracing::debug!(action, "engine channel closed, message dropped");
        }
    }
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// The paired sender/receiver for one engine instance.
pub struct MessageChannel {
    pub sender: MessageSender,
    pub receiver: mpsc::UnboundedReceiver<EngineMessage>,
}

impl MessageChannel {
    /// Create a fresh channel.
    pub fn new() -> Self {
        let (tx, receiver) = mpsc::unbounded_channel();
        Self {
            sender: MessageSender { tx },
            receiver,
        }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}
