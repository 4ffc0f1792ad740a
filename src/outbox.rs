//! Per-session outbound queue
//!
//! An mpsc channel with a byte budget on top. Every producer (the hub's
//! fan-out, the session's own pong and close replies) pushes through an
//! [`Outbox`]; the session's writer drains the [`OutboxReceiver`] and
//! releases the bytes once they have been written to the socket, so a peer
//! that stops reading keeps its backlog counted.
//!
//! A push that would take the backlog past `max_backpressure` is refused and
//! marks the session overloaded. The session watches for that with
//! [`Outbox::overloaded`] and drops the connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::protocol::Message;

/// Why a message could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The session's writer is gone
    Closed,
    /// The backlog budget is exhausted
    Overloaded,
}

struct Shared {
    queued: AtomicUsize,
    limit: usize,
    overloaded: AtomicBool,
    notify: Notify,
}

/// Create a session queue allowing `max_backpressure` bytes of backlog
pub fn outbox(max_backpressure: usize) -> (Outbox, OutboxReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        queued: AtomicUsize::new(0),
        limit: max_backpressure,
        overloaded: AtomicBool::new(false),
        notify: Notify::new(),
    });

    (
        Outbox {
            tx,
            shared: Arc::clone(&shared),
        },
        OutboxReceiver { rx, shared },
    )
}

/// Bytes a message holds against the budget
#[inline]
pub fn cost(message: &Message) -> usize {
    message.as_bytes().len()
}

/// Sending half of a session queue
#[derive(Clone)]
pub struct Outbox {
    tx: UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl Outbox {
    /// Queue a message for the session's writer
    ///
    /// A message is always accepted into an empty backlog, however large.
    /// Close frames bypass the budget.
    pub fn push(&self, message: Message) -> Result<(), PushError> {
        let len = cost(&message);

        if !message.is_close() {
            if self.shared.overloaded.load(Ordering::Acquire) {
                return Err(PushError::Overloaded);
            }

            let before = self.shared.queued.fetch_add(len, Ordering::AcqRel);
            if before > 0 && before + len > self.shared.limit {
                self.shared.queued.fetch_sub(len, Ordering::AcqRel);
                self.shared.overloaded.store(true, Ordering::Release);
                self.shared.notify.notify_one();
                return Err(PushError::Overloaded);
            }
        } else {
            self.shared.queued.fetch_add(len, Ordering::AcqRel);
        }

        self.tx.send(message).map_err(|_| {
            self.shared.queued.fetch_sub(len, Ordering::AcqRel);
            PushError::Closed
        })
    }

    /// Bytes queued or being written
    pub fn queued_bytes(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Whether a push has been refused for exceeding the budget
    pub fn is_overloaded(&self) -> bool {
        self.shared.overloaded.load(Ordering::Acquire)
    }

    /// Resolve once the session is overloaded
    pub async fn overloaded(&self) {
        loop {
            let notified = self.shared.notify.notified();
            if self.is_overloaded() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("queued", &self.queued_bytes())
            .field("limit", &self.shared.limit)
            .field("overloaded", &self.is_overloaded())
            .finish()
    }
}

/// Receiving half of a session queue, owned by the writer
pub struct OutboxReceiver {
    rx: UnboundedReceiver<Message>,
    shared: Arc<Shared>,
}

impl OutboxReceiver {
    /// Wait for the next message; `None` once every [`Outbox`] is dropped
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take a message if one is ready
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Return budget for bytes that reached the socket
    pub fn release(&self, bytes: usize) {
        self.shared.queued.fetch_sub(bytes, Ordering::AcqRel);
    }
}
