//! Session registry and broadcaster
//!
//! The [`Hub`] is the process-wide set of live sessions. Each session
//! registers the sending half of its [`Outbox`]; the hub never touches
//! sockets. Delivery is a non-blocking push onto that queue, so a slow or
//! dead peer cannot stall fan-out to the others. A peer whose backlog is
//! over budget is skipped and its session tears itself down.
//!
//! # Example
//!
//! ```
//! use hubsock::outbox::outbox;
//! use hubsock::{Hub, Message};
//!
//! let hub = Hub::new();
//!
//! let (tx1, mut rx1) = outbox(1024 * 1024);
//! let (tx2, mut rx2) = outbox(1024 * 1024);
//! let alice = hub.register(tx1);
//! let _bob = hub.register(tx2);
//!
//! // Alice speaks, everyone else hears it
//! let result = hub.broadcast_text("hello", Some(alice));
//! assert_eq!(result.count(), 1);
//! assert!(rx1.try_recv().is_none());
//! assert_eq!(rx2.try_recv(), Some(Message::text("hello")));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use crate::outbox::{Outbox, PushError};
use crate::protocol::Message;

/// Unique identifier for a session
///
/// Sessions are identified by a dense, atomically-allocated ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Get the raw ID value
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a broadcast or unicast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastResult {
    /// Message was queued for N sessions
    Delivered(usize),
    /// Nobody was there to receive it
    NoRecipients,
}

impl BroadcastResult {
    /// Get the number of sessions that received the message
    #[inline]
    pub fn count(&self) -> usize {
        match self {
            BroadcastResult::Delivered(n) => *n,
            BroadcastResult::NoRecipients => 0,
        }
    }
}

/// Registry of live sessions
///
/// Shared by the acceptor and every session through an `Arc`. Membership
/// changes take the write lock briefly; a broadcast copies the membership
/// under the read lock and sends after releasing it, so sessions may come
/// and go while a broadcast is in flight.
pub struct Hub {
    sessions: RwLock<HashMap<SessionId, Outbox>>,
    next_session_id: AtomicU64,
    messages_published: AtomicU64,
}

impl Hub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            messages_published: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Register a session's outbound queue and return its ID
    pub fn register(&self, outbox: Outbox) -> SessionId {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.write().insert(id, outbox);
        id
    }

    /// Remove a session; returns false if it was not registered
    pub fn unregister(&self, id: SessionId) -> bool {
        self.sessions.write().remove(&id).is_some()
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Send a message to every session except `exclude`
    ///
    /// Each send is independent: a session whose queue is gone or over
    /// budget is skipped and the rest still receive the message.
    pub fn broadcast(&self, message: Message, exclude: Option<SessionId>) -> BroadcastResult {
        let targets: Vec<(SessionId, Outbox)> = self
            .sessions
            .read()
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(id, outbox)| (*id, outbox.clone()))
            .collect();

        self.messages_published.fetch_add(1, Ordering::Relaxed);

        let mut sent = 0;
        for (id, outbox) in targets {
            // Clone is O(1) for Message because it uses Bytes internally
            if deliver(id, &outbox, message.clone()) {
                sent += 1;
            }
        }

        if sent > 0 {
            BroadcastResult::Delivered(sent)
        } else {
            BroadcastResult::NoRecipients
        }
    }

    /// Broadcast a text message to every session except `exclude`
    pub fn broadcast_text(
        &self,
        text: impl Into<String>,
        exclude: Option<SessionId>,
    ) -> BroadcastResult {
        self.broadcast(Message::text(text), exclude)
    }

    /// Broadcast a binary message to every session except `exclude`
    pub fn broadcast_binary(
        &self,
        payload: impl Into<Bytes>,
        exclude: Option<SessionId>,
    ) -> BroadcastResult {
        self.broadcast(Message::binary(payload), exclude)
    }

    /// Send a message to a single session
    pub fn send_to(&self, id: SessionId, message: Message) -> BroadcastResult {
        let outbox = self.sessions.read().get(&id).cloned();

        self.messages_published.fetch_add(1, Ordering::Relaxed);

        match outbox {
            Some(outbox) if deliver(id, &outbox, message) => BroadcastResult::Delivered(1),
            _ => BroadcastResult::NoRecipients,
        }
    }

    // =========================================================================
    // Query Operations
    // =========================================================================

    /// Get the number of registered sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Check if a session is registered
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    /// Get the total number of broadcasts and unicasts issued
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }
}

fn deliver(id: SessionId, outbox: &Outbox, message: Message) -> bool {
    match outbox.push(message) {
        Ok(()) => true,
        Err(PushError::Overloaded) => {
            tracing::debug!(session = %id, queued = outbox.queued_bytes(), "backlog over budget, skipping");
            false
        }
        Err(PushError::Closed) => {
            tracing::trace!(session = %id, "dropping message for closed session");
            false
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Routing policy for complete inbound data messages
///
/// `on_message` is called once per text or binary message, after
/// reassembly, decompression and UTF-8 validation. Control frames never
/// reach the handler.
pub trait MessageHandler: Send + Sync + 'static {
    /// A complete message arrived from `from`
    fn on_message(&self, hub: &Hub, from: SessionId, message: Message);

    /// A session finished its handshake and joined the hub
    fn on_open(&self, _hub: &Hub, _id: SessionId) {}

    /// A session left the hub
    fn on_close(&self, _hub: &Hub, _id: SessionId) {}
}

impl<F> MessageHandler for F
where
    F: Fn(&Hub, SessionId, Message) + Send + Sync + 'static,
{
    fn on_message(&self, hub: &Hub, from: SessionId, message: Message) {
        self(hub, from, message)
    }
}

/// Relay every message to all sessions except its sender
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOthers;

impl MessageHandler for BroadcastOthers {
    fn on_message(&self, hub: &Hub, from: SessionId, message: Message) {
        let result = hub.broadcast(message, Some(from));
        tracing::trace!(session = %from, recipients = result.count(), "broadcast");
    }
}

/// Send every message back to its sender only
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl MessageHandler for Echo {
    fn on_message(&self, hub: &Hub, from: SessionId, message: Message) {
        hub.send_to(from, message);
    }
}
