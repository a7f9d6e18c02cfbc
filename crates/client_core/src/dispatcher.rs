//! Typed fan-out of synchronization facts to UI-facing consumers.
//!
//! Callback subscribers run synchronously inside [`EventDispatcher::publish`];
//! a panicking subscriber is logged and skipped so the others still receive
//! the fact. Async consumers can take a broadcast receiver instead.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
};

use shared::{domain::PeerId, protocol::MessageEnvelope};
use tokio::sync::broadcast;
use tracing::warn;

use crate::unread::{MessageDisposition, Reconciliation, UnreadDelta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected { identity: PeerId },
    Disconnected { reason: Option<String> },
    ReconnectExhausted { attempts: u32 },
    PresenceChanged { peer_id: PeerId, online: bool },
    MessageReceived(MessageEnvelope),
    UnreadUpdated { peer_id: PeerId, count: u32, total: u64 },
    UnreadReconciled { total: u64 },
    TypingChanged { peer_id: PeerId, is_typing: bool },
    OnlineCountChanged { count: u64 },
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, Listener>>,
}

pub struct EventDispatcher {
    listeners: Arc<Listeners>,
    stream: broadcast::Sender<SyncEvent>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(1024);
        Self {
            listeners: Arc::new(Listeners {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(BTreeMap::new()),
            }),
            stream,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn subscribe_stream(&self) -> broadcast::Receiver<SyncEvent> {
        self.stream.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, event: SyncEvent) {
        // Snapshot so listeners may subscribe or unsubscribe re-entrantly.
        let listeners: Vec<(u64, Listener)> = self
            .listeners
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(subscriber = id, ?event, "dispatch: subscriber panicked");
            }
        }

        let _ = self.stream.send(event);
    }

    pub(crate) fn publish_delta(&self, delta: UnreadDelta) {
        self.publish(SyncEvent::UnreadUpdated {
            peer_id: delta.peer_id,
            count: delta.count,
            total: delta.total,
        });
    }

    pub(crate) fn publish_message(&self, envelope: MessageEnvelope, disposition: MessageDisposition) {
        match disposition {
            MessageDisposition::Duplicate => {}
            MessageDisposition::Uncounted => self.publish(SyncEvent::MessageReceived(envelope)),
            MessageDisposition::Counted(delta) => {
                self.publish(SyncEvent::MessageReceived(envelope));
                self.publish_delta(delta);
            }
        }
    }

    pub(crate) fn publish_reconciliation(&self, reconciliation: Reconciliation) {
        for delta in reconciliation.changed {
            self.publish_delta(delta);
        }
        self.publish(SyncEvent::UnreadReconciled {
            total: reconciliation.total,
        });
    }
}

/// Handle returned by [`EventDispatcher::subscribe`]. Dropping it keeps the
/// listener registered; call [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
