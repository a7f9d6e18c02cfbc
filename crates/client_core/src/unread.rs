use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, PeerId},
    protocol::{MessageEnvelope, UnreadCounts},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadDelta {
    pub peer_id: PeerId,
    pub count: u32,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Already seen through another path.
    Duplicate,
    /// First sighting, but authored locally or older than the read mark.
    Uncounted,
    Counted(UnreadDelta),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reconciliation {
    pub changed: Vec<UnreadDelta>,
    pub total: u64,
}

/// Bounded memory of delivered message ids; oldest ids are forgotten first.
struct MessageDedup {
    capacity: usize,
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl MessageDedup {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, id: &MessageId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

struct LedgerState {
    counts: HashMap<PeerId, u32>,
    last_write: HashMap<PeerId, u64>,
    read_marks: HashMap<PeerId, DateTime<Utc>>,
    latest_seen: HashMap<PeerId, DateTime<Utc>>,
    dedup: MessageDedup,
    next_seq: u64,
}

impl LedgerState {
    fn total(&self) -> u64 {
        self.counts.values().map(|count| u64::from(*count)).sum()
    }

    fn write(&mut self, peer_id: &PeerId, count: u32) -> UnreadDelta {
        if count == 0 {
            self.counts.remove(peer_id);
        } else {
            self.counts.insert(peer_id.clone(), count);
        }
        self.last_write.insert(peer_id.clone(), self.next_seq);
        self.next_seq += 1;
        UnreadDelta {
            peer_id: peer_id.clone(),
            count,
            total: self.total(),
        }
    }

    fn written_since(&self, peer_id: &PeerId, issued: u64) -> bool {
        self.last_write
            .get(peer_id)
            .is_some_and(|seq| *seq >= issued)
    }
}

pub struct UnreadLedger {
    state: Mutex<LedgerState>,
}

impl UnreadLedger {
    pub fn new(dedup_capacity: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                counts: HashMap::new(),
                last_write: HashMap::new(),
                read_marks: HashMap::new(),
                latest_seen: HashMap::new(),
                dedup: MessageDedup::new(dedup_capacity),
                next_seq: 0,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_message(
        &self,
        envelope: &MessageEnvelope,
        identity: Option<&PeerId>,
    ) -> MessageDisposition {
        let mut state = self.lock_state();
        if !state.dedup.insert(&envelope.id) {
            debug!(message_id = %envelope.id, "unread: duplicate message ignored");
            return MessageDisposition::Duplicate;
        }

        if identity == Some(&envelope.from) {
            return MessageDisposition::Uncounted;
        }

        let latest = state
            .latest_seen
            .entry(envelope.from.clone())
            .or_insert(envelope.timestamp);
        if envelope.timestamp > *latest {
            *latest = envelope.timestamp;
        }

        if let Some(read_mark) = state.read_marks.get(&envelope.from) {
            if envelope.timestamp <= *read_mark {
                debug!(message_id = %envelope.id, "unread: message predates read mark");
                return MessageDisposition::Uncounted;
            }
        }

        let count = state
            .counts
            .get(&envelope.from)
            .copied()
            .unwrap_or(0)
            .saturating_add(1);
        MessageDisposition::Counted(state.write(&envelope.from, count))
    }

    pub fn set_count(&self, peer_id: &PeerId, count: u32) -> UnreadDelta {
        self.lock_state().write(peer_id, count)
    }

    pub fn mark_read(&self, peer_id: &PeerId) -> UnreadDelta {
        let mut state = self.lock_state();
        if let Some(latest) = state.latest_seen.get(peer_id).copied() {
            state.read_marks.insert(peer_id.clone(), latest);
        }
        state.write(peer_id, 0)
    }

    pub fn begin_reconcile(&self) -> u64 {
        self.lock_state().next_seq
    }

    /// Replaces local counts with `snapshot`. Peers written after `issued`
    /// keep their local value; peers absent from the snapshot drop to zero.
    pub fn reconcile(&self, snapshot: &UnreadCounts, issued: u64) -> Reconciliation {
        let mut state = self.lock_state();
        let mut peers: HashSet<PeerId> = state.counts.keys().cloned().collect();
        peers.extend(snapshot.keys().cloned());

        let mut changed = Vec::new();
        for peer_id in peers {
            if state.written_since(&peer_id, issued) {
                continue;
            }
            let local = state.counts.get(&peer_id).copied().unwrap_or(0);
            let remote = snapshot.get(&peer_id).copied().unwrap_or(0);
            if local != remote {
                changed.push(state.write(&peer_id, remote));
            }
        }

        let total = state.total();
        for delta in &mut changed {
            delta.total = total;
        }
        changed.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        Reconciliation { changed, total }
    }

    pub fn count(&self, peer_id: &PeerId) -> u32 {
        self.lock_state().counts.get(peer_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.lock_state().total()
    }

    pub fn counts(&self) -> UnreadCounts {
        self.lock_state().counts.clone()
    }

    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.counts.clear();
        state.read_marks.clear();
        state.latest_seen.clear();
        state.dedup.clear();
        state.last_write.clear();
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
