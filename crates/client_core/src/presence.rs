//! Peer presence cache with a bounded staleness window.
//!
//! Writes are stamped with a cache-wide sequence number. A fetch remembers
//! the sequence at the moment it was issued and only lands if no newer write
//! for that peer happened while it was in flight, so the most recently
//! completed fact wins rather than the most recently issued request.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::domain::PeerId;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{backend::PresenceBackend, error::with_deadline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEntry {
    pub online: bool,
    pub updated_at: Instant,
    seq: u64,
}

type SharedFetch = Shared<BoxFuture<'static, bool>>;

#[derive(Default)]
struct PresenceState {
    entries: HashMap<PeerId, PresenceEntry>,
    inflight: HashMap<PeerId, SharedFetch>,
    next_seq: u64,
    generation: u64,
}

impl PresenceState {
    fn write(&mut self, peer_id: &PeerId, online: bool) -> PresenceEntry {
        let now = Instant::now();
        let updated_at = match self.entries.get(peer_id) {
            Some(previous) if previous.updated_at >= now => {
                previous.updated_at + Duration::from_nanos(1)
            }
            _ => now,
        };
        let entry = PresenceEntry {
            online,
            updated_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(peer_id.clone(), entry);
        entry
    }

    fn is_newer_than(&self, peer_id: &PeerId, issued: u64) -> bool {
        self.entries
            .get(peer_id)
            .is_some_and(|entry| entry.seq >= issued)
    }
}

struct PresenceInner {
    backend: Arc<dyn PresenceBackend>,
    staleness_window: Duration,
    request_timeout: Duration,
    state: Mutex<PresenceState>,
}

impl PresenceInner {
    fn lock_state(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(self: Arc<Self>, peer_id: PeerId, issued: u64, generation: u64) -> bool {
        debug!(peer_id = %peer_id, "presence: fetching stale entry");
        let result = with_deadline(
            "presence fetch",
            self.request_timeout,
            self.backend.fetch_presence(&peer_id),
        )
        .await;

        let mut state = self.lock_state();
        if state.generation != generation {
            return false;
        }
        state.inflight.remove(&peer_id);

        if state.is_newer_than(&peer_id, issued) {
            return state
                .entries
                .get(&peer_id)
                .is_some_and(|entry| entry.online);
        }

        match result {
            Ok(online) => state.write(&peer_id, online).online,
            Err(err) => {
                warn!(peer_id = %peer_id, error = %err, "presence: fetch failed, reporting offline");
                false
            }
        }
    }
}

#[derive(Clone)]
pub struct PresenceCache {
    inner: Arc<PresenceInner>,
}

impl PresenceCache {
    pub fn new(
        backend: Arc<dyn PresenceBackend>,
        staleness_window: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                backend,
                staleness_window,
                request_timeout,
                state: Mutex::new(PresenceState::default()),
            }),
        }
    }

    pub fn record(&self, peer_id: &PeerId, online: bool) -> PresenceEntry {
        self.inner.lock_state().write(peer_id, online)
    }

    pub fn entry(&self, peer_id: &PeerId) -> Option<PresenceEntry> {
        self.inner.lock_state().entries.get(peer_id).copied()
    }

    pub fn fresh(&self, peer_id: &PeerId) -> Option<bool> {
        self.entry(peer_id)
            .filter(|entry| entry.updated_at.elapsed() < self.inner.staleness_window)
            .map(|entry| entry.online)
    }

    pub async fn is_online(&self, peer_id: &PeerId) -> bool {
        let fetch = {
            let mut state = self.inner.lock_state();
            if let Some(entry) = state.entries.get(peer_id) {
                if entry.updated_at.elapsed() < self.inner.staleness_window {
                    return entry.online;
                }
            }
            match state.inflight.get(peer_id) {
                Some(pending) => pending.clone(),
                None => {
                    let fetch = Arc::clone(&self.inner)
                        .fetch(peer_id.clone(), state.next_seq, state.generation)
                        .boxed()
                        .shared();
                    state.inflight.insert(peer_id.clone(), fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    pub fn begin_snapshot(&self) -> u64 {
        self.inner.lock_state().next_seq
    }

    /// Applies an authoritative list of online peers. Cached peers missing
    /// from the list are marked offline. Entries written after `issued` are
    /// left alone. Returns the peers whose value changed.
    pub fn seed(&self, online_peers: &[PeerId], issued: u64) -> Vec<(PeerId, bool)> {
        let mut state = self.inner.lock_state();
        let mut changes = Vec::new();

        let stale_known: Vec<PeerId> = state
            .entries
            .keys()
            .filter(|peer_id| !online_peers.contains(peer_id))
            .cloned()
            .collect();
        let updates = online_peers
            .iter()
            .map(|peer_id| (peer_id.clone(), true))
            .chain(stale_known.into_iter().map(|peer_id| (peer_id, false)));

        for (peer_id, online) in updates {
            if state.is_newer_than(&peer_id, issued) {
                continue;
            }
            let previous = state.entries.get(&peer_id).map(|entry| entry.online);
            state.write(&peer_id, online);
            if previous != Some(online) {
                changes.push((peer_id, online));
            }
        }
        changes
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock_state();
        state.entries.clear();
        state.inflight.clear();
        state.generation += 1;
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
