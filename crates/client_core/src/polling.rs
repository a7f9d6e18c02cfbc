use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::PeerId;
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    backend::PresenceBackend,
    channel::ConnectionState,
    dispatcher::EventDispatcher,
    error::with_deadline,
    task::ScheduledTask,
    unread::UnreadLedger,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    SkippedConnected,
    SkippedInFlight,
    Reconciled { total: u64 },
    Failed,
}

/// Clears the in-flight flag even if the cycle is cancelled mid-request.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PollingEngine {
    backend: Arc<dyn PresenceBackend>,
    dispatcher: Arc<EventDispatcher>,
    ledger: Arc<UnreadLedger>,
    connection: watch::Receiver<ConnectionState>,
    interval: Duration,
    request_timeout: Duration,
    in_flight: AtomicBool,
    since: Mutex<Option<DateTime<Utc>>>,
}

impl PollingEngine {
    pub fn new(
        backend: Arc<dyn PresenceBackend>,
        dispatcher: Arc<EventDispatcher>,
        ledger: Arc<UnreadLedger>,
        connection: watch::Receiver<ConnectionState>,
        interval: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            dispatcher,
            ledger,
            connection,
            interval,
            request_timeout,
            in_flight: AtomicBool::new(false),
            since: Mutex::new(None),
        })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        *self.since.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset_cursor(&self) {
        *self.since.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn advance_cursor(&self, newest: DateTime<Utc>) {
        let mut since = self.since.lock().unwrap_or_else(PoisonError::into_inner);
        if since.map_or(true, |current| newest > current) {
            *since = Some(newest);
        }
    }

    pub async fn poll_once(&self, identity: &PeerId) -> PollOutcome {
        if *self.connection.borrow() == ConnectionState::Connected {
            return PollOutcome::SkippedConnected;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(identity = %identity, "poll: previous cycle still in flight, dropping tick");
            return PollOutcome::SkippedInFlight;
        }
        let _in_flight = InFlight(&self.in_flight);

        let since = self.cursor();
        let deltas = with_deadline(
            "message poll",
            self.request_timeout,
            self.backend.fetch_messages_since(identity, since),
        )
        .await;
        match deltas {
            Ok(messages) => {
                debug!(identity = %identity, count = messages.len(), "poll: message deltas fetched");
                for envelope in messages {
                    self.advance_cursor(envelope.timestamp);
                    let disposition = self.ledger.record_message(&envelope, Some(identity));
                    self.dispatcher.publish_message(envelope, disposition);
                }
            }
            Err(err) => warn!(identity = %identity, error = %err, "poll: message delta fetch failed"),
        }

        // Taken after deltas are applied so they are not mistaken for newer writes.
        let issued = self.ledger.begin_reconcile();
        let snapshot = with_deadline(
            "unread poll",
            self.request_timeout,
            self.backend.fetch_unread_counts(identity),
        )
        .await;
        match snapshot {
            Ok(counts) => {
                let reconciliation = self.ledger.reconcile(&counts, issued);
                let total = reconciliation.total;
                self.dispatcher.publish_reconciliation(reconciliation);
                PollOutcome::Reconciled { total }
            }
            Err(err) => {
                warn!(identity = %identity, error = %err, "poll: unread fetch failed, keeping last known counts");
                PollOutcome::Failed
            }
        }
    }

    /// Overlapping cycles drop out on the in-flight flag. Dropping the
    /// returned task cancels pending cycles.
    pub fn spawn(self: &Arc<Self>, identity: PeerId) -> ScheduledTask {
        let engine = Arc::clone(self);
        ScheduledTask::spawn("poll", async move {
            let mut ticker = interval_at(Instant::now() + engine.interval, engine.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cycles = JoinSet::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let engine = Arc::clone(&engine);
                        let identity = identity.clone();
                        cycles.spawn(async move { engine.poll_once(&identity).await });
                    }
                    Some(finished) = cycles.join_next() => {
                        if let Ok(outcome) = finished {
                            debug!(?outcome, "poll: cycle finished");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/polling_tests.rs"]
mod tests;
