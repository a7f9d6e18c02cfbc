//! In-process fakes for the backend and duplex transport seams.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{MessageId, PeerId, PresenceAnnouncement},
    protocol::{InboundFrame, MessageEnvelope, OutboundFrame, UnreadCounts},
};
use tokio::sync::mpsc;

use crate::{
    backend::PresenceBackend,
    error::SyncError,
    transport::{ChannelConnector, ChannelLink, LinkEvent},
};

pub fn peer(name: &str) -> PeerId {
    PeerId::from(name)
}

pub fn at_second(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second)
        .single()
        .expect("valid timestamp")
}

pub fn envelope(id: &str, from: &str, to: &str, second: u32) -> MessageEnvelope {
    MessageEnvelope {
        id: MessageId::from(id),
        from: peer(from),
        to: peer(to),
        body: format!("body of {id}"),
        timestamp: at_second(second),
    }
}

fn backend_failure() -> SyncError {
    SyncError::Backend {
        status: 503,
        message: "unavailable".into(),
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pub presence: Mutex<HashMap<PeerId, bool>>,
    pub presence_delay: Mutex<Duration>,
    pub presence_calls: AtomicUsize,
    pub online_peers: Mutex<Vec<PeerId>>,
    pub online_list_delay: Mutex<Duration>,
    pub online_list_calls: AtomicUsize,
    pub unread: Mutex<UnreadCounts>,
    pub unread_delay: Mutex<Duration>,
    pub unread_calls: AtomicUsize,
    pub fail_unread: AtomicBool,
    pub messages: Mutex<Vec<MessageEnvelope>>,
    pub message_calls: AtomicUsize,
    pub since_cursors: Mutex<Vec<Option<DateTime<Utc>>>>,
    pub mark_read_calls: Mutex<Vec<(PeerId, PeerId)>>,
    pub fail_mark_read: AtomicBool,
    pub announcements: Mutex<Vec<(PeerId, PresenceAnnouncement)>>,
    pub fail_announce: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_presence(&self, peer_id: &str, online: bool) {
        self.presence.lock().unwrap().insert(peer(peer_id), online);
    }

    pub fn set_unread(&self, counts: &[(&str, u32)]) {
        *self.unread.lock().unwrap() = counts
            .iter()
            .map(|(peer_id, count)| (peer(peer_id), *count))
            .collect();
    }

    pub fn announcements_of(&self, kind: PresenceAnnouncement) -> usize {
        self.announcements
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, announcement)| *announcement == kind)
            .count()
    }

    async fn pause(delay: &Mutex<Duration>) {
        let delay = *delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PresenceBackend for FakeBackend {
    async fn fetch_presence(&self, peer_id: &PeerId) -> Result<bool, SyncError> {
        self.presence_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.presence_delay).await;
        Ok(self
            .presence
            .lock()
            .unwrap()
            .get(peer_id)
            .copied()
            .unwrap_or(false))
    }

    async fn fetch_online_peers(&self) -> Result<Vec<PeerId>, SyncError> {
        self.online_list_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.online_list_delay).await;
        Ok(self.online_peers.lock().unwrap().clone())
    }

    async fn fetch_unread_counts(&self, _identity: &PeerId) -> Result<UnreadCounts, SyncError> {
        self.unread_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.unread_delay).await;
        if self.fail_unread.load(Ordering::SeqCst) {
            return Err(backend_failure());
        }
        Ok(self.unread.lock().unwrap().clone())
    }

    async fn fetch_messages_since(
        &self,
        _identity: &PeerId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageEnvelope>, SyncError> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        self.since_cursors.lock().unwrap().push(since);
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|message| since.map_or(true, |since| message.timestamp > since))
            .cloned()
            .collect())
    }

    async fn mark_read(&self, reader: &PeerId, sender: &PeerId) -> Result<(), SyncError> {
        self.mark_read_calls
            .lock()
            .unwrap()
            .push((reader.clone(), sender.clone()));
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(backend_failure());
        }
        Ok(())
    }

    async fn announce(
        &self,
        identity: &PeerId,
        announcement: PresenceAnnouncement,
    ) -> Result<(), SyncError> {
        self.announcements
            .lock()
            .unwrap()
            .push((identity.clone(), announcement));
        if self.fail_announce.load(Ordering::SeqCst) {
            return Err(backend_failure());
        }
        Ok(())
    }
}

struct ServerEnd {
    identity: PeerId,
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

/// Hands out in-memory links; the test drives the server end.
#[derive(Default)]
pub struct FakeConnector {
    pub attempts: AtomicUsize,
    pub refuse: AtomicBool,
    pub hang: AtomicBool,
    links: Mutex<Vec<ServerEnd>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing() -> Arc<Self> {
        let connector = Self::default();
        connector.refuse.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }

    /// Every open never completes, like a server that accepts TCP but never
    /// finishes the upgrade.
    pub fn hanging() -> Arc<Self> {
        let connector = Self::default();
        connector.hang.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn open_links(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn last_identity(&self) -> Option<PeerId> {
        self.links
            .lock()
            .unwrap()
            .last()
            .map(|end| end.identity.clone())
    }

    pub fn push(&self, frame: &InboundFrame) {
        let text = serde_json::to_string(frame).expect("encode frame");
        self.push_raw(&text);
    }

    pub fn push_raw(&self, text: &str) {
        let links = self.links.lock().unwrap();
        let end = links.last().expect("no open link");
        end.to_client
            .send(LinkEvent::Frame(text.to_string()))
            .expect("client side dropped");
    }

    /// Simulates the server dropping the current link.
    pub fn drop_link(&self, reason: &str) {
        let end = self.links.lock().unwrap().pop().expect("no open link");
        let _ = end.to_client.send(LinkEvent::Closed {
            reason: Some(reason.to_string()),
        });
    }

    pub fn sent_frames(&self) -> Vec<OutboundFrame> {
        let mut links = self.links.lock().unwrap();
        let mut frames = Vec::new();
        for end in links.iter_mut() {
            while let Ok(text) = end.from_client.try_recv() {
                frames.push(serde_json::from_str(&text).expect("decode outbound"));
            }
        }
        frames
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn open(&self, identity: &PeerId) -> Result<ChannelLink, SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::Connection("connection refused".into()));
        }
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(ServerEnd {
            identity: identity.clone(),
            to_client,
            from_client,
        });
        Ok(ChannelLink { outbound, inbound })
    }
}

/// Polls `check` until it holds or the deadline passes.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached: {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
