//! Every session teardown bumps `epoch`; background work started for an
//! older epoch discards its results.

use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use shared::{
    domain::{PeerId, PresenceAnnouncement},
    protocol::{InboundFrame, MessageEnvelope, OutboundFrame},
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    backend::PresenceBackend,
    config::EngineConfig,
    dispatcher::{EventDispatcher, SyncEvent},
    error::{with_deadline, SyncError},
    heartbeat::spawn_heartbeat,
    presence::PresenceCache,
    reconnect::ReconnectController,
    task::ScheduledTask,
    transport::{ChannelConnector, LinkEvent},
    unread::UnreadLedger,
};

pub const MAX_MESSAGE_CHARS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Default)]
struct ChannelInner {
    identity: Option<PeerId>,
    epoch: u64,
    link_id: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<ScheduledTask>,
    heartbeat: Option<ScheduledTask>,
    reconnect: Option<ScheduledTask>,
    relink_requested: bool,
    exhausted: bool,
}

impl ChannelInner {
    fn reconnect_running(&self) -> bool {
        self.reconnect
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

pub struct DuplexChannel {
    config: EngineConfig,
    connector: Arc<dyn ChannelConnector>,
    backend: Arc<dyn PresenceBackend>,
    dispatcher: Arc<EventDispatcher>,
    presence: PresenceCache,
    ledger: Arc<UnreadLedger>,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<ChannelInner>,
}

pub(crate) fn validate_body(body: &str) -> Result<String, SyncError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidMessage("message cannot be empty".into()));
    }
    let chars = trimmed.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(SyncError::InvalidMessage(format!(
            "message too large: {chars} characters (max {MAX_MESSAGE_CHARS})"
        )));
    }
    Ok(trimmed.to_string())
}

impl DuplexChannel {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn ChannelConnector>,
        backend: Arc<dyn PresenceBackend>,
        dispatcher: Arc<EventDispatcher>,
        presence: PresenceCache,
        ledger: Arc<UnreadLedger>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            connector,
            backend,
            dispatcher,
            presence,
            ledger,
            state,
            inner: Mutex::new(ChannelInner::default()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn identity(&self) -> Option<PeerId> {
        self.inner.lock().await.identity.clone()
    }

    pub async fn is_exhausted(&self) -> bool {
        self.inner.lock().await.exhausted
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "channel: state transition");
        }
    }

    pub async fn connect(self: &Arc<Self>, identity: PeerId) -> Result<(), SyncError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if inner.identity.as_ref() == Some(&identity)
                && self.state() == ConnectionState::Connected
            {
                return Ok(());
            }
            if inner.identity.is_some() && inner.identity.as_ref() != Some(&identity) {
                self.teardown(&mut inner);
            }
            inner.reconnect = None;
            inner.identity = Some(identity.clone());
            inner.exhausted = false;
            inner.epoch
        };

        self.set_state(ConnectionState::Connecting);
        match self.open_link(&identity, epoch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(identity = %identity, error = %err, "channel: connect failed");
                if self.inner.lock().await.epoch == epoch {
                    self.set_state(ConnectionState::Disconnected);
                    self.dispatcher.publish(SyncEvent::Disconnected {
                        reason: Some(err.to_string()),
                    });
                    self.schedule_reconnect(identity, epoch).await;
                }
                Err(err)
            }
        }
    }

    async fn open_link(self: &Arc<Self>, identity: &PeerId, epoch: u64) -> Result<(), SyncError> {
        let link = with_deadline(
            "channel connect",
            self.config.connect_timeout,
            self.connector.open(identity),
        )
        .await?;

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.identity.as_ref() != Some(identity) {
                debug!(identity = %identity, "channel: discarding link for a closed session");
                return Err(SyncError::Connection(
                    "session closed while connecting".into(),
                ));
            }
            inner.link_id += 1;
            let link_id = inner.link_id;
            inner.outbound = Some(link.outbound);
            inner.exhausted = false;
            inner.heartbeat = Some(spawn_heartbeat(
                Arc::clone(&self.backend),
                identity.clone(),
                self.config.heartbeat_interval,
                self.config.request_timeout,
            ));
            inner.reader = Some(ScheduledTask::spawn(
                "channel-reader",
                Arc::clone(self).read_link(link.inbound, identity.clone(), link_id),
            ));
            self.set_state(ConnectionState::Connected);
            self.dispatcher.publish(SyncEvent::Connected {
                identity: identity.clone(),
            });
        }
        info!(identity = %identity, "channel: connected");

        self.announce(identity, PresenceAnnouncement::Online).await;
        self.seed_after_connect(identity).await;
        Ok(())
    }

    async fn announce(&self, identity: &PeerId, announcement: PresenceAnnouncement) {
        let call = self.backend.announce(identity, announcement);
        if let Err(err) = with_deadline("presence announce", self.config.request_timeout, call).await
        {
            warn!(identity = %identity, ?announcement, error = %err, "channel: presence announce failed");
        }
    }

    async fn seed_after_connect(&self, identity: &PeerId) {
        let unread_issued = self.ledger.begin_reconcile();
        let presence_issued = self.presence.begin_snapshot();
        let (counts, online) = tokio::join!(
            with_deadline(
                "unread fetch",
                self.config.request_timeout,
                self.backend.fetch_unread_counts(identity),
            ),
            with_deadline(
                "presence list fetch",
                self.config.request_timeout,
                self.backend.fetch_online_peers(),
            ),
        );

        match counts {
            Ok(counts) => self
                .dispatcher
                .publish_reconciliation(self.ledger.reconcile(&counts, unread_issued)),
            Err(err) => warn!(identity = %identity, error = %err, "channel: initial unread fetch failed"),
        }

        match online {
            Ok(peers) => self.apply_presence_snapshot(&peers, presence_issued),
            Err(err) => warn!(identity = %identity, error = %err, "channel: initial presence fetch failed"),
        }
    }

    fn apply_presence_snapshot(&self, peers: &[PeerId], issued: u64) {
        for (peer_id, online) in self.presence.seed(peers, issued) {
            self.dispatcher
                .publish(SyncEvent::PresenceChanged { peer_id, online });
        }
    }

    async fn read_link(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
        identity: PeerId,
        link_id: u64,
    ) {
        let reason = loop {
            match inbound.recv().await {
                Some(LinkEvent::Frame(text)) => self.handle_frame(&text, &identity),
                Some(LinkEvent::Closed { reason }) => break reason,
                None => break None,
            }
        };
        self.on_link_lost(link_id, reason).await;
    }

    fn handle_frame(&self, text: &str, identity: &PeerId) {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => self.apply_frame(frame, identity),
            Err(err) => {
                let err = SyncError::from(err);
                warn!(error = %err, frame_len = text.len(), "channel: dropping malformed frame");
            }
        }
    }

    fn apply_frame(&self, frame: InboundFrame, identity: &PeerId) {
        match frame {
            InboundFrame::PeerOnline { peer_id } => self.apply_presence(peer_id, true),
            InboundFrame::PeerOffline { peer_id } => self.apply_presence(peer_id, false),
            InboundFrame::NewMessage(envelope) => self.apply_message(envelope, identity),
            InboundFrame::UnreadCountUpdate { peer_id, count } => {
                self.dispatcher
                    .publish_delta(self.ledger.set_count(&peer_id, count));
            }
            InboundFrame::UserTyping { from, is_typing } => {
                self.dispatcher.publish(SyncEvent::TypingChanged {
                    peer_id: from,
                    is_typing,
                });
            }
            InboundFrame::OnlineCountUpdate { count } => {
                self.dispatcher
                    .publish(SyncEvent::OnlineCountChanged { count });
            }
            InboundFrame::OnlineUsersList { users } => {
                let issued = self.presence.begin_snapshot();
                self.apply_presence_snapshot(&users, issued);
            }
            InboundFrame::ConnectionEstablished { sid } => {
                debug!(sid = %sid, "channel: server acknowledged connection");
            }
        }
    }

    fn apply_presence(&self, peer_id: PeerId, online: bool) {
        self.presence.record(&peer_id, online);
        self.dispatcher
            .publish(SyncEvent::PresenceChanged { peer_id, online });
    }

    fn apply_message(&self, envelope: MessageEnvelope, identity: &PeerId) {
        let disposition = self.ledger.record_message(&envelope, Some(identity));
        self.dispatcher.publish_message(envelope, disposition);
    }

    async fn on_link_lost(self: &Arc<Self>, link_id: u64, reason: Option<String>) {
        let (identity, epoch) = {
            let mut inner = self.inner.lock().await;
            if inner.link_id != link_id || inner.outbound.is_none() {
                return;
            }
            inner.outbound = None;
            inner.heartbeat = None;
            inner.relink_requested = true;
            self.set_state(ConnectionState::Disconnected);
            (inner.identity.clone(), inner.epoch)
        };

        warn!(reason = reason.as_deref().unwrap_or("closed"), "channel: link lost");
        self.dispatcher.publish(SyncEvent::Disconnected { reason });
        if let Some(identity) = identity {
            self.schedule_reconnect(identity, epoch).await;
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>, identity: PeerId, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.reconnect_running() {
            return;
        }
        inner.relink_requested = false;
        inner.reconnect = Some(ScheduledTask::spawn(
            "channel-reconnect",
            Arc::clone(self).reconnect_loop(identity, epoch),
        ));
    }

    // Boxed to break the open_link -> read_link -> reconnect_loop future cycle.
    fn reconnect_loop(self: Arc<Self>, identity: PeerId, epoch: u64) -> BoxFuture<'static, ()> {
        async move {
            let mut controller = ReconnectController::new(self.config.reconnect.clone());
            loop {
                let Some(delay) = controller.next_delay() else {
                    {
                        let mut inner = self.inner.lock().await;
                        if inner.epoch != epoch {
                            return;
                        }
                        inner.exhausted = true;
                    }
                    self.set_state(ConnectionState::Disconnected);
                    warn!(
                        identity = %identity,
                        attempts = controller.attempts(),
                        "channel: reconnect attempts exhausted, relying on polling"
                    );
                    self.dispatcher.publish(SyncEvent::ReconnectExhausted {
                        attempts: controller.attempts(),
                    });
                    return;
                };

                self.set_state(ConnectionState::Reconnecting);
                tokio::time::sleep(delay).await;
                {
                    let mut inner = self.inner.lock().await;
                    if inner.epoch != epoch {
                        return;
                    }
                    inner.relink_requested = false;
                }

                self.set_state(ConnectionState::Connecting);
                match self.open_link(&identity, epoch).await {
                    Ok(()) => {
                        let mut inner = self.inner.lock().await;
                        if !inner.relink_requested {
                            info!(identity = %identity, attempts = controller.attempts(), "channel: reconnected");
                            return;
                        }
                        // The fresh link already dropped again; start a new budget.
                        inner.relink_requested = false;
                        controller.reset();
                    }
                    Err(err) => {
                        if self.inner.lock().await.epoch != epoch {
                            return;
                        }
                        warn!(
                            identity = %identity,
                            attempt = controller.attempts(),
                            error = %err,
                            "channel: reconnect attempt failed"
                        );
                    }
                }
            }
        }
        .boxed()
    }

    pub async fn retry(self: &Arc<Self>) -> Result<(), SyncError> {
        let identity = {
            let inner = self.inner.lock().await;
            if inner.reconnect_running() && !inner.exhausted {
                return Ok(());
            }
            inner.identity.clone()
        };
        match identity {
            Some(identity) => self.connect(identity).await,
            None => Err(SyncError::NotConnected),
        }
    }

    pub async fn send(&self, to: PeerId, body: &str) -> Result<MessageEnvelope, SyncError> {
        let body = validate_body(body)?;
        let inner = self.inner.lock().await;
        let (Some(identity), Some(outbound)) = (&inner.identity, &inner.outbound) else {
            return Err(SyncError::NotConnected);
        };
        if self.state() != ConnectionState::Connected {
            return Err(SyncError::NotConnected);
        }

        let envelope = MessageEnvelope::new(identity.clone(), to, body, Utc::now());
        let text = serde_json::to_string(&OutboundFrame::SendMessage(envelope.clone()))?;
        outbound.send(text).map_err(|_| SyncError::NotConnected)?;
        debug!(message_id = %envelope.id, to = %envelope.to, "channel: message sent");
        Ok(envelope)
    }

    pub async fn send_typing(&self, to: PeerId, is_typing: bool) -> Result<(), SyncError> {
        let inner = self.inner.lock().await;
        let Some(identity) = inner.identity.clone() else {
            return Err(SyncError::NotConnected);
        };
        self.send_frame(
            &inner,
            &OutboundFrame::Typing {
                from: identity,
                to,
                is_typing,
            },
        )
    }

    pub async fn request_online_users(&self) -> Result<(), SyncError> {
        let inner = self.inner.lock().await;
        self.send_frame(&inner, &OutboundFrame::GetOnlineUsers)
    }

    fn send_frame(&self, inner: &ChannelInner, frame: &OutboundFrame) -> Result<(), SyncError> {
        let Some(outbound) = &inner.outbound else {
            return Err(SyncError::NotConnected);
        };
        if self.state() != ConnectionState::Connected {
            return Err(SyncError::NotConnected);
        }
        let text = serde_json::to_string(frame)?;
        outbound.send(text).map_err(|_| SyncError::NotConnected)
    }

    fn teardown(&self, inner: &mut ChannelInner) {
        inner.epoch += 1;
        inner.outbound = None;
        inner.reader = None;
        inner.heartbeat = None;
        inner.reconnect = None;
        inner.relink_requested = false;
        inner.exhausted = false;
        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            self.dispatcher
                .publish(SyncEvent::Disconnected { reason: None });
        }
    }

    pub async fn shutdown(&self) -> Option<PeerId> {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner);
        inner.identity.take()
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
