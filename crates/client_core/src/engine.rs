use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{PeerId, PresenceAnnouncement},
    protocol::MessageEnvelope,
};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    backend::{HttpBackend, PresenceBackend},
    channel::{ConnectionState, DuplexChannel},
    config::EngineConfig,
    dispatcher::{EventDispatcher, Subscription, SyncEvent},
    error::{with_deadline, SyncError},
    polling::PollingEngine,
    presence::PresenceCache,
    task::ScheduledTask,
    transport::{ChannelConnector, WsConnector},
    unread::UnreadLedger,
};

pub type Listener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

#[async_trait]
pub trait SyncHandle: Send + Sync {
    async fn initialize(&self, identity: PeerId) -> Result<(), SyncError>;
    async fn disconnect(&self);
    async fn send_message(&self, to: PeerId, body: &str) -> Result<MessageEnvelope, SyncError>;
    async fn send_typing(&self, to: PeerId, is_typing: bool) -> Result<(), SyncError>;
    async fn request_online_users(&self) -> Result<(), SyncError>;
    async fn is_online(&self, peer_id: &PeerId) -> bool;
    fn get_unread_count(&self, peer_id: &PeerId) -> u32;
    fn get_total_unread(&self) -> u64;
    async fn mark_as_read(&self, peer_id: &PeerId);
    fn subscribe(&self, listener: Listener) -> Subscription;
    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent>;
    fn connection_state(&self) -> ConnectionState;
    fn watch_connection_state(&self) -> watch::Receiver<ConnectionState>;
    async fn retry_connection(&self) -> Result<(), SyncError>;
}

struct Session {
    identity: PeerId,
    poll_task: ScheduledTask,
}

pub struct SyncEngine {
    config: EngineConfig,
    backend: Arc<dyn PresenceBackend>,
    dispatcher: Arc<EventDispatcher>,
    presence: PresenceCache,
    ledger: Arc<UnreadLedger>,
    channel: Arc<DuplexChannel>,
    polling: Arc<PollingEngine>,
    session: Mutex<Option<Session>>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, SyncError> {
        let backend = HttpBackend::new(config.rest_base_url()?, config.request_timeout)?;
        let connector = WsConnector::new(config.resolved_channel_url()?);
        Ok(Self::new_with_dependencies(
            config,
            Arc::new(backend),
            Arc::new(connector),
        ))
    }

    pub fn new_with_dependencies(
        config: EngineConfig,
        backend: Arc<dyn PresenceBackend>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(EventDispatcher::new());
        let presence = PresenceCache::new(
            Arc::clone(&backend),
            config.staleness_window,
            config.request_timeout,
        );
        let ledger = Arc::new(UnreadLedger::new(config.dedup_capacity));
        let channel = DuplexChannel::new(
            config.clone(),
            connector,
            Arc::clone(&backend),
            Arc::clone(&dispatcher),
            presence.clone(),
            Arc::clone(&ledger),
        );
        let polling = PollingEngine::new(
            Arc::clone(&backend),
            Arc::clone(&dispatcher),
            Arc::clone(&ledger),
            channel.watch_state(),
            config.poll_interval,
            config.request_timeout,
        );

        Arc::new(Self {
            config,
            backend,
            dispatcher,
            presence,
            ledger,
            channel,
            polling,
            session: Mutex::new(None),
        })
    }

    pub async fn identity(&self) -> Option<PeerId> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.identity.clone())
    }

    async fn end_session(&self, session: Session) {
        let Session {
            identity,
            poll_task,
        } = session;
        drop(poll_task);
        self.channel.shutdown().await;

        let offline = self
            .backend
            .announce(&identity, PresenceAnnouncement::Offline);
        if let Err(err) = with_deadline("presence announce", self.config.request_timeout, offline).await
        {
            warn!(identity = %identity, error = %err, "engine: offline announce failed");
        }

        self.presence.clear();
        self.ledger.clear();
        self.polling.reset_cursor();
        info!(identity = %identity, "engine: session closed");
    }
}

#[async_trait]
impl SyncHandle for Arc<SyncEngine> {
    async fn initialize(&self, identity: PeerId) -> Result<(), SyncError> {
        let identity = PeerId::new(identity.as_str().trim());
        if identity.as_str().is_empty() {
            return Err(SyncError::InvalidIdentity("identity cannot be empty".into()));
        }

        {
            let mut session = self.session.lock().await;
            if let Some(current) = session.as_ref() {
                if current.identity == identity {
                    return Ok(());
                }
            }
            if let Some(previous) = session.take() {
                self.end_session(previous).await;
            }

            *session = Some(Session {
                identity: identity.clone(),
                poll_task: self.polling.spawn(identity.clone()),
            });
        }
        info!(identity = %identity, "engine: session started");

        // The session lock is released here; callers must not wait on the link.
        if let Err(err) = self.channel.connect(identity.clone()).await {
            warn!(identity = %identity, error = %err, "engine: duplex channel unavailable, polling fallback active");
        }
        if self.identity().await.is_none() {
            debug!(identity = %identity, "engine: session closed while connecting");
            self.channel.shutdown().await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let current = self.session.lock().await.take();
        if let Some(current) = current {
            self.end_session(current).await;
        }
    }

    async fn send_message(&self, to: PeerId, body: &str) -> Result<MessageEnvelope, SyncError> {
        self.channel.send(to, body).await
    }

    async fn send_typing(&self, to: PeerId, is_typing: bool) -> Result<(), SyncError> {
        self.channel.send_typing(to, is_typing).await
    }

    async fn request_online_users(&self) -> Result<(), SyncError> {
        self.channel.request_online_users().await
    }

    async fn is_online(&self, peer_id: &PeerId) -> bool {
        self.presence.is_online(peer_id).await
    }

    fn get_unread_count(&self, peer_id: &PeerId) -> u32 {
        self.ledger.count(peer_id)
    }

    fn get_total_unread(&self) -> u64 {
        self.ledger.total()
    }

    // A failed call is not rolled back; the next reconciliation corrects it.
    async fn mark_as_read(&self, peer_id: &PeerId) {
        self.dispatcher.publish_delta(self.ledger.mark_read(peer_id));

        let Some(reader) = self.identity().await else {
            warn!(peer_id = %peer_id, "engine: mark-as-read without a session, kept local only");
            return;
        };
        let call = self.backend.mark_read(&reader, peer_id);
        if let Err(err) = with_deadline("mark read", self.config.request_timeout, call).await {
            warn!(reader = %reader, peer_id = %peer_id, error = %err, "engine: mark-as-read failed, awaiting reconciliation");
        }
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        self.dispatcher.subscribe(listener)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.dispatcher.subscribe_stream()
    }

    fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.watch_state()
    }

    async fn retry_connection(&self) -> Result<(), SyncError> {
        if self.identity().await.is_none() {
            return Err(SyncError::NotConnected);
        }
        self.channel.retry().await
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
