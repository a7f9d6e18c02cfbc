use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::domain::PeerId;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::debug;
use url::Url;

use crate::error::SyncError;

/// Header carrying the session identity on the upgrade request.
pub const IDENTITY_HEADER: &str = "username";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(String),
    Closed { reason: Option<String> },
}

/// One open duplex connection. Dropping `outbound` closes the link.
pub struct ChannelLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, identity: &PeerId) -> Result<ChannelLink, SyncError>;
}

pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn open(&self, identity: &PeerId) -> Result<ChannelLink, SyncError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| SyncError::Connection(format!("invalid websocket request: {err}")))?;
        let identity_value = HeaderValue::from_str(identity.as_str())
            .map_err(|err| SyncError::Connection(format!("identity is not a valid header: {err}")))?;
        request.headers_mut().insert(IDENTITY_HEADER, identity_value);

        let (ws_stream, _) = connect_async(request).await.map_err(|err| {
            SyncError::Connection(format!("failed to connect websocket {}: {err}", self.url))
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(LinkEvent::Frame(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|frame| frame.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Some(format!("websocket receive failed: {err}")),
                    None => break None,
                }
            };
            debug!(?reason, "transport: websocket reader finished");
            let _ = inbound_tx.send(LinkEvent::Closed { reason });
        });

        Ok(ChannelLink { outbound, inbound })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
