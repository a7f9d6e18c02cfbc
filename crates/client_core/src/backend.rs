use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{PeerId, PresenceAnnouncement},
    error::{ApiError, ApiException},
    protocol::{MarkReadRequest, MessageEnvelope, MessagesSinceQuery, PresenceStatus, UnreadCounts},
};
use url::Url;

use crate::error::SyncError;

#[async_trait]
pub trait PresenceBackend: Send + Sync {
    async fn fetch_presence(&self, peer_id: &PeerId) -> Result<bool, SyncError>;
    async fn fetch_online_peers(&self) -> Result<Vec<PeerId>, SyncError>;
    async fn fetch_unread_counts(&self, identity: &PeerId) -> Result<UnreadCounts, SyncError>;
    async fn fetch_messages_since(
        &self,
        identity: &PeerId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageEnvelope>, SyncError>;
    async fn mark_read(&self, reader: &PeerId, sender: &PeerId) -> Result<(), SyncError>;
    async fn announce(
        &self,
        identity: &PeerId,
        announcement: PresenceAnnouncement,
    ) -> Result<(), SyncError>;
}

pub struct HttpBackend {
    http: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, SyncError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| SyncError::Connection(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            base_url,
            request_timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Connection(format!("invalid base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, SyncError> {
        let response = request
            .send()
            .await
            .map_err(|err| self.map_transport_error(err))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiError>(&body) {
            Ok(api_error) => ApiException::from(api_error).to_string(),
            Err(_) if body.is_empty() => status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
            Err(_) => body,
        };
        Err(SyncError::Backend {
            status: status.as_u16(),
            message,
        })
    }

    fn map_transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout {
                operation: "http request",
                after: self.request_timeout,
            }
        } else {
            SyncError::Connection(err.to_string())
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = self.execute(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| SyncError::Decode(format!("invalid backend payload: {err}")))
    }
}

#[async_trait]
impl PresenceBackend for HttpBackend {
    async fn fetch_presence(&self, peer_id: &PeerId) -> Result<bool, SyncError> {
        let url = self.endpoint(&["presence", peer_id.as_str()])?;
        let status: PresenceStatus = self.get_json(self.http.get(url)).await?;
        Ok(status.online)
    }

    async fn fetch_online_peers(&self) -> Result<Vec<PeerId>, SyncError> {
        let url = self.endpoint(&["presence", "list"])?;
        self.get_json(self.http.get(url)).await
    }

    async fn fetch_unread_counts(&self, identity: &PeerId) -> Result<UnreadCounts, SyncError> {
        let url = self.endpoint(&["unread-counts", identity.as_str()])?;
        self.get_json(self.http.get(url)).await
    }

    async fn fetch_messages_since(
        &self,
        identity: &PeerId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageEnvelope>, SyncError> {
        let url = self.endpoint(&["messages", "poll", identity.as_str()])?;
        let request = self.http.get(url).query(&MessagesSinceQuery { since });
        self.get_json(request).await
    }

    async fn mark_read(&self, reader: &PeerId, sender: &PeerId) -> Result<(), SyncError> {
        let url = self.endpoint(&["mark-read"])?;
        let request = self.http.post(url).json(&MarkReadRequest {
            reader: reader.clone(),
            sender: sender.clone(),
        });
        self.execute(request).await?;
        Ok(())
    }

    async fn announce(
        &self,
        identity: &PeerId,
        announcement: PresenceAnnouncement,
    ) -> Result<(), SyncError> {
        let url = self.endpoint(&["presence", identity.as_str(), announcement.path_segment()])?;
        self.execute(self.http.post(url)).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
