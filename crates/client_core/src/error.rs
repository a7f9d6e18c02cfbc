use std::{future::Future, time::Duration};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("duplex channel is not connected")]
    NotConnected,
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

pub(crate) async fn with_deadline<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout { operation, after }),
    }
}
