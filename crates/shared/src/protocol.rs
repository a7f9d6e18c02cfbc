use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, PeerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: MessageId,
    pub from: PeerId,
    pub to: PeerId,
    #[serde(alias = "message")]
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(from: PeerId, to: PeerId, body: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::derive(&from, &to, sent_at),
            from,
            to,
            body: body.into(),
            timestamp: sent_at,
        }
    }
}

/// Frames pushed by the backend over the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum InboundFrame {
    PeerOnline {
        peer_id: PeerId,
    },
    PeerOffline {
        peer_id: PeerId,
    },
    NewMessage(MessageEnvelope),
    UnreadCountUpdate {
        peer_id: PeerId,
        count: u32,
    },
    UserTyping {
        from: PeerId,
        is_typing: bool,
    },
    OnlineCountUpdate {
        count: u64,
    },
    OnlineUsersList {
        users: Vec<PeerId>,
    },
    ConnectionEstablished {
        sid: String,
    },
}

/// Frames the client writes to the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundFrame {
    SendMessage(MessageEnvelope),
    Typing {
        from: PeerId,
        to: PeerId,
        is_typing: bool,
    },
    GetOnlineUsers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceStatus {
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub reader: PeerId,
    pub sender: PeerId,
}

/// Authoritative per-peer unread counts for one reader.
pub type UnreadCounts = HashMap<PeerId, u32>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesSinceQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
