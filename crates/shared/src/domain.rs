use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id_newtype!(PeerId);
string_id_newtype!(MessageId);

impl MessageId {
    /// Deterministic id for a locally originated message. The backend keeps
    /// the id it receives, so the same message arriving later through the
    /// polling path carries this exact value.
    pub fn derive(from: &PeerId, to: &PeerId, sent_at: DateTime<Utc>) -> Self {
        Self(format!("{from}_{to}_{}", sent_at.timestamp_micros()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAnnouncement {
    Online,
    Offline,
    Refresh,
}

impl PresenceAnnouncement {
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Refresh => "refresh",
        }
    }
}
