pub mod backend;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
mod heartbeat;
pub mod polling;
pub mod presence;
mod reconnect;
mod task;
pub mod transport;
pub mod unread;

pub use backend::{HttpBackend, PresenceBackend};
pub use channel::{ConnectionState, DuplexChannel, MAX_MESSAGE_CHARS};
pub use config::{Backoff, EngineConfig, ReconnectPolicy};
pub use dispatcher::{EventDispatcher, Subscription, SyncEvent};
pub use engine::{Listener, SyncEngine, SyncHandle};
pub use error::SyncError;
pub use polling::{PollOutcome, PollingEngine};
pub use presence::{PresenceCache, PresenceEntry};
pub use transport::{ChannelConnector, ChannelLink, LinkEvent, WsConnector};
pub use unread::{MessageDisposition, Reconciliation, UnreadDelta, UnreadLedger};

#[cfg(test)]
#[path = "tests/support.rs"]
mod tests_support;
