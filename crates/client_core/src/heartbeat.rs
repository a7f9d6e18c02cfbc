use std::{sync::Arc, time::Duration};

use shared::domain::{PeerId, PresenceAnnouncement};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::{backend::PresenceBackend, error::with_deadline, task::ScheduledTask};

pub(crate) fn spawn_heartbeat(
    backend: Arc<dyn PresenceBackend>,
    identity: PeerId,
    period: Duration,
    request_timeout: Duration,
) -> ScheduledTask {
    ScheduledTask::spawn("heartbeat", async move {
        // The connect path already announced us online; first refresh waits a full period.
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let refresh = backend.announce(&identity, PresenceAnnouncement::Refresh);
            match with_deadline("presence refresh", request_timeout, refresh).await {
                Ok(()) => debug!(identity = %identity, "heartbeat: presence refreshed"),
                Err(err) => {
                    warn!(identity = %identity, error = %err, "heartbeat: refresh failed, waiting for next tick")
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/heartbeat_tests.rs"]
mod tests;
