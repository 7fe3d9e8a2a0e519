//! Announcer: one announce at startup, then one per interval on a fixed phase.

use std::sync::Arc;

use meshecho_core::AnnounceSchedule;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bot::Transport;

/// Start announcing on a background task. Abort the handle to stop.
pub fn spawn_announcer<T: Transport>(transport: Arc<T>, schedule: AnnounceSchedule) -> JoinHandle<()> {
    tokio::spawn(run_announcer(transport, schedule))
}

/// Returns after the startup announce when the schedule is not periodic; otherwise never.
pub async fn run_announcer<T: Transport>(transport: Arc<T>, schedule: AnnounceSchedule) {
    let start = Instant::now();
    announce_once(transport.as_ref()).await;
    loop {
        let next = match schedule.next_after(start.into_std(), Instant::now().into_std()) {
            Some(next) => next,
            None => {
                debug!("periodic announces disabled");
                return;
            }
        };
        tokio::time::sleep_until(Instant::from_std(next)).await;
        announce_once(transport.as_ref()).await;
    }
}

async fn announce_once<T: Transport>(transport: &T) {
    match transport.announce().await {
        Ok(()) => debug!("announce sent"),
        Err(e) => warn!("announce failed: {}", e),
    }
}
