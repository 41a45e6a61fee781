//! Clock tick: `time_changed` at every whole second

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use opp_clock::Clock;
use opp_core::events::TimeChangedData;
use opp_core::Context;
use opp_event_bus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Time left until the next whole second after `now`
pub(crate) fn until_next_second(now: DateTime<Utc>) -> Duration {
    let next = now.trunc_subsecs(0) + ChronoDuration::seconds(1);
    (next - now).to_std().unwrap_or(Duration::from_secs(1))
}

/// Spawn the tick task; abort the handle to stop it
pub(crate) fn spawn(bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> JoinHandle<()> {
    debug!("Starting clock tick");
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(until_next_second(clock.utcnow())).await;
            let now = clock.utcnow().trunc_subsecs(0);
            bus.fire_typed(&TimeChangedData { now }, Context::new());
        }
    })
}
