//! Periodic statistics collection. A non-positive interval disables the
//! scheduler entirely, matching the behavior of setting
//! `STATS_INTERVAL_SECS=0`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::service::AppService;

pub fn spawn(service: Arc<AppService>, interval_secs: i64) -> Option<JoinHandle<()>> {
    if interval_secs <= 0 {
        info!("stats collection disabled");
        return None;
    }

    info!(interval_secs, "starting stats collector");
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so startup recovery
        // finishes before the first poll
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = service.run_scheduled_collection().await {
                warn!(error = %e, "scheduled collection failed");
            }
        }
    }))
}
