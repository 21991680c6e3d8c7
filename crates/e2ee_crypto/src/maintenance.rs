use std::sync::Arc;

use tokio::{
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::session::E2EEncryptionManager;

/// Run `sweep` on a fixed interval until the handle is aborted.
pub fn spawn_sweeper(manager: Arc<E2EEncryptionManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = manager.sweep();
            if report.expired_keys + report.expired_sessions + report.closed_sessions > 0 {
                info!(
                    expired_keys = report.expired_keys,
                    expired_sessions = report.expired_sessions,
                    closed_sessions = report.closed_sessions,
                    "sweeper removed stale state"
                );
            } else {
                debug!("sweeper tick, nothing to remove");
            }
        }
    })
}

/// `spawn_sweeper` at the configured `sweep_interval_secs`.
pub fn spawn_configured_sweeper(manager: Arc<E2EEncryptionManager>) -> JoinHandle<()> {
    let period = manager.config().sweep_interval();
    spawn_sweeper(manager, period)
}
