//! Periodic eviction of idle, aged, and empty connections.
//!
//! Runs [`RealtimeManager::run_cleanup`] on a fixed interval using
//! `tokio::time::interval` until cancelled.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::manager::RealtimeManager;

/// Run the cleanup scheduler until `cancel` is triggered.
pub async fn run(manager: RealtimeManager, every: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = every.as_secs(), "Realtime cleanup job started");

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Realtime cleanup job stopping");
                break;
            }
            _ = interval.tick() => {
                let report = manager.run_cleanup().await;
                if report.is_empty() {
                    tracing::debug!("Realtime cleanup: nothing to evict");
                } else {
                    tracing::info!(
                        evicted = report.evicted.len(),
                        removed_subscriptions = report.removed_subscriptions,
                        "Realtime cleanup: evicted connections"
                    );
                }
            }
        }
    }
}
