//! Periodic eviction of expired jobs.
//!
//! Terminal jobs older than the queue's retention window are dropped from the
//! job table and their result files deleted. Runs on a fixed interval using
//! `tokio::time::interval`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::queue::JobQueue;

/// Run the sweeper loop until `cancel` is triggered.
pub async fn run(queue: JobQueue, period: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = period.as_secs(), "Result retention job started");

    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Result retention job stopping");
                break;
            }
            _ = interval.tick() => {
                let evicted = queue.sweep_expired().await;
                if evicted > 0 {
                    tracing::info!(evicted, remaining = queue.len(), "Result retention: evicted expired jobs");
                } else {
                    tracing::debug!("Result retention: nothing to evict");
                }
            }
        }
    }
}
