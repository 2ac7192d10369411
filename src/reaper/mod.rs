use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::store::EndpointStore;

/// Periodic cleanup of endpoints that are already past expiry.
///
/// This is a backstop: reads enforce `expires_at` themselves, so an
/// expired endpoint behaves as gone between sweeps. The sweep reclaims
/// the bookkeeping: fallback-mode records and logs, durable-mode index
/// entries, and live subscriber channels either way.
pub fn spawn(store: Arc<dyn EndpointStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.sweep_expired().await {
                Ok(0) => {}
                Ok(swept) => tracing::debug!(swept, "reaper removed expired endpoints"),
                Err(err) => tracing::warn!(error = %err, "reaper sweep failed"),
            }
        }
    })
}
