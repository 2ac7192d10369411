use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    broadcast::EventBroadcaster,
    config::AppConfig,
    domain::{CapturedEvent, Endpoint},
    errors::AppError,
};

pub mod memory;
pub mod redis;

/// Which persistence substrate the process committed to at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Redis,
    Memory,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::Redis => f.write_str("redis"),
            BackendMode::Memory => f.write_str("memory"),
        }
    }
}

/// Endpoint registry plus per-endpoint event log.
///
/// Both implementations uphold the same observable contract: read-time
/// expiry (`get_endpoint` reports `Expired` for a record past its
/// deadline even before any sweep has run), a 100-entry newest-first
/// event cap, and atomic deletion of a record together with its log and
/// live subscriptions.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn create_endpoint(&self, ttl_secs: i64) -> Result<Endpoint, AppError>;
    async fn get_endpoint(&self, id: &str) -> Result<Endpoint, AppError>;
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, AppError>;
    /// Returns whether anything existed to delete.
    async fn delete_endpoint(&self, id: &str) -> Result<bool, AppError>;

    /// Append to the endpoint's log, evicting past the cap, and publish
    /// to live subscribers. Returns `false` (not an error) when the
    /// endpoint no longer existed at append time, so the capture flow can
    /// report a delete that raced an in-flight capture as not-found.
    async fn append_event(&self, id: &str, event: &CapturedEvent) -> Result<bool, AppError>;
    async fn list_events(&self, id: &str) -> Result<Vec<CapturedEvent>, AppError>;
    async fn count_events(&self, id: &str) -> Result<usize, AppError>;

    /// Reaper hook: prune whatever this backend accumulates for endpoints
    /// that are already past expiry. Returns how many ids were swept.
    async fn sweep_expired(&self) -> Result<usize, AppError>;

    fn mode(&self) -> BackendMode;
}

/// Pick the backend for the lifetime of the process: one Redis attempt,
/// any failure commits to the in-memory fallback. No mid-run switching.
pub async fn connect(
    config: &AppConfig,
    broadcaster: Arc<EventBroadcaster>,
) -> Arc<dyn EndpointStore> {
    if config.force_memory {
        tracing::info!("in-memory backend forced by configuration");
        return Arc::new(memory::MemoryEndpointStore::new(broadcaster));
    }

    match redis::RedisEndpointStore::connect(
        &config.redis_url,
        config.connect_timeout,
        Arc::clone(&broadcaster),
    )
    .await
    {
        Ok(store) => {
            tracing::info!(url = %config.redis_url, "connected to redis backend");
            Arc::new(store)
        }
        Err(err) => {
            tracing::warn!(
                error = %err,
                "redis unreachable, falling back to in-memory backend"
            );
            Arc::new(memory::MemoryEndpointStore::new(broadcaster))
        }
    }
}
