use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    broadcast::EventBroadcaster,
    domain::{CapturedEvent, Endpoint, MAX_EVENTS_PER_ENDPOINT},
    errors::AppError,
    store::{BackendMode, EndpointStore},
};

/// One endpoint and its capped event log. Kept in a single map entry so a
/// delete removes both in one step.
struct Entry {
    endpoint: Endpoint,
    events: Vec<CapturedEvent>,
}

/// In-process fallback store, used when Redis is unreachable at startup.
///
/// Nothing here survives a restart and nothing expires on its own, so
/// every read applies the `expires_at` check itself and the reaper sweeps
/// out whatever the reads left behind.
pub struct MemoryEndpointStore {
    entries: RwLock<HashMap<String, Entry>>,
    broadcaster: Arc<EventBroadcaster>,
}

impl MemoryEndpointStore {
    pub fn new(broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            broadcaster,
        }
    }
}

#[async_trait]
impl EndpointStore for MemoryEndpointStore {
    async fn create_endpoint(&self, ttl_secs: i64) -> Result<Endpoint, AppError> {
        let endpoint = Endpoint::new(ttl_secs);
        self.entries.write().await.insert(
            endpoint.id.clone(),
            Entry {
                endpoint: endpoint.clone(),
                events: Vec::new(),
            },
        );
        Ok(endpoint)
    }

    async fn get_endpoint(&self, id: &str) -> Result<Endpoint, AppError> {
        let entries = self.entries.read().await;
        let entry = entries.get(id).ok_or(AppError::NotFound)?;
        // The reaper runs far less often than requests arrive; expiry has
        // to be enforced at read time, not just at sweep time.
        if entry.endpoint.is_expired() {
            return Err(AppError::Expired);
        }
        Ok(entry.endpoint.clone())
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, AppError> {
        let entries = self.entries.read().await;
        let mut endpoints: Vec<Endpoint> = entries
            .values()
            .filter(|entry| !entry.endpoint.is_expired())
            .map(|entry| entry.endpoint.clone())
            .collect();
        endpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(endpoints)
    }

    async fn delete_endpoint(&self, id: &str) -> Result<bool, AppError> {
        let removed = self.entries.write().await.remove(id).is_some();
        // Dropping the channel ends any live streams for this endpoint.
        self.broadcaster.remove(id);
        Ok(removed)
    }

    async fn append_event(&self, id: &str, event: &CapturedEvent) -> Result<bool, AppError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return Ok(false);
        };
        entry.events.insert(0, event.clone());
        entry.events.truncate(MAX_EVENTS_PER_ENDPOINT);
        // Publish while the write lock is held so concurrent appends reach
        // subscribers in the same order they landed in the log.
        self.broadcaster.publish(id, event.clone());
        Ok(true)
    }

    async fn list_events(&self, id: &str) -> Result<Vec<CapturedEvent>, AppError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(id)
            .map(|entry| entry.events.clone())
            .unwrap_or_default())
    }

    async fn count_events(&self, id: &str) -> Result<usize, AppError> {
        let entries = self.entries.read().await;
        Ok(entries.get(id).map(|entry| entry.events.len()).unwrap_or(0))
    }

    async fn sweep_expired(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.endpoint.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
            self.broadcaster.remove(id);
        }
        Ok(expired.len())
    }

    fn mode(&self) -> BackendMode {
        BackendMode::Memory
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn store() -> MemoryEndpointStore {
        MemoryEndpointStore::new(Arc::new(EventBroadcaster::new()))
    }

    fn event(n: usize) -> CapturedEvent {
        CapturedEvent::new(
            "POST".into(),
            format!("/hit/{n}"),
            json!({}),
            json!({}),
            json!({ "n": n }),
        )
    }

    async fn backdate(store: &MemoryEndpointStore, id: &str, secs: i64) {
        let mut entries = store.entries.write().await;
        let entry = entries.get_mut(id).unwrap();
        entry.endpoint.expires_at = Utc::now() - Duration::seconds(secs);
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store();
        let created = store.create_endpoint(60).await.unwrap();
        let fetched = store.get_endpoint(&created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.expires_at, created.expires_at);
    }

    #[tokio::test]
    async fn events_are_newest_first_and_capped() {
        let store = store();
        let endpoint = store.create_endpoint(60).await.unwrap();

        for n in 1..=150 {
            assert!(store.append_event(&endpoint.id, &event(n)).await.unwrap());
        }

        let events = store.list_events(&endpoint.id).await.unwrap();
        assert_eq!(events.len(), MAX_EVENTS_PER_ENDPOINT);
        assert_eq!(events[0].path, "/hit/150");
        assert_eq!(events[99].path, "/hit/51");
        assert_eq!(store.count_events(&endpoint.id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn small_logs_preserve_insertion_order_reversed() {
        let store = store();
        let endpoint = store.create_endpoint(60).await.unwrap();
        for n in 1..=3 {
            store.append_event(&endpoint.id, &event(n)).await.unwrap();
        }

        let events = store.list_events(&endpoint.id).await.unwrap();
        let paths: Vec<&str> = events.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/hit/3", "/hit/2", "/hit/1"]);
    }

    #[tokio::test]
    async fn expired_endpoints_are_gone_before_any_sweep() {
        let store = store();
        let endpoint = store.create_endpoint(60).await.unwrap();
        backdate(&store, &endpoint.id, 1).await;

        assert!(matches!(
            store.get_endpoint(&endpoint.id).await,
            Err(AppError::Expired)
        ));
        assert!(store.list_endpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_atomic() {
        let store = store();
        let endpoint = store.create_endpoint(60).await.unwrap();
        store.append_event(&endpoint.id, &event(1)).await.unwrap();

        assert!(store.delete_endpoint(&endpoint.id).await.unwrap());
        assert!(!store.delete_endpoint(&endpoint.id).await.unwrap());

        assert!(matches!(
            store.get_endpoint(&endpoint.id).await,
            Err(AppError::NotFound)
        ));
        assert!(store.list_events(&endpoint.id).await.unwrap().is_empty());
        assert_eq!(store.count_events(&endpoint.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_after_delete_reports_the_endpoint_gone() {
        let store = store();
        let endpoint = store.create_endpoint(60).await.unwrap();
        store.delete_endpoint(&endpoint.id).await.unwrap();

        // A capture that resolved the endpoint before the delete landed
        // must not half-succeed afterwards.
        assert!(!store.append_event(&endpoint.id, &event(1)).await.unwrap());
        assert!(store.list_events(&endpoint.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries_and_their_streams() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let store = MemoryEndpointStore::new(Arc::clone(&broadcaster));

        let keep = store.create_endpoint(60).await.unwrap();
        let reap = store.create_endpoint(60).await.unwrap();
        backdate(&store, &reap.id, 5).await;

        let mut sub = broadcaster.subscribe(&reap.id);
        assert_eq!(store.sweep_expired().await.unwrap(), 1);

        assert!(sub.recv().await.is_none());
        assert!(store.get_endpoint(&keep.id).await.is_ok());
        assert!(matches!(
            store.get_endpoint(&reap.id).await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn subscriber_sees_the_same_event_the_log_stores() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let store = MemoryEndpointStore::new(Arc::clone(&broadcaster));
        let endpoint = store.create_endpoint(60).await.unwrap();

        let mut sub = broadcaster.subscribe(&endpoint.id);
        store.append_event(&endpoint.id, &event(7)).await.unwrap();

        let pushed = sub.recv().await.unwrap();
        let listed = store.list_events(&endpoint.id).await.unwrap();
        assert_eq!(listed[0], pushed);
        assert_eq!(
            serde_json::to_value(&pushed).unwrap(),
            serde_json::to_value(&listed[0]).unwrap()
        );
    }
}
