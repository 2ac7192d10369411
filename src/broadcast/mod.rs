use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::broadcast;

use crate::domain::CapturedEvent;

/// Per-endpoint channel depth. A subscriber that falls further behind than
/// this skips the missed events and keeps going.
const CHANNEL_CAPACITY: usize = 256;

/// In-process fan-out of captured events, keyed by endpoint id.
///
/// Each endpoint with at least one live subscriber owns a broadcast
/// channel; the entry is dropped when the last subscriber detaches or the
/// endpoint is deleted or reaped. Publishing never blocks and never fails
/// because of subscriber state.
#[derive(Default)]
pub struct EventBroadcaster {
    channels: Mutex<HashMap<String, broadcast::Sender<CapturedEvent>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<CapturedEvent>>> {
        self.channels.lock().expect("broadcaster registry poisoned")
    }

    /// Register interest in future events for `id`. Every call yields an
    /// independent subscription; detaching one never affects another.
    pub fn subscribe(self: &Arc<Self>, id: &str) -> Subscription {
        let mut channels = self.lock();
        let sender = channels
            .entry(id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Subscription {
            id: id.to_owned(),
            receiver: Some(sender.subscribe()),
            broadcaster: Arc::clone(self),
        }
    }

    /// Deliver `event` to every current subscriber of `id`. Returns how
    /// many subscribers received it; zero subscribers is not an error.
    pub fn publish(&self, id: &str, event: CapturedEvent) -> usize {
        let channels = self.lock();
        match channels.get(id) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the channel for `id`, terminating every live subscription to
    /// it. Idempotent; used on endpoint deletion and by the reaper.
    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.lock().len()
    }
}

/// One live attachment to an endpoint's event feed. Dropping it releases
/// the registration; the per-endpoint channel is torn down with the last
/// subscriber.
pub struct Subscription {
    id: String,
    receiver: Option<broadcast::Receiver<CapturedEvent>>,
    broadcaster: Arc<EventBroadcaster>,
}

impl Subscription {
    /// Next event captured for this endpoint, in append order. `None` once
    /// the endpoint has been deleted or reaped.
    pub async fn recv(&mut self) -> Option<CapturedEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        endpoint = %self.id,
                        skipped,
                        "live subscriber lagged, dropping missed events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channels = self.broadcaster.lock();
        // Release our receiver while holding the registry lock so a
        // concurrent subscribe cannot observe a half-removed channel.
        self.receiver.take();
        if let Some(sender) = channels.get(&self.id) {
            if sender.receiver_count() == 0 {
                channels.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(marker: &str) -> CapturedEvent {
        CapturedEvent::new(
            "POST".into(),
            format!("/{marker}"),
            json!({}),
            json!({}),
            json!({ "marker": marker }),
        )
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let mut sub = broadcaster.subscribe("ep1");

        broadcaster.publish("ep1", event("first"));
        broadcaster.publish("ep1", event("second"));

        assert_eq!(sub.recv().await.unwrap().path, "/first");
        assert_eq!(sub.recv().await.unwrap().path, "/second");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        assert_eq!(broadcaster.publish("nobody", event("x")), 0);
        assert_eq!(broadcaster.channel_count(), 0);
    }

    #[tokio::test]
    async fn subscriptions_are_independent() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let first = broadcaster.subscribe("ep1");
        let mut second = broadcaster.subscribe("ep1");

        drop(first);
        assert_eq!(broadcaster.publish("ep1", event("still-here")), 1);
        assert_eq!(second.recv().await.unwrap().path, "/still-here");
    }

    #[tokio::test]
    async fn detaching_the_last_subscriber_clears_the_registry() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let sub = broadcaster.subscribe("ep1");
        assert_eq!(broadcaster.channel_count(), 1);

        drop(sub);
        assert_eq!(broadcaster.channel_count(), 0);
        assert_eq!(broadcaster.publish("ep1", event("late")), 0);
    }

    #[tokio::test]
    async fn remove_terminates_live_subscriptions() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let mut sub = broadcaster.subscribe("ep1");

        broadcaster.remove("ep1");
        assert!(sub.recv().await.is_none());

        // removing again is fine
        broadcaster.remove("ep1");
    }

    #[tokio::test]
    async fn events_do_not_cross_endpoints() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let mut sub = broadcaster.subscribe("ep1");
        let _other = broadcaster.subscribe("ep2");

        broadcaster.publish("ep2", event("elsewhere"));
        broadcaster.publish("ep1", event("mine"));

        assert_eq!(sub.recv().await.unwrap().path, "/mine");
    }
}
