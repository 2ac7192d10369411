use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};

use crate::{
    broadcast::EventBroadcaster,
    domain::{CapturedEvent, Endpoint, MAX_EVENTS_PER_ENDPOINT},
    errors::AppError,
    store::{BackendMode, EndpointStore},
};

const INDEX_KEY: &str = "endpoints";
const EVENT_CHANNEL_PREFIX: &str = "endpoint:events:";
const EVENT_CHANNEL_PATTERN: &str = "endpoint:events:*";
const RELAY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Appends only while the endpoint record still exists, and keeps the log
/// dying at the same instant as its record. Returns 1 when the event was
/// stored, 0 when the endpoint had already been deleted or expired.
const APPEND_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('LPUSH', KEYS[2], ARGV[1])
redis.call('LTRIM', KEYS[2], 0, tonumber(ARGV[2]) - 1)
local ttl = redis.call('PTTL', KEYS[1])
if ttl > 0 then
  redis.call('PEXPIRE', KEYS[2], ttl)
end
return 1
"#;

fn record_key(id: &str) -> String {
    format!("endpoint:{id}")
}

fn events_key(id: &str) -> String {
    format!("endpoint:{id}:events")
}

fn event_channel(id: &str) -> String {
    format!("{EVENT_CHANNEL_PREFIX}{id}")
}

/// Durable store. Redis carries the expiry (`PEXPIREAT` on the record,
/// mirrored onto the event list) and the append cap (`LPUSH`+`LTRIM`
/// inside one script), so no in-process locking is needed here.
///
/// Captured events travel through Redis pub/sub and come back via a relay
/// task that feeds the local [`EventBroadcaster`], so a subscriber on any
/// process sharing this Redis sees every publish.
pub struct RedisEndpointStore {
    conn: ConnectionManager,
    append_script: Script,
    broadcaster: Arc<EventBroadcaster>,
}

impl RedisEndpointStore {
    /// Single connection attempt; the caller decides what a failure means.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Result<Self, AppError> {
        let client = Client::open(url)?;
        let conn = tokio::time::timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                AppError::Internal(format!(
                    "redis connection attempt timed out after {connect_timeout:?}"
                ))
            })??;

        tokio::spawn(run_relay(client, Arc::clone(&broadcaster)));

        Ok(Self {
            conn,
            append_script: Script::new(APPEND_SCRIPT),
            broadcaster,
        })
    }
}

#[async_trait]
impl EndpointStore for RedisEndpointStore {
    async fn create_endpoint(&self, ttl_secs: i64) -> Result<Endpoint, AppError> {
        let endpoint = Endpoint::new(ttl_secs);
        let payload = serde_json::to_string(&endpoint)?;
        let key = record_key(&endpoint.id);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(&key, payload)
            .ignore()
            .pexpire_at(&key, endpoint.expires_at.timestamp_millis())
            .ignore()
            .sadd(INDEX_KEY, &endpoint.id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(endpoint)
    }

    async fn get_endpoint(&self, id: &str) -> Result<Endpoint, AppError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(record_key(id)).await?;
        let raw = raw.ok_or(AppError::NotFound)?;
        let endpoint: Endpoint = serde_json::from_str(&raw)?;
        // Redis evicts on read, but the deadline may land between the GET
        // and this check; the record's own clock stays authoritative.
        if endpoint.is_expired() {
            return Err(AppError::Expired);
        }
        Ok(endpoint)
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, AppError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(INDEX_KEY).await?;

        let mut endpoints = Vec::new();
        let mut stale = Vec::new();
        for id in ids {
            let raw: Option<String> = conn.get(record_key(&id)).await?;
            match raw {
                Some(raw) => match serde_json::from_str::<Endpoint>(&raw) {
                    Ok(endpoint) if !endpoint.is_expired() => endpoints.push(endpoint),
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(endpoint = %id, error = %err, "discarding unreadable endpoint record");
                        stale.push(id);
                    }
                },
                // Record already expired away; heal the index in passing.
                None => stale.push(id),
            }
        }
        if !stale.is_empty() {
            let _: () = conn.srem(INDEX_KEY, &stale).await?;
        }

        endpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(endpoints)
    }

    async fn delete_endpoint(&self, id: &str) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(record_key(id))
            .del(events_key(id))
            .ignore()
            .srem(INDEX_KEY, id)
            .ignore();
        let (removed,): (i64,) = pipe.query_async(&mut conn).await?;

        self.broadcaster.remove(id);
        Ok(removed > 0)
    }

    async fn append_event(&self, id: &str, event: &CapturedEvent) -> Result<bool, AppError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();

        let appended: i64 = self
            .append_script
            .key(record_key(id))
            .key(events_key(id))
            .arg(&payload)
            .arg(MAX_EVENTS_PER_ENDPOINT)
            .invoke_async(&mut conn)
            .await?;
        if appended == 0 {
            return Ok(false);
        }

        // Local subscribers are fed by the relay task, so one publish
        // reaches this process and every other one behind the same Redis.
        let _: () = conn.publish(event_channel(id), &payload).await?;
        Ok(true)
    }

    async fn list_events(&self, id: &str) -> Result<Vec<CapturedEvent>, AppError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(events_key(id), 0, MAX_EVENTS_PER_ENDPOINT as isize - 1)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::warn!(endpoint = %id, error = %err, "discarding unreadable event record");
                    None
                }
            })
            .collect())
    }

    async fn count_events(&self, id: &str) -> Result<usize, AppError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.llen(events_key(id)).await?;
        Ok(count.max(0) as usize)
    }

    async fn sweep_expired(&self) -> Result<usize, AppError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(INDEX_KEY).await?;

        // Redis already dropped the expired data; only the index entry and
        // any live subscriber channels are left to prune.
        let mut stale = Vec::new();
        for id in ids {
            let exists: bool = conn.exists(record_key(&id)).await?;
            if !exists {
                stale.push(id);
            }
        }
        if !stale.is_empty() {
            let _: () = conn.srem(INDEX_KEY, &stale).await?;
            for id in &stale {
                self.broadcaster.remove(id);
            }
        }
        Ok(stale.len())
    }

    fn mode(&self) -> BackendMode {
        BackendMode::Redis
    }
}

/// Pump events from Redis pub/sub into the local broadcaster, reconnecting
/// with a delay whenever the subscription drops.
async fn run_relay(client: Client, broadcaster: Arc<EventBroadcaster>) {
    loop {
        match relay_messages(&client, &broadcaster).await {
            Ok(()) => tracing::warn!("event relay stream ended, reconnecting"),
            Err(err) => tracing::warn!(error = %err, "event relay lost its connection, reconnecting"),
        }
        tokio::time::sleep(RELAY_RETRY_DELAY).await;
    }
}

async fn relay_messages(
    client: &Client,
    broadcaster: &EventBroadcaster,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(EVENT_CHANNEL_PATTERN).await?;
    tracing::debug!(pattern = EVENT_CHANNEL_PATTERN, "event relay subscribed");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let channel = msg.get_channel_name().to_owned();
        let Some(id) = channel.strip_prefix(EVENT_CHANNEL_PREFIX) else {
            continue;
        };
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(endpoint = %id, error = %err, "discarding non-text event payload");
                continue;
            }
        };
        match serde_json::from_str::<CapturedEvent>(&payload) {
            Ok(event) => {
                broadcaster.publish(id, event);
            }
            Err(err) => {
                tracing::warn!(endpoint = %id, error = %err, "discarding malformed event payload");
            }
        }
    }
    Ok(())
}
