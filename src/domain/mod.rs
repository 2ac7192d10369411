use chrono::{DateTime, Duration, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// TTL applied when the caller omits one or supplies a non-positive value.
pub const DEFAULT_TTL_SECS: i64 = 3600;

/// Hard cap on retained events per endpoint; older entries are evicted.
pub const MAX_EVENTS_PER_ENDPOINT: usize = 100;

const ENDPOINT_ID_LEN: usize = 12;
const EVENT_ID_LEN: usize = 16;

/// A short-lived webhook receiver. Immutable once created; liveness is
/// always derived from `expires_at` against the current clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn new(ttl_secs: i64) -> Self {
        let created_at = Utc::now();
        Self {
            id: nanoid!(ENDPOINT_ID_LEN),
            created_at,
            expires_at: created_at + Duration::seconds(ttl_secs),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Seconds until expiry, clamped to zero.
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// One request captured under an endpoint. `query` and `headers` are JSON
/// objects in which a repeated key becomes an array of strings; `body` is
/// the parsed JSON payload, or the raw text when it is not JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub query: Value,
    pub headers: Value,
    pub body: Value,
}

impl CapturedEvent {
    pub fn new(method: String, path: String, query: Value, headers: Value, body: Value) -> Self {
        Self {
            id: nanoid!(EVENT_ID_LEN),
            timestamp: Utc::now(),
            method,
            path,
            query,
            headers,
            body,
        }
    }
}

/// Clamp a caller-supplied TTL to something usable.
pub fn normalize_ttl(ttl_secs: Option<i64>) -> i64 {
    match ttl_secs {
        Some(secs) if secs > 0 => secs,
        _ => DEFAULT_TTL_SECS,
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateEndpointRequest {
    pub ttl_seconds: Option<i64>,
}

/// Endpoint record as reported by the listing API: the stored record plus
/// the derived fields clients need to use it.
#[derive(Debug, Serialize)]
pub struct EndpointSummary {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub event_count: usize,
    pub ttl_remaining_secs: i64,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub removed: bool,
}
