use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::sse::{self, Sse},
    routing::{any, get, post},
    Json, Router,
};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::{
    broadcast::EventBroadcaster,
    domain::{
        normalize_ttl, CapturedEvent, CreateEndpointRequest, DeleteResponse, Endpoint,
        EndpointSummary,
    },
    errors::AppError,
    store::EndpointStore,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EndpointStore>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub base_url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/endpoints", post(create_endpoint).get(list_endpoints))
        .route("/endpoints/:id", get(get_endpoint).delete(delete_endpoint))
        .route("/endpoints/:id/events", get(list_events))
        .route("/endpoints/:id/stream", get(stream_events))
        .route("/e/:id", any(capture))
        .route("/e/:id/*path", any(capture_nested))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.store.mode().to_string(),
    })
}

async fn create_endpoint(
    State(state): State<AppState>,
    payload: Option<Json<CreateEndpointRequest>>,
) -> Result<(StatusCode, Json<Endpoint>), AppError> {
    let ttl_secs = normalize_ttl(payload.and_then(|Json(req)| req.ttl_seconds));
    let endpoint = state.store.create_endpoint(ttl_secs).await?;
    tracing::info!(endpoint = %endpoint.id, ttl_secs, "endpoint created");
    Ok((StatusCode::CREATED, Json(endpoint)))
}

async fn list_endpoints(
    State(state): State<AppState>,
) -> Result<Json<Vec<EndpointSummary>>, AppError> {
    let endpoints = state.store.list_endpoints().await?;
    let mut summaries = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let event_count = state.store.count_events(&endpoint.id).await?;
        summaries.push(EndpointSummary {
            url: format!("{}/e/{}", state.base_url, endpoint.id),
            ttl_remaining_secs: endpoint.remaining_secs(),
            event_count,
            endpoint,
        });
    }
    Ok(Json(summaries))
}

async fn get_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Endpoint>, AppError> {
    let endpoint = state
        .store
        .get_endpoint(&id)
        .await
        .map_err(expired_as_not_found)?;
    Ok(Json(endpoint))
}

async fn delete_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let removed = state.store.delete_endpoint(&id).await?;
    if removed {
        tracing::info!(endpoint = %id, "endpoint deleted");
    }
    Ok(Json(DeleteResponse { removed }))
}

async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CapturedEvent>>, AppError> {
    state
        .store
        .get_endpoint(&id)
        .await
        .map_err(expired_as_not_found)?;
    Ok(Json(state.store.list_events(&id).await?))
}

/// Long-lived stream: one `event:`/`data:` block per captured request,
/// comment keep-alives while the receiver is idle. Ends when the client
/// disconnects or the endpoint is deleted or reaped; the subscription is
/// released as soon as the stream is dropped.
async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<sse::Event, Infallible>>>, AppError> {
    state
        .store
        .get_endpoint(&id)
        .await
        .map_err(expired_as_not_found)?;

    let subscription = state.broadcaster.subscribe(&id);
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let payload = serde_json::to_string(&event).ok()?;
        Some((
            Ok::<_, Infallible>(sse::Event::default().event("request").data(payload)),
            subscription,
        ))
    });

    Ok(Sse::new(stream).keep_alive(sse::KeepAlive::default()))
}

async fn capture(
    State(state): State<AppState>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CapturedEvent>, AppError> {
    capture_inner(state, id, method, uri, headers, body).await
}

async fn capture_nested(
    State(state): State<AppState>,
    Path((id, _rest)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CapturedEvent>, AppError> {
    capture_inner(state, id, method, uri, headers, body).await
}

async fn capture_inner(
    state: AppState,
    id: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CapturedEvent>, AppError> {
    // Authoritative liveness check: unknown ids 404, expired ones 410.
    let endpoint = state.store.get_endpoint(&id).await?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| uri.path().to_owned());
    let event = CapturedEvent::new(
        method.to_string(),
        path,
        query_to_json(uri.query()),
        headers_to_json(&headers),
        body_to_json(&body),
    );

    // The endpoint may be deleted between the check above and this append;
    // the store reports that instead of half-recording the event.
    if !state.store.append_event(&endpoint.id, &event).await? {
        return Err(AppError::NotFound);
    }
    tracing::debug!(endpoint = %endpoint.id, event = %event.id, method = %event.method, "event captured");

    Ok(Json(event))
}

fn expired_as_not_found(err: AppError) -> AppError {
    match err {
        AppError::Expired => AppError::NotFound,
        other => other,
    }
}

/// Fold repeated keys into arrays: `a=1&a=2` becomes `{"a":["1","2"]}`.
fn fold_multi_value(map: &mut serde_json::Map<String, Value>, key: String, value: String) {
    match map.get_mut(&key) {
        None => {
            map.insert(key, Value::String(value));
        }
        Some(Value::Array(values)) => values.push(Value::String(value)),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, Value::String(value)]);
        }
    }
}

fn query_to_json(query: Option<&str>) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(raw) = query {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            fold_multi_value(&mut map, key.into_owned(), value.into_owned());
        }
    }
    Value::Object(map)
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        fold_multi_value(&mut map, name.to_string(), value);
    }
    Value::Object(map)
}

/// Parsed JSON when the payload is JSON, raw text otherwise.
fn body_to_json(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
