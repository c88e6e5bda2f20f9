//! Modern Session Manager: Streamable HTTP transport (spec §4.3).
//!
//! Grounded on the teacher's `proxy/server.rs` handler-per-route shape,
//! generalized from a single local dispatch table to sessions bound to the
//! shared `Catalog`, and on rmcp's `sse_server/axum.rs` for the
//! GET-opens-a-stream / POST-ingress split (the stream here carries
//! Streamable HTTP framing rather than legacy SSE framing).

use super::{ActiveRequestGuard, SessionState};
use crate::catalog::Catalog;
use crate::error::{capacity_envelope, GatewayError};
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
const GLOBAL_SESSION_CAP: usize = 100;
const REAP_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const STREAM_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

struct ModernSession {
    created_at: chrono::DateTime<chrono::Utc>,
    active_requests: Arc<AtomicI64>,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    outgoing: broadcast::Sender<String>,
    closing: AtomicBool,
}

impl ModernSession {
    fn new() -> Self {
        Self {
            created_at: chrono::Utc::now(),
            active_requests: Arc::new(AtomicI64::new(0)),
            state: Mutex::new(SessionState::Active),
            last_activity: Mutex::new(Instant::now()),
            outgoing: broadcast::channel(STREAM_BUFFER).0,
            closing: AtomicBool::new(false),
        }
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }
}

/// Owns every modern-transport session and the pending-request table that
/// matches a forwarded-upstream response back to the session that issued it
/// (spec §3 "PendingRequest", §4.2 "Response routing").
pub struct ModernSessionManager {
    catalog: Arc<Catalog>,
    sessions: RwLock<HashMap<String, Arc<ModernSession>>>,
    per_session_cap: i64,
}

impl ModernSessionManager {
    pub fn new(catalog: Arc<Catalog>, per_session_cap: usize) -> Arc<Self> {
        let manager = Arc::new(Self {
            catalog,
            sessions: RwLock::new(HashMap::new()),
            per_session_cap: per_session_cap.max(1) as i64,
        });
        manager.clone().spawn_reaper();
        manager
    }

    /// 10 s ticker evicting sessions idle > 5 min with zero active requests
    /// (spec §4.3 "Reaper policy"). Sessions mid-request are never evicted.
    fn spawn_reaper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                let candidates: Vec<(String, Arc<ModernSession>)> =
                    self.sessions.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                for (id, session) in candidates {
                    let idle = session.idle_for().await;
                    let active = session.active_requests.load(Ordering::SeqCst);
                    if idle > IDLE_TIMEOUT && active == 0 {
                        tracing::info!(session = %id, idle_secs = idle.as_secs(), "reaping idle modern session");
                        self.close_session(&id).await;
                    }
                }
            }
        });
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn close_session(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.remove(id) {
            if session.closing.swap(true, Ordering::SeqCst) {
                return;
            }
            *session.state.lock().await = SessionState::Closed;
        }
    }

    /// POST `/mcp`: either a session-less `initialize` or a follow-up call
    /// carrying `mcp-session-id`.
    pub async fn handle_post(self: &Arc<Self>, headers: HeaderMap, body: Bytes) -> Response {
        let request: JsonRpcRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(GatewayError::ClientProtocolError(e.to_string()).to_jsonrpc(Value::Null)),
                )
                    .into_response()
            }
        };

        let session_id_header = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);

        if request.method == "initialize" && session_id_header.is_none() {
            return self.handle_initialize(request).await;
        }

        let Some(session_id) = session_id_header else {
            return (
                StatusCode::BAD_REQUEST,
                Json(GatewayError::ClientProtocolError(format!("missing {SESSION_ID_HEADER} header")).to_jsonrpc(request.id)),
            )
                .into_response();
        };

        let Some(session) = self.sessions.read().await.get(&session_id).cloned() else {
            return (
                StatusCode::BAD_REQUEST,
                Json(GatewayError::UnknownSession(session_id).to_jsonrpc(request.id)),
            )
                .into_response();
        };

        if session.active_requests.load(Ordering::SeqCst) >= self.per_session_cap {
            let err = GatewayError::RequestConcurrencyExceeded;
            return (err.http_status(), Json(err.to_jsonrpc(request.id))).into_response();
        }

        let _guard = ActiveRequestGuard::enter(session.active_requests.clone());
        session.touch().await;

        match self.catalog.dispatch(&request.method, request.params).await {
            Ok(result) => {
                let envelope = json!({ "jsonrpc": "2.0", "id": request.id, "result": result });
                let _ = session.outgoing.send(envelope.to_string());
                (StatusCode::OK, Json(envelope)).into_response()
            }
            Err(e) => (StatusCode::OK, Json(e.to_jsonrpc(request.id))).into_response(),
        }
    }

    async fn handle_initialize(self: &Arc<Self>, request: JsonRpcRequest) -> Response {
        if self.sessions.read().await.len() >= GLOBAL_SESSION_CAP {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(capacity_envelope("too many active sessions: the gateway is at capacity. Too many active sessions")),
            )
                .into_response();
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(ModernSession::new());
        // The initialize call itself counts as the first active request
        // (spec §4.3 "Counter discipline").
        session.active_requests.fetch_add(1, Ordering::SeqCst);
        self.sessions.write().await.insert(session_id.clone(), session.clone());
        tracing::info!(session = %session_id, created_at = %session.created_at.to_rfc3339(), "modern session opened");

        let envelope = json!({ "jsonrpc": "2.0", "id": request.id, "result": Catalog::initialize_result() });

        session.active_requests.fetch_sub(1, Ordering::SeqCst);
        session.touch().await;

        let mut response = Json(envelope).into_response();
        response.headers_mut().insert(
            SESSION_ID_HEADER,
            session_id.parse().expect("uuid is a valid header value"),
        );
        response
    }

    /// GET `/mcp`: the server-to-client event stream for an existing
    /// session.
    pub async fn handle_get(self: &Arc<Self>, headers: HeaderMap) -> Response {
        let Some(session_id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string) else {
            return (
                StatusCode::BAD_REQUEST,
                Json(GatewayError::ClientProtocolError(format!("missing {SESSION_ID_HEADER} header")).to_jsonrpc(Value::Null)),
            )
                .into_response();
        };

        let Some(session) = self.sessions.read().await.get(&session_id).cloned() else {
            return (
                StatusCode::BAD_REQUEST,
                Json(GatewayError::UnknownSession(session_id).to_jsonrpc(Value::Null)),
            )
                .into_response();
        };

        let _guard = ActiveRequestGuard::enter(session.active_requests.clone());
        session.touch().await;
        let receiver = session.outgoing.subscribe();
        let stream = event_stream(receiver);
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
    }

    /// DELETE `/mcp`: explicit session termination.
    pub async fn handle_delete(self: &Arc<Self>, headers: HeaderMap) -> Response {
        let Some(session_id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string) else {
            return (
                StatusCode::BAD_REQUEST,
                Json(GatewayError::ClientProtocolError(format!("missing {SESSION_ID_HEADER} header")).to_jsonrpc(Value::Null)),
            )
                .into_response();
        };

        let Some(session) = self.sessions.read().await.get(&session_id).cloned() else {
            return (
                StatusCode::BAD_REQUEST,
                Json(GatewayError::UnknownSession(session_id).to_jsonrpc(Value::Null)),
            )
                .into_response();
        };

        let _guard = ActiveRequestGuard::enter(session.active_requests.clone());
        self.close_session(&session_id).await;
        StatusCode::OK.into_response()
    }

    /// Close every session with a per-session cap (spec §4.5 "Shutdown"
    /// step 2); the caller applies the overall cap via `tokio::time::timeout`.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.close_session(&id).await;
        }
    }

    /// Fan an upstream notification out to every open session's stream
    /// (spec §4.2 "Response routing": "Notifications ... are broadcast to
    /// every client session"). A session with nobody reading its GET
    /// stream yet simply has no subscribers; the send is a no-op for it.
    pub async fn broadcast_notification(&self, notification: Value) {
        let payload = notification.to_string();
        for session in self.sessions.read().await.values() {
            let _ = session.outgoing.send(payload.clone());
        }
    }
}

fn event_stream(
    mut receiver: broadcast::Receiver<String>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(data) => yield Ok(Event::default().data(data)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamPool;

    fn manager() -> Arc<ModernSessionManager> {
        let catalog = Arc::new(Catalog::new(Arc::new(UpstreamPool::new())));
        ModernSessionManager::new(catalog, 2)
    }

    #[tokio::test]
    async fn initialize_without_session_header_creates_a_session() {
        let manager = manager();
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} });
        let response = manager.handle_post(HeaderMap::new(), Bytes::from(body.to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(SESSION_ID_HEADER));
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn follow_up_without_session_header_is_bad_request() {
        let manager = manager();
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {} });
        let response = manager.handle_post(HeaderMap::new(), Bytes::from(body.to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_unknown_session_is_bad_request() {
        let manager = manager();
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_ID_HEADER, "nope".parse().unwrap());
        let response = manager.handle_delete(headers).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
