//! Legacy Session Manager: Server-Sent Events transport (spec §4.4).
//!
//! Grounded on rmcp's `transport::sse_server::axum` (`sse_handler`/
//! `post_event_handler`: the endpoint-event-then-stream shape, and the
//! tx-store-keyed-by-session-id pattern for POST ingress) and on the
//! teacher's string-matched error handling in `proxy/server.rs`
//! (`handle_single_request`'s `e.to_string().contains(...)`), generalized
//! here into `classify_error` because this manager has to tell transient
//! peer hiccups from dead connections across three different call sites.

use super::SessionState;
use crate::catalog::Catalog;
use crate::error::{capacity_envelope, GatewayError};
use axum::body::Bytes;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;

/// Max concurrent legacy SSE sessions (spec §4.4 "Session cap").
pub const SSE_CAP: usize = 50;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const REAP_INTERVAL: Duration = Duration::from_secs(10);
/// "keep-alive-success == 0 AND inactive > 60s" dead-connection check.
const DEAD_NO_KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
/// Past this much idleness the reaper probes with a ping (spec §4.4 rule 2).
const PING_IDLE: Duration = Duration::from_secs(2 * 60);
const ERROR_COUNT_LIMIT: i64 = 5;
const CHANNEL_BUFFER: usize = 64;

/// Transport-error taxonomy (spec §4.4 "Error categorization").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Critical,
    Unknown,
}

/// Classify an error by message content, the way the teacher's
/// `handle_single_request` tells "Method not found" apart from other
/// upstream failures by matching on `to_string()`.
pub fn classify_error(message: &str) -> ErrorCategory {
    let m = message.to_lowercase();
    if m.contains("refused") || m.contains("permission denied") || m.contains("too many open files") || m.contains("emfile") {
        ErrorCategory::Critical
    } else if m.contains("reset")
        || m.contains("timed out")
        || m.contains("timeout")
        || m.contains("host not found")
        || m.contains("name or service not known")
        || m.contains("broken pipe")
    {
        ErrorCategory::Transient
    } else {
        ErrorCategory::Unknown
    }
}

/// One frame written onto a session's SSE stream.
enum SseFrame {
    Message(String),
    Comment(&'static str),
}

fn frame_to_event(frame: SseFrame) -> Result<Event, Infallible> {
    match frame {
        SseFrame::Message(data) => Ok(Event::default().event("message").data(data)),
        SseFrame::Comment(text) => Ok(Event::default().comment(text)),
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

struct LegacySession {
    id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    sender: mpsc::Sender<SseFrame>,
    keepalive_success: AtomicI64,
    error_count: AtomicI64,
    closing: AtomicBool,
}

impl LegacySession {
    fn new(id: String, sender: mpsc::Sender<SseFrame>) -> Self {
        Self {
            id,
            created_at: chrono::Utc::now(),
            state: Mutex::new(SessionState::Active),
            last_activity: Mutex::new(Instant::now()),
            sender,
            keepalive_success: AtomicI64::new(0),
            error_count: AtomicI64::new(0),
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

/// Owns every legacy SSE session: the event stream side (GET `/sse`), the
/// POST-ingress side (POST `/messages?sessionId=`), the 15s keep-alive
/// ticker per session, and the 10s reaper (spec §4.4).
pub struct LegacySessionManager {
    catalog: Arc<Catalog>,
    sessions: RwLock<HashMap<String, Arc<LegacySession>>>,
}

impl LegacySessionManager {
    pub fn new(catalog: Arc<Catalog>) -> Arc<Self> {
        let manager = Arc::new(Self { catalog, sessions: RwLock::new(HashMap::new()) });
        manager.clone().spawn_reaper();
        manager
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// GET `/sse`: open the event stream, emit the `endpoint` event MCP's
    /// legacy clients expect, then forward every frame written to this
    /// session (spec §4.4 "Endpoints exposed", "Connection tuning").
    pub async fn handle_sse(self: &Arc<Self>) -> Response {
        if self.sessions.read().await.len() >= SSE_CAP {
            let err = GatewayError::SessionCapExceeded;
            return (err.http_status(), Json(capacity_envelope("too many active sessions"))).into_response();
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let session = Arc::new(LegacySession::new(id.clone(), tx.clone()));
        self.sessions.write().await.insert(id.clone(), session.clone());
        tracing::info!(session = %id, created_at = %session.created_at.to_rfc3339(), "legacy sse session opened");

        self.clone().spawn_keepalive(session.clone());
        self.clone().spawn_peer_watcher(id.clone(), tx);

        let endpoint = format!("/messages?sessionId={id}");
        let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> = Box::pin(
            stream::once(async move { Ok(Event::default().event("endpoint").data(endpoint)) })
                .chain(ReceiverStream::new(rx).map(frame_to_event)),
        );

        let mut response = Sse::new(stream).into_response();
        apply_sse_headers(&mut response);
        response
    }

    /// POST `/messages?sessionId=<id>`: deliver one JSON-RPC message into
    /// the session and write the dispatch result back onto its stream.
    pub async fn handle_message(self: &Arc<Self>, query: MessageQuery, body: Bytes) -> Response {
        let Some(session_id) = query.session_id else {
            return (
                StatusCode::BAD_REQUEST,
                Json(GatewayError::ClientProtocolError("missing 'sessionId' query parameter".into()).to_jsonrpc(Value::Null)),
            )
                .into_response();
        };

        let Some(session) = self.sessions.read().await.get(&session_id).cloned() else {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(capacity_envelope("no active session for posted message")),
            )
                .into_response();
        };

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

        session.touch().await;

        let envelope = match self.catalog.dispatch(&request.method, request.params).await {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": request.id, "result": result }),
            Err(e) => e.to_jsonrpc(request.id),
        };
        let _ = session.sender.send(SseFrame::Message(envelope.to_string())).await;

        StatusCode::ACCEPTED.into_response()
    }

    /// POST `/sse` is rejected outright (spec §4.4 "Endpoints exposed").
    pub fn reject_post() -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(GatewayError::ClientProtocolError(
                "POST /sse is not supported by the legacy transport; use POST /mcp for the modern transport".into(),
            )
            .to_jsonrpc(Value::Null)),
        )
            .into_response()
    }

    /// Stop the client from re-entering `cleanup` twice: the peer-close
    /// watcher, the keep-alive ticker, and the reaper can all race to clean
    /// up the same session (spec §4.4 "Cleanup is idempotent").
    async fn cleanup(&self, id: &str, reason: &'static str) {
        let Some(session) = self.sessions.write().await.remove(id) else { return };
        if session.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        *session.state.lock().await = SessionState::Closed;
        tracing::info!(session = %id, reason, "legacy sse session cleaned up");
    }

    /// Detect the client going away by watching the channel that feeds its
    /// SSE stream close, exactly as rmcp's `sse_handler` watches
    /// `to_client_tx_clone.closed()`.
    fn spawn_peer_watcher(self: Arc<Self>, id: String, sender: mpsc::Sender<SseFrame>) {
        tokio::spawn(async move {
            sender.closed().await;
            self.cleanup(&id, "peer disconnected").await;
        });
    }

    /// 15s ticker writing `:keepalive\n\n`; a dead or unwritable socket
    /// triggers immediate cleanup (spec §4.4 "Keep-alive").
    fn spawn_keepalive(self: Arc<Self>, session: Arc<LegacySession>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
            loop {
                ticker.tick().await;
                if session.closing.load(Ordering::SeqCst) {
                    break;
                }
                if session.sender.is_closed() {
                    self.cleanup(&session.id, "keep-alive found dead socket").await;
                    break;
                }

                match session.sender.try_send(SseFrame::Comment("keepalive")) {
                    Ok(()) => {
                        session.touch().await;
                        session.keepalive_success.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.cleanup(&session.id, "keep-alive write failed: channel closed").await;
                        break;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let category = classify_error("channel full: client not draining events");
                        let errors = session.error_count.fetch_add(1, Ordering::SeqCst) + 1;
                        tracing::warn!(session = %session.id, ?category, errors, "keep-alive write skipped, peer is slow");
                        if errors > ERROR_COUNT_LIMIT {
                            self.cleanup(&session.id, "keep-alive error count exceeded limit").await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// 10s ticker performing the three reaper checks (spec §4.4 "Reaper
    /// policy"): dead connections are cleaned up immediately, idle-but-alive
    /// ones are probed with a ping, everything else is left alone.
    fn spawn_reaper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                let candidates: Vec<(String, Arc<LegacySession>)> =
                    self.sessions.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

                for (id, session) in candidates {
                    let state = *session.state.lock().await;
                    let idle = session.idle_for().await;
                    let keepalive_success = session.keepalive_success.load(Ordering::SeqCst);

                    if state != SessionState::Active || (keepalive_success == 0 && idle > DEAD_NO_KEEPALIVE_IDLE) {
                        self.cleanup(&id, "dead connection").await;
                        continue;
                    }

                    if idle > PING_IDLE {
                        match session.sender.try_send(SseFrame::Comment("ping")) {
                            Ok(()) => session.touch().await,
                            Err(_) => self.cleanup(&id, "ping write failed").await,
                        }
                    }
                }
            }
        });
    }

    /// Close every session (spec §4.5 "Shutdown" step 2); the caller
    /// applies the overall per-session cap via `tokio::time::timeout`.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.cleanup(&id, "shutdown").await;
        }
    }

    /// Fan an upstream notification out to every open legacy session
    /// (spec §4.2 "Response routing"). A full channel just drops the
    /// notification for that one session rather than blocking the others.
    pub async fn broadcast_notification(&self, notification: Value) {
        for session in self.sessions.read().await.values() {
            let _ = session.sender.try_send(SseFrame::Message(notification.to_string()));
        }
    }
}

/// The response headers spec §4.4 calls out as "observable" connection
/// tuning; `Content-Type` is already set by `Sse::into_response`.
fn apply_sse_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, "no-cache, no-transform".parse().expect("static header value"));
    headers.insert(header::CONNECTION, "keep-alive".parse().expect("static header value"));
    headers.insert("x-accel-buffering", "no".parse().expect("static header value"));
    headers.insert("keep-alive", "timeout=300".parse().expect("static header value"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamPool;

    fn manager() -> Arc<LegacySessionManager> {
        let catalog = Arc::new(Catalog::new(Arc::new(UpstreamPool::new())));
        LegacySessionManager::new(catalog)
    }

    #[test]
    fn classifies_refused_as_critical() {
        assert_eq!(classify_error("Connection refused (os error 111)"), ErrorCategory::Critical);
    }

    #[test]
    fn classifies_reset_as_transient() {
        assert_eq!(classify_error("Connection reset by peer"), ErrorCategory::Transient);
    }

    #[test]
    fn classifies_unfamiliar_message_as_unknown() {
        assert_eq!(classify_error("the dog ate the socket"), ErrorCategory::Unknown);
    }

    #[tokio::test]
    async fn message_without_session_id_is_bad_request() {
        let manager = manager();
        let response = manager.handle_message(MessageQuery { session_id: None }, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn message_for_unknown_session_is_503() {
        let manager = manager();
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping", "params": {} });
        let response = manager
            .handle_message(MessageQuery { session_id: Some("nope".into()) }, Bytes::from(body.to_string()))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn post_sse_is_rejected() {
        let response = LegacySessionManager::reject_post();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn opening_a_session_registers_it() {
        let manager = manager();
        let _response = manager.handle_sse().await;
        assert_eq!(manager.session_count().await, 1);
    }
}
