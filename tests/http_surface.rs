//! Black-box tests of the HTTP surface (spec §6, §8 "Boundary scenarios").
//!
//! Grounded on rmcp's own `tests/test_sse_server.rs`, which drives its
//! server-side SSE transport through `tower::ServiceExt::oneshot` against an
//! in-memory `axum::Router` rather than a bound socket. These tests do the
//! same against `mcp_gateway_lib::http::build_router`, with an empty
//! upstream pool: every scenario here is about session/transport mechanics,
//! not upstream routing (that's `catalog.rs`'s unit tests).

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use mcp_gateway_lib::catalog::Catalog;
use mcp_gateway_lib::http::{self, AppState};
use mcp_gateway_lib::session::modern::SESSION_ID_HEADER;
use mcp_gateway_lib::session::{LegacySessionManager, ModernSessionManager};
use mcp_gateway_lib::upstream::UpstreamPool;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn empty_state() -> AppState {
    let catalog = Arc::new(Catalog::new(Arc::new(UpstreamPool::new())));
    AppState { modern: ModernSessionManager::new(catalog.clone(), 2), legacy: LegacySessionManager::new(catalog) }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_mcp(body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn initialize_returns_session_id_header() {
    let router = http::build_router(empty_state(), &[], true);
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} });
    let response = router.oneshot(post_mcp(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(SESSION_ID_HEADER));
}

/// Spec §8 round-trip law: `DELETE /mcp` on an existing session, then any
/// subsequent request with that session id, returns HTTP 400.
#[tokio::test]
async fn delete_then_reuse_of_session_id_is_400() {
    let router = http::build_router(empty_state(), &[], true);

    let init_body = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} });
    let init_response = router.clone().oneshot(post_mcp(init_body)).await.unwrap();
    let session_id = init_response.headers().get(SESSION_ID_HEADER).unwrap().to_str().unwrap().to_string();

    let mut delete_request = Request::builder().method(Method::DELETE).uri("/mcp").body(Body::empty()).unwrap();
    delete_request.headers_mut().insert(SESSION_ID_HEADER, session_id.parse().unwrap());
    let delete_response = router.clone().oneshot(delete_request).await.unwrap();
    assert_eq!(delete_response.status(), StatusCode::OK);

    let follow_up = json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {} });
    let mut request = post_mcp(follow_up);
    request.headers_mut().insert(SESSION_ID_HEADER, session_id.parse().unwrap());
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn follow_up_missing_session_header_is_400() {
    let router = http::build_router(empty_state(), &[], true);
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {} });
    let response = router.oneshot(post_mcp(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Spec §8 boundary scenario 1: the 101st modern session is refused with the
/// exact 503 JSON-RPC envelope spec.md quotes.
#[tokio::test]
async fn hundred_and_first_session_gets_503_envelope() {
    let router = http::build_router(empty_state(), &[], true);

    for i in 0..100 {
        let body = json!({ "jsonrpc": "2.0", "id": i, "method": "initialize", "params": {} });
        let response = router.clone().oneshot(post_mcp(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "session {i} should have been accepted");
    }

    let body = json!({ "jsonrpc": "2.0", "id": 100, "method": "initialize", "params": {} });
    let response = router.oneshot(post_mcp(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let envelope = body_json(response).await;
    assert_eq!(envelope["jsonrpc"], "2.0");
    assert_eq!(envelope["error"]["code"], -32000);
    assert!(envelope["error"]["message"].as_str().unwrap().contains("Too many active sessions"));
    assert!(envelope["id"].is_null());
}

#[tokio::test]
async fn post_sse_is_rejected_with_400_pointing_at_mcp() {
    let router = http::build_router(empty_state(), &[], true);
    let request = Request::builder().method(Method::POST).uri("/sse").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let envelope = body_json(response).await;
    assert!(envelope["error"]["message"].as_str().unwrap().contains("/mcp"));
}

#[tokio::test]
async fn posted_legacy_message_without_session_id_is_400() {
    let router = http::build_router(empty_state(), &[], true);
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping", "params": {} });
    let request = Request::builder().method(Method::POST).uri("/messages").body(Body::from(body.to_string())).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn tools_list_with_no_upstreams_exposes_exactly_the_management_tools() {
    let router = http::build_router(empty_state(), &[], true);

    let init_body = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} });
    let init_response = router.clone().oneshot(post_mcp(init_body)).await.unwrap();
    let session_id = init_response.headers().get(SESSION_ID_HEADER).unwrap().to_str().unwrap().to_string();

    let list_body = json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {} });
    let mut request = post_mcp(list_body);
    request.headers_mut().insert(SESSION_ID_HEADER, session_id.parse().unwrap());
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let envelope = body_json(response).await;
    let tools = envelope["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 2);
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert!(names.contains(&"list_servers"));
    assert!(names.contains(&"get_server_info"));
}

#[tokio::test]
async fn health_endpoint_returns_ok_body() {
    let router = http::build_router(empty_state(), &["/healthz".to_string()], true);
    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}
