//! The HTTP surface: route table, CORS, and health endpoints (spec §6
//! "HTTP surface").
//!
//! Grounded on the teacher's `proxy/server.rs` router (one route per
//! transport verb, a blanket CORS layer) generalized to the two MCP
//! transports this gateway serves side by side, plus the spec's more
//! specific CORS allowlist in place of the teacher's `Any`/`Any`/`Any`.

use crate::session::legacy::MessageQuery;
use crate::session::{LegacySessionManager, ModernSessionManager};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub modern: Arc<ModernSessionManager>,
    pub legacy: Arc<LegacySessionManager>,
}

/// Build the full router: `/mcp` (modern), `/sse` + `/messages` (legacy),
/// one GET route per configured health-check path, and a catch-all
/// fallback that answers any unmatched `OPTIONS` with 200 (spec §6's
/// "OPTIONS (any): 200 for preflight").
pub fn build_router(state: AppState, health_paths: &[String], cors_enabled: bool) -> Router {
    let mut router = Router::new()
        .route(
            "/mcp",
            post(modern_post).get(modern_get).delete(modern_delete).options(preflight_ok),
        )
        .route("/sse", get(legacy_sse).post(legacy_post_rejected).options(preflight_ok))
        .route("/messages", post(legacy_message).options(preflight_ok))
        .fallback(fallback)
        .with_state(state);

    for path in health_paths {
        router = router.route(path, get(health_ok));
    }

    if cors_enabled {
        router = router.layer(build_cors_layer());
    }

    router
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static("mcp-session-id"),
            axum::http::header::CACHE_CONTROL,
        ])
        .expose_headers([HeaderName::from_static("mcp-session-id"), axum::http::header::CONTENT_TYPE])
}

async fn modern_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    state.modern.handle_post(headers, body).await
}

async fn modern_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.modern.handle_get(headers).await
}

async fn modern_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.modern.handle_delete(headers).await
}

async fn legacy_sse(State(state): State<AppState>) -> Response {
    state.legacy.handle_sse().await
}

async fn legacy_post_rejected() -> Response {
    LegacySessionManager::reject_post()
}

async fn legacy_message(State(state): State<AppState>, Query(query): Query<MessageQuery>, body: Bytes) -> Response {
    state.legacy.handle_message(query, body).await
}

async fn health_ok() -> Response {
    (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "text/plain")], "ok").into_response()
}

async fn preflight_ok() -> Response {
    StatusCode::OK.into_response()
}

/// Any route not registered above: 200 for OPTIONS (so preflight never
/// depends on the exact path matching), 404 otherwise.
async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::upstream::UpstreamPool;
    use tower::ServiceExt;

    fn empty_state() -> AppState {
        let catalog = Arc::new(Catalog::new(Arc::new(UpstreamPool::new())));
        AppState {
            modern: ModernSessionManager::new(catalog.clone(), 10),
            legacy: LegacySessionManager::new(catalog),
        }
    }

    #[tokio::test]
    async fn health_path_returns_ok() {
        let router = build_router(empty_state(), &["/healthz".to_string()], true);
        let response = router
            .oneshot(axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_health_paths_means_no_health_route() {
        let router = build_router(empty_state(), &[], true);
        let response = router
            .oneshot(axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unmatched_options_is_200() {
        let router = build_router(empty_state(), &[], true);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/anything")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unmatched_get_is_404() {
        let router = build_router(empty_state(), &[], true);
        let response = router
            .oneshot(axum::http::Request::builder().uri("/nope").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
