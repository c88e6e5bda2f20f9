//! Library crate backing the `mcp-gateway` binary (spec §6).
//!
//! Grounded on the teacher's `lib.rs::run` for the init order (tracing
//! first, then config, then the long-running services); `run` here is a
//! plain async function rather than a Tauri-builder closure since there's
//! no desktop event loop to hand control to.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod session;
pub mod types;
pub mod upstream;

use catalog::Catalog;
use http::AppState;
use session::{LegacySessionManager, ModernSessionManager};
use std::sync::Arc;
use upstream::UpstreamPool;

/// Parse the config, connect every upstream, and serve until a shutdown
/// signal completes the sequence in `lifecycle::Lifecycle`. Returns once the
/// HTTP listener has fully drained.
pub async fn run(args: cli::Args) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(args.effective_log_level().as_env_filter()))
        .init();

    let config = match config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration invalid, refusing to start");
            std::process::exit(1);
        }
    };

    // Fan-out channel every upstream's spontaneous notifications land on;
    // `lifecycle::spawn_notification_relay` drains it into both session
    // managers (spec §4.2 "Response routing").
    let notifier = tokio::sync::broadcast::channel(256).0;

    let parallelism = args.bounded_parallelism(config.mcp_servers.len());
    let pool = match UpstreamPool::connect_all(&config, parallelism, notifier.clone()).await {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            tracing::error!(error = %e, "fatal error while connecting upstreams");
            std::process::exit(1);
        }
    };
    tracing::info!(upstreams = pool.names().await.len(), "upstream pool ready");

    let catalog = Arc::new(Catalog::new(pool.clone()));
    let modern = ModernSessionManager::new(catalog.clone(), args.per_session_cap());
    let legacy = LegacySessionManager::new(catalog);

    lifecycle::spawn_notification_relay(notifier, modern.clone(), legacy.clone());

    let state = AppState { modern: modern.clone(), legacy: legacy.clone() };
    let router = http::build_router(state, &args.health_endpoint, args.effective_cors());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = match lifecycle::bind_with_keepalive(addr) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "mcp-gateway listening");

    let shutdown = lifecycle::Lifecycle::new(pool, modern, legacy);
    let result = axum::serve(listener, router).with_graceful_shutdown(shutdown.wait_and_prepare()).await;

    if let Err(e) = result {
        tracing::error!(error = %e, "http server exited with an error");
        std::process::exit(1);
    }

    tracing::info!("shutdown complete");
    Ok(())
}
