//! Shutdown orchestration and listener setup (spec §4.5 "Shutdown", §4.4
//! "Connection tuning").
//!
//! The per-step timeout budget here has no direct teacher counterpart — the
//! teacher is a desktop app torn down by its own window manager, not a
//! server with a graceful-shutdown contract — so this is grounded on the
//! spec's own step list plus the ctrl_c/SIGTERM `tokio::select!` pattern
//! used throughout the pack's long-running services (e.g. agentgateway's
//! `signal.rs`).

use crate::session::{LegacySessionManager, ModernSessionManager};
use crate::types::NotificationSender;
use crate::upstream::UpstreamPool;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SESSION_CLOSE_CAP: Duration = Duration::from_secs(2);
const LISTENER_CLOSE_CAP: Duration = Duration::from_secs(5);

/// Coordinates the four-step shutdown sequence: disconnect upstreams, close
/// both session managers, then let the HTTP listener drain — each step
/// individually capped, with a second shutdown signal forcing immediate
/// exit regardless of where the sequence has gotten to.
pub struct Lifecycle {
    pool: Arc<UpstreamPool>,
    modern: Arc<ModernSessionManager>,
    legacy: Arc<LegacySessionManager>,
    shutting_down: AtomicBool,
}

impl Lifecycle {
    pub fn new(pool: Arc<UpstreamPool>, modern: Arc<ModernSessionManager>, legacy: Arc<LegacySessionManager>) -> Arc<Self> {
        Arc::new(Self { pool, modern, legacy, shutting_down: AtomicBool::new(false) })
    }

    /// The future handed to `axum::serve(..).with_graceful_shutdown(..)`.
    /// It resolves only once upstreams are disconnected and sessions are
    /// closed, so axum closes the listener (spec step 3) last, not first.
    pub async fn wait_and_prepare(self: Arc<Self>) {
        wait_for_os_signal().await;
        tracing::info!("shutdown signal received, beginning graceful shutdown");

        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        // A second signal during an in-progress shutdown skips the rest of
        // the sequence entirely (spec §4.5 "a second signal forces exit").
        tokio::spawn(async {
            wait_for_os_signal().await;
            tracing::error!("second shutdown signal received mid-shutdown, forcing exit");
            std::process::exit(1);
        });

        tracing::info!("shutdown: disconnecting upstreams");
        self.pool.disconnect_all().await;

        tracing::info!("shutdown: closing sessions");
        let (modern_result, legacy_result) = tokio::join!(
            tokio::time::timeout(SESSION_CLOSE_CAP, self.modern.close_all()),
            tokio::time::timeout(SESSION_CLOSE_CAP, self.legacy.close_all()),
        );
        if modern_result.is_err() {
            tracing::warn!("closing modern sessions exceeded the 2s cap");
        }
        if legacy_result.is_err() {
            tracing::warn!("closing legacy sessions exceeded the 2s cap");
        }

        tracing::info!("shutdown: closing HTTP listener");
        tokio::spawn(async {
            tokio::time::sleep(LISTENER_CLOSE_CAP).await;
            tracing::error!("listener close exceeded the 5s cap, forcing exit");
            std::process::exit(1);
        });
    }
}

async fn wait_for_os_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Relay every upstream notification to both session managers so it reaches
/// every open client session regardless of which transport it used to
/// connect (spec §4.2 "Response routing").
pub fn spawn_notification_relay(notifier: NotificationSender, modern: Arc<ModernSessionManager>, legacy: Arc<LegacySessionManager>) {
    let mut receiver = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(notification) => {
                    modern.broadcast_notification(notification.clone()).await;
                    legacy.broadcast_notification(notification).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Bind the HTTP listener with TCP keep-alive probing enabled on the
/// accepting socket (spec §4.4 "Connection tuning": "enable TCP keep-alive
/// with 15s probes; disable the read timeout" — axum/hyper impose no read
/// timeout unless one is explicitly configured, so the latter already
/// holds by default).
pub fn bind_with_keepalive(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(15)).with_interval(Duration::from_secs(15));
    socket.set_tcp_keepalive(&keepalive)?;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    std_listener.set_nonblocking(true)?;
    Ok(tokio::net::TcpListener::from_std(std_listener)?)
}
