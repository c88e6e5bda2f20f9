//! The set of all configured upstreams, connected with bounded parallelism.
//!
//! Grounded on the teacher's `mcp/manager.rs` (`McpManager::initialize`) for
//! the overall shape, and on the pack's `UpstreamPool` (HashMap-behind-lock
//! with add/remove/list/status accessors) for the storage pattern. The
//! bounded-parallelism connect-all fan-out has no teacher counterpart; it is
//! grounded on the CLI `--max-concurrent-server-connections` flag (spec §6).

use super::connection::Upstream;
use crate::types::{GatewayConfig, NotificationSender, UpstreamStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

/// Owns every configured upstream and lets the catalog look any of them up
/// by name.
pub struct UpstreamPool {
    upstreams: RwLock<HashMap<String, Arc<Upstream>>>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self { upstreams: RwLock::new(HashMap::new()) }
    }

    /// Build one `Upstream` per configured entry and connect all of them
    /// concurrently, bounded by `parallelism` (spec §4.1 "Connect-all").
    /// A connection failure never aborts the others — every upstream ends
    /// up in the pool regardless of whether its connect succeeded, so a
    /// single bad entry cannot block the rest of the gateway from serving.
    pub async fn connect_all(config: &GatewayConfig, parallelism: usize, notifier: NotificationSender) -> anyhow::Result<Self> {
        let pool = Self::new();
        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));

        let mut handles = Vec::with_capacity(config.mcp_servers.len());
        for upstream_config in config.mcp_servers.values().cloned() {
            let sem = semaphore.clone();
            let notifier = notifier.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore never closed");
                let name = upstream_config.name.clone();
                let upstream = match Upstream::new(upstream_config, notifier) {
                    Ok(up) => Arc::new(up),
                    Err(e) => {
                        tracing::error!(upstream = %name, error = %e, "invalid upstream configuration");
                        return (name, None);
                    }
                };

                if let Err(e) = upstream.connect().await {
                    tracing::warn!(upstream = %name, error = %e, "upstream failed to connect, remaining in Failed state");
                }

                (name, Some(upstream))
            }));
        }

        // Every spawned task is awaited individually so a panic or failure
        // in one connect attempt never loses the result of another.
        for handle in handles {
            let (name, upstream) = handle.await?;
            if let Some(upstream) = upstream {
                pool.upstreams.write().await.insert(name, upstream);
            }
        }

        Ok(pool)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Upstream>> {
        self.upstreams.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.upstreams.read().await.keys().cloned().collect()
    }

    pub async fn all(&self) -> Vec<Arc<Upstream>> {
        self.upstreams.read().await.values().cloned().collect()
    }

    /// Disconnect and remove a single upstream (used by graceful shutdown).
    pub async fn disconnect(&self, name: &str) {
        let upstream = self.upstreams.write().await.remove(name);
        if let Some(upstream) = upstream {
            upstream.disconnect().await;
        }
    }

    /// Disconnect every upstream in parallel, each individually capped at
    /// 10s (spec §4.5 "Shutdown" step 1). An upstream whose disconnect
    /// doesn't finish in time is abandoned — its child, if any, has already
    /// been sent the forceful kill signal by `Upstream::disconnect`'s own
    /// internal grace period, so there's nothing further to wait for.
    pub async fn disconnect_all(&self) {
        const PER_UPSTREAM_CAP: std::time::Duration = std::time::Duration::from_secs(10);
        let upstreams = self.upstreams.write().await.drain().map(|(_, v)| v).collect::<Vec<_>>();
        let handles: Vec<_> = upstreams
            .into_iter()
            .map(|up| {
                tokio::spawn(async move {
                    let name = up.name.clone();
                    if tokio::time::timeout(PER_UPSTREAM_CAP, up.disconnect()).await.is_err() {
                        tracing::warn!(upstream = %name, "disconnect exceeded 10s cap, abandoning");
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn statuses(&self) -> Vec<UpstreamStatus> {
        let upstreams = self.upstreams.read().await;
        let mut statuses = Vec::with_capacity(upstreams.len());
        for upstream in upstreams.values() {
            statuses.push(UpstreamStatus {
                name: upstream.name.clone(),
                kind: upstream.kind,
                state: upstream.get_state().await,
                tools_count: upstream.get_tools().await.len(),
                resources_count: upstream.get_resources().await.len(),
                prompts_count: upstream.get_prompts().await.len(),
                connected_at: upstream.connected_at().await,
                error_message: upstream.error_message().await,
            });
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Test-only: register an already-"connected" fake upstream directly,
/// bypassing `connect_all`'s real dial/probe sequence.
#[cfg(test)]
impl UpstreamPool {
    pub async fn insert_for_test(&self, upstream: Arc<Upstream>) {
        self.upstreams.write().await.insert(upstream.name.clone(), upstream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_pool_has_no_upstreams() {
        let pool = UpstreamPool::new();
        assert!(pool.names().await.is_empty());
        assert!(pool.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn get_missing_upstream_is_none() {
        let pool = UpstreamPool::new();
        assert!(pool.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn disconnect_missing_upstream_is_a_noop() {
        let pool = UpstreamPool::new();
        pool.disconnect("nope").await;
        pool.disconnect_all().await;
    }
}
