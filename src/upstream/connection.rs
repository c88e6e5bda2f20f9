//! A single upstream MCP server connection: transport dispatch, capability
//! probing, and JSON-RPC method forwarding.
//!
//! Grounded on the teacher's `mcp/connection.rs` (`McpConnection`), extended
//! with the `http-with-fallback` probe (teacher always trusted the declared
//! transport) and a graceful-termination cap on disconnect (teacher just
//! called `service.cancel()` with no timeout).

use crate::types::{ConnectionState, NotificationSender, Prompt, Resource, Tool, TransportKind, UpstreamConfig};
use anyhow::{anyhow, Context, Result};
use rmcp::model::{CallToolRequestParams, LoggingMessageNotificationParam};
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{ClientHandler, Peer, RoleClient, ServiceExt};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::legacy_sse_client::{LegacySseClientConfig, LegacySseWorker};

/// Forwards server-initiated notifications (the ones the SDK exposes hooks
/// for, e.g. `notifications/message`) into the gateway-wide broadcast
/// channel so every client session sees them (spec §4.2 "Response routing").
/// Grounded on rmcp's own `tests/test_logging.rs::LoggingClient`.
struct GatewayClientHandler {
    upstream: String,
    notifier: NotificationSender,
    peer: Option<Peer<RoleClient>>,
}

impl GatewayClientHandler {
    fn new(upstream: String, notifier: NotificationSender) -> Self {
        Self { upstream, notifier, peer: None }
    }
}

impl ClientHandler for GatewayClientHandler {
    async fn on_logging_message(&self, params: LoggingMessageNotificationParam) {
        let envelope = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {
                "upstream": self.upstream,
                "level": params.level,
                "logger": params.logger,
                "data": params.data,
            },
        });
        // No subscribers yet (no client session open) is not an error.
        let _ = self.notifier.send(envelope);
    }

    fn set_peer(&mut self, peer: Peer<RoleClient>) {
        self.peer = Some(peer);
    }

    fn get_peer(&self) -> Option<Peer<RoleClient>> {
        self.peer.clone()
    }
}

/// Upper bound for the whole connect+probe sequence (spec §4.1).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `disconnect` waits for `service.cancel()` before giving up on
/// a graceful exit and simply dropping the service (spec §4.1.3).
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A single upstream connection and its cached capability catalog.
pub struct Upstream {
    pub name: String,
    pub config: UpstreamConfig,
    pub kind: TransportKind,
    notifier: NotificationSender,
    state: Arc<Mutex<ConnectionState>>,
    service: Arc<Mutex<Option<RunningService<RoleClient, GatewayClientHandler>>>>,
    tools: Arc<Mutex<Vec<Tool>>>,
    resources: Arc<Mutex<Vec<Resource>>>,
    prompts: Arc<Mutex<Vec<Prompt>>>,
    connected_at: Arc<Mutex<Option<chrono::DateTime<chrono::Utc>>>>,
    error_message: Arc<Mutex<Option<String>>>,
}

impl Upstream {
    pub fn new(config: UpstreamConfig, notifier: NotificationSender) -> Result<Self> {
        let kind = config.transport_kind().map_err(anyhow::Error::msg)?;
        Ok(Self {
            name: config.name.clone(),
            config,
            kind,
            notifier,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            service: Arc::new(Mutex::new(None)),
            tools: Arc::new(Mutex::new(Vec::new())),
            resources: Arc::new(Mutex::new(Vec::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            connected_at: Arc::new(Mutex::new(None)),
            error_message: Arc::new(Mutex::new(None)),
        })
    }

    fn make_handler(&self) -> GatewayClientHandler {
        GatewayClientHandler::new(self.name.clone(), self.notifier.clone())
    }

    pub async fn get_state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    async fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().await;
        tracing::info!(upstream = %self.name, from = ?*state, to = ?new_state, "connection state transition");
        *state = new_state;
        match new_state {
            ConnectionState::Connected => {
                *self.connected_at.lock().await = Some(chrono::Utc::now());
                *self.error_message.lock().await = None;
            }
            ConnectionState::Disconnected => {
                *self.connected_at.lock().await = None;
            }
            _ => {}
        }
    }

    /// Connect, then best-effort probe capabilities. On any failure the
    /// upstream is left in `Failed` state and the error returned; it is
    /// never retried automatically (spec §4.1: "no reconnection of
    /// upstreams that die after the initial connect").
    pub async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;

        let result = tokio::time::timeout(CONNECT_TIMEOUT, self.dispatch_connect()).await;

        match result {
            Ok(Ok(())) => {
                if let Err(e) = self.probe_capabilities().await {
                    tracing::warn!(upstream = %self.name, error = %e, "connected but capability probing failed");
                }
                self.set_state(ConnectionState::Connected).await;
                Ok(())
            }
            Ok(Err(e)) => {
                let detail = format!("{:#}", e);
                tracing::error!(upstream = %self.name, error = %detail, "connect failed");
                *self.error_message.lock().await = Some(detail);
                self.set_state(ConnectionState::Failed).await;
                Err(e)
            }
            Err(_) => {
                let detail = format!("connect did not complete within {:?}", CONNECT_TIMEOUT);
                *self.error_message.lock().await = Some(detail.clone());
                self.set_state(ConnectionState::Failed).await;
                Err(anyhow!(detail))
            }
        }
    }

    async fn dispatch_connect(&self) -> Result<()> {
        match self.kind {
            TransportKind::Stdio => self.connect_stdio().await,
            TransportKind::LegacySse => self.connect_legacy_sse(self.url()?).await,
            TransportKind::ModernHttp => self.connect_modern_http(self.url()?).await,
            TransportKind::HttpWithFallback => self.connect_with_fallback(self.url()?).await,
        }
    }

    fn url(&self) -> Result<&str> {
        self.config
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("upstream '{}' has no url", self.name))
    }

    /// Splits `command` the way a shell would split a single pasted line
    /// ("npx -y @foo/bar") while still honouring an explicit `args` list.
    async fn connect_stdio(&self) -> Result<()> {
        let command_str = self
            .config
            .command
            .as_ref()
            .ok_or_else(|| anyhow!("no command specified for stdio transport"))?
            .trim();

        if command_str.is_empty() {
            return Err(anyhow!("no command specified for stdio transport"));
        }

        let (executable, extra_args) = if let Some(space) = command_str.find(' ') {
            let (exe, rest) = command_str.split_at(space);
            let rest_args: Vec<String> = rest.trim().split_whitespace().map(str::to_string).collect();
            (exe.to_string(), rest_args)
        } else {
            (command_str.to_string(), Vec::new())
        };

        let mut args = self.config.args.clone().unwrap_or_default();
        args.splice(0..0, extra_args);

        let mut cmd = Command::new(&executable);
        cmd.args(&args).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

        if let Some(env) = &self.config.env {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        let full_cmd = format!("{} {}", executable, args.join(" ")).trim_end().to_string();
        let transport =
            TokioChildProcess::new(cmd).map_err(|e| anyhow!("failed to spawn '{}': {}", full_cmd, e))?;

        let service = self.make_handler().serve(transport).await.context("failed to initialize stdio MCP client")?;
        *self.service.lock().await = Some(service);
        Ok(())
    }

    async fn connect_legacy_sse(&self, url: &str) -> Result<()> {
        let mut config = LegacySseClientConfig::from_url(url).map_err(|e| anyhow!("invalid SSE url: {}", e))?;
        if let Some(headers) = &self.config.headers {
            config.headers = headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }

        let worker = LegacySseWorker::new(config);
        let transport = rmcp::transport::worker::WorkerTransport::spawn(worker);
        let service = self.make_handler().serve(transport).await.context("failed to initialize legacy SSE MCP client")?;
        *self.service.lock().await = Some(service);
        Ok(())
    }

    async fn connect_modern_http(&self, url: &str) -> Result<()> {
        let client = self.build_http_client()?;
        let config = StreamableHttpClientTransportConfig::with_uri(url);
        let transport = StreamableHttpClientTransport::with_client(client, config);
        let service = self.make_handler().serve(transport).await.context("failed to initialize streamable-HTTP MCP client")?;
        *self.service.lock().await = Some(service);
        Ok(())
    }

    fn build_http_client(&self) -> Result<reqwest::Client> {
        let mut builder =
            reqwest::Client::builder().connect_timeout(Duration::from_secs(30)).pool_idle_timeout(Duration::from_secs(90));

        if let Some(headers) = &self.config.headers {
            let mut header_map = reqwest::header::HeaderMap::new();
            for (key, value) in headers {
                if let (Ok(name), Ok(val)) =
                    (reqwest::header::HeaderName::from_bytes(key.as_bytes()), reqwest::header::HeaderValue::from_str(value))
                {
                    header_map.insert(name, val);
                } else {
                    tracing::warn!(upstream = %self.name, header = %key, "skipping invalid header");
                }
            }
            builder = builder.default_headers(header_map);
        }

        builder.build().context("failed to build HTTP client")
    }

    /// `http-with-fallback`: try the modern streaming client first; on any
    /// failure fall back to legacy SSE at `<base>/sse`, retrying the modern
    /// attempt first with 1s/2s/3s backoff before giving up and falling
    /// back (spec §4.1 "modern-http-with-fallback probing").
    async fn connect_with_fallback(&self, url: &str) -> Result<()> {
        let backoffs = [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3)];

        let mut last_err = None;
        for (attempt, backoff) in backoffs.iter().enumerate() {
            match self.connect_modern_http(url).await {
                Ok(()) => {
                    tracing::debug!(upstream = %self.name, "fallback probe: modern transport succeeded");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(
                        upstream = %self.name,
                        attempt = attempt + 1,
                        error = %e,
                        "fallback probe: modern transport failed, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(*backoff).await;
                }
            }
        }

        tracing::info!(upstream = %self.name, "fallback probe: falling back to legacy SSE");
        let sse_url = format!("{}/sse", url.trim_end_matches('/'));
        self.connect_legacy_sse(&sse_url).await.map_err(|sse_err| {
            anyhow!(
                "modern transport failed ({}); legacy SSE fallback also failed: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default(),
                sse_err
            )
        })
    }

    /// Populate the tool/resource/prompt caches. Each list call is
    /// independently best-effort: an upstream that only implements tools
    /// still becomes usable even if `resources/list`/`prompts/list` error
    /// out (spec §4.1 "capability probing").
    async fn probe_capabilities(&self) -> Result<()> {
        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;

        match service.list_tools(Default::default()).await {
            Ok(result) => {
                let tools: Vec<Tool> = result
                    .tools
                    .into_iter()
                    .map(|t| Tool {
                        name: t.name.to_string(),
                        description: t.description.map(|d| d.to_string()),
                        input_schema: serde_json::to_value(&t.input_schema).unwrap_or_default(),
                    })
                    .collect();
                tracing::info!(upstream = %self.name, count = tools.len(), "tools probed");
                *self.tools.lock().await = tools;
            }
            Err(e) => tracing::debug!(upstream = %self.name, error = %e, "tools/list not supported or failed"),
        }

        match service.list_resources(Default::default()).await {
            Ok(result) => {
                let resources: Vec<Resource> = result
                    .resources
                    .into_iter()
                    .map(|r| Resource {
                        uri: r.uri.to_string(),
                        name: Some(r.name.to_string()),
                        description: r.description.clone().map(|d| d.to_string()),
                        mime_type: r.mime_type.clone().map(|m| m.to_string()),
                    })
                    .collect();
                tracing::info!(upstream = %self.name, count = resources.len(), "resources probed");
                *self.resources.lock().await = resources;
            }
            Err(e) => tracing::debug!(upstream = %self.name, error = %e, "resources/list not supported or failed"),
        }

        match service.list_prompts(Default::default()).await {
            Ok(result) => {
                let prompts: Vec<Prompt> = result
                    .prompts
                    .into_iter()
                    .map(|p| Prompt {
                        name: p.name.to_string(),
                        description: p.description.map(|d| d.to_string()),
                        arguments: serde_json::to_value(&p.arguments).ok(),
                    })
                    .collect();
                tracing::info!(upstream = %self.name, count = prompts.len(), "prompts probed");
                *self.prompts.lock().await = prompts;
            }
            Err(e) => tracing::debug!(upstream = %self.name, error = %e, "prompts/list not supported or failed"),
        }

        Ok(())
    }

    pub async fn get_tools(&self) -> Vec<Tool> {
        self.tools.lock().await.clone()
    }

    pub async fn get_resources(&self) -> Vec<Resource> {
        self.resources.lock().await.clone()
    }

    pub async fn get_prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().await.clone()
    }

    pub async fn error_message(&self) -> Option<String> {
        self.error_message.lock().await.clone()
    }

    pub async fn connected_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        *self.connected_at.lock().await
    }

    /// Forward a single JSON-RPC method to this upstream, returning the
    /// `result` payload (not the envelope). The dispatch table covers every
    /// method the catalog can route (spec §4.4 "Routing").
    pub async fn execute_request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;

        let result = match method {
            "tools/list" => serde_json::to_value(service.list_tools(Default::default()).await.context("tools/list failed")?)?,
            "tools/call" => {
                let params: CallToolRequestParams = serde_json::from_value(params).context("invalid tools/call params")?;
                serde_json::to_value(service.call_tool(params).await.context("tools/call failed")?)?
            }
            "resources/list" => {
                serde_json::to_value(service.list_resources(Default::default()).await.context("resources/list failed")?)?
            }
            "resources/read" => {
                let params = serde_json::from_value(params).context("invalid resources/read params")?;
                serde_json::to_value(service.read_resource(params).await.context("resources/read failed")?)?
            }
            "prompts/list" => {
                serde_json::to_value(service.list_prompts(Default::default()).await.context("prompts/list failed")?)?
            }
            "prompts/get" => {
                let params = serde_json::from_value(params).context("invalid prompts/get params")?;
                serde_json::to_value(service.get_prompt(params).await.context("prompts/get failed")?)?
            }
            other => return Err(anyhow!("method not found: {}", other)),
        };

        Ok(result)
    }

    /// Graceful shutdown: give the transport `TERMINATE_GRACE` to cancel
    /// cleanly (for stdio this lets `TokioChildProcess` send a terminate
    /// signal to the child and reap it); past that we drop the service
    /// outright, which forces the underlying process/connection closed.
    pub async fn disconnect(&self) {
        if let Some(service) = self.service.lock().await.take() {
            match tokio::time::timeout(TERMINATE_GRACE, service.cancel()).await {
                Ok(Ok(_)) => tracing::debug!(upstream = %self.name, "disconnected cleanly"),
                Ok(Err(e)) => tracing::warn!(upstream = %self.name, error = %e, "error while cancelling service"),
                Err(_) => tracing::warn!(upstream = %self.name, "graceful termination timed out, dropping transport"),
            }
        }
        *self.tools.lock().await = Vec::new();
        *self.resources.lock().await = Vec::new();
        *self.prompts.lock().await = Vec::new();
        self.set_state(ConnectionState::Disconnected).await;
    }
}

/// Test-only constructor for an `Upstream` with a preset catalog and no real
/// transport, so routing logic (namespacing, ambiguous-name resolution) can
/// be exercised without a child process or network connection.
#[cfg(test)]
impl Upstream {
    pub async fn new_fake(name: &str, tools: Vec<Tool>, prompts: Vec<Prompt>, resources: Vec<Resource>) -> Arc<Self> {
        let config = UpstreamConfig {
            name: name.to_string(),
            command: Some("true".to_string()),
            args: None,
            env: None,
            url: None,
            headers: None,
            forced_type: None,
        };
        let notifier: NotificationSender = tokio::sync::broadcast::channel(1).0;
        let upstream = Self::new(config, notifier).expect("stdio config is always valid");
        *upstream.tools.lock().await = tools;
        *upstream.prompts.lock().await = prompts;
        *upstream.resources.lock().await = resources;
        *upstream.state.lock().await = ConnectionState::Connected;
        Arc::new(upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpstreamConfig;

    fn stdio_config(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            command: Some("echo".to_string()),
            args: Some(vec!["hi".to_string()]),
            env: None,
            url: None,
            headers: None,
            forced_type: None,
        }
    }

    fn notifier() -> NotificationSender {
        tokio::sync::broadcast::channel(16).0
    }

    #[test]
    fn new_rejects_unresolvable_transport() {
        let cfg = UpstreamConfig {
            name: "bad".to_string(),
            command: None,
            args: None,
            env: None,
            url: None,
            headers: None,
            forced_type: None,
        };
        assert!(Upstream::new(cfg, notifier()).is_err());
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let up = Upstream::new(stdio_config("a"), notifier()).unwrap();
        assert_eq!(up.get_state().await, ConnectionState::Disconnected);
        assert!(up.get_tools().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_a_noop() {
        let up = Upstream::new(stdio_config("a"), notifier()).unwrap();
        up.disconnect().await;
        assert_eq!(up.get_state().await, ConnectionState::Disconnected);
    }
}
