//! Legacy SSE client transport, used when an upstream forces `type: "sse"`
//! or when `http-with-fallback` probing falls back off a modern client.
//!
//! Old-style SSE MCP servers work like this:
//!   1. Client opens `GET <base_url>/sse` → server sends SSE events
//!   2. Server sends an `endpoint` event with a relative URL like
//!      `/messages?sessionId=xxx`
//!   3. Client sends JSON-RPC requests via `POST <base_url><endpoint>`
//!   4. Server sends JSON-RPC responses/notifications via the SSE stream
//!
//! Grounded on the teacher's `mcp/legacy_sse.rs` and on rmcp's own
//! `transport::sse_client::SseClientWorker`, generalized only to resolve the
//! base URL and messages endpoint itself rather than taking them pre-split.

use futures::StreamExt;
use reqwest::Client;
use rmcp::{
    model::ServerJsonRpcMessage,
    transport::worker::{Worker, WorkerConfig, WorkerContext, WorkerQuitReason, WorkerSendRequest},
    RoleClient,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LegacySseError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("SSE stream ended unexpectedly")]
    StreamEnded,
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone)]
pub struct LegacySseClientConfig {
    pub base_url: String,
    pub sse_path: String,
    pub headers: Vec<(String, String)>,
    pub channel_buffer_capacity: usize,
}

impl LegacySseClientConfig {
    /// Split a full SSE URL like "http://host:port/sse" into base + path.
    pub fn from_url(url: &str) -> Result<Self, LegacySseError> {
        let parsed =
            reqwest::Url::parse(url).map_err(|e| LegacySseError::InvalidUrl(format!("{}: {}", url, e)))?;

        let base_url = format!(
            "{}://{}{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or("localhost"),
            parsed.port().map(|p| format!(":{}", p)).unwrap_or_default()
        );

        Ok(Self {
            base_url,
            sse_path: parsed.path().to_string(),
            headers: Vec::new(),
            channel_buffer_capacity: 16,
        })
    }

    fn full_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }
}

pub struct LegacySseWorker {
    pub config: LegacySseClientConfig,
}

impl LegacySseWorker {
    pub fn new(config: LegacySseClientConfig) -> Self {
        Self { config }
    }
}

impl Worker for LegacySseWorker {
    type Role = RoleClient;
    type Error = LegacySseError;

    fn err_closed() -> Self::Error {
        LegacySseError::ChannelClosed
    }

    fn err_join(_e: tokio::task::JoinError) -> Self::Error {
        LegacySseError::ChannelClosed
    }

    fn config(&self) -> WorkerConfig {
        WorkerConfig {
            name: Some("LegacySseWorker".to_string()),
            channel_buffer_capacity: self.config.channel_buffer_capacity,
        }
    }

    async fn run(self, mut context: WorkerContext<Self>) -> Result<(), WorkerQuitReason> {
        let client = Client::new();
        let ct = context.cancellation_token.clone();

        tracing::info!(base_url = %self.config.base_url, path = %self.config.sse_path, "legacy sse: connecting");

        let sse_url = self.config.full_url(&self.config.sse_path);
        let mut request = client.get(&sse_url);
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(WorkerQuitReason::fatal_context("open SSE stream"))?;

        if !response.status().is_success() {
            return Err(WorkerQuitReason::fatal(
                format!("SSE endpoint returned status {}", response.status()),
                "open SSE stream",
            ));
        }

        let mut sse_stream = sse_stream::SseStream::from_byte_stream(response.bytes_stream());

        // Wait for the "endpoint" event giving us the messages URL.
        let messages_endpoint = loop {
            let sse = sse_stream
                .next()
                .await
                .ok_or_else(|| WorkerQuitReason::fatal("unexpected end of stream", "get the endpoint event"))?
                .map_err(WorkerQuitReason::fatal_context("get the endpoint event"))?;
            let Some("endpoint") = sse.event.as_deref() else {
                continue;
            };
            let Some(endpoint) = sse.data else {
                return Err(WorkerQuitReason::fatal(
                    "endpoint event without data",
                    "get the endpoint event",
                ));
            };
            break endpoint;
        };

        let messages_url = self.config.full_url(messages_endpoint.trim());
        tracing::debug!(messages_url = %messages_url, "legacy sse: resolved messages endpoint");

        // Forward the initialize request from rmcp, wait for the response on
        // the SSE stream, then forward the initialized notification.
        let WorkerSendRequest { message: init_request, responder: init_responder } =
            context.recv_from_handler().await?;

        let post_result = client
            .post(&messages_url)
            .header("Content-Type", "application/json")
            .json(&init_request)
            .send()
            .await
            .map(|_| ())
            .map_err(LegacySseError::Reqwest);
        let _ = init_responder.send(post_result);

        let init_response = Self::next_message(&mut sse_stream).await?;
        context.send_to_handler(init_response).await?;

        let WorkerSendRequest { message: initialized, responder: initialized_responder } =
            context.recv_from_handler().await?;

        client
            .post(&messages_url)
            .header("Content-Type", "application/json")
            .json(&initialized)
            .send()
            .await
            .map_err(WorkerQuitReason::fatal_context("send initialized notification"))?;
        let _ = initialized_responder.send(Ok(()));

        let (sse_tx, mut sse_rx) = tokio::sync::mpsc::channel::<ServerJsonRpcMessage>(self.config.channel_buffer_capacity);
        let sse_ct = ct.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sse_ct.cancelled() => break,
                    event = sse_stream.next() => {
                        match event {
                            Some(Ok(sse_event)) if sse_event.event.as_deref().unwrap_or("message") == "message" => {
                                let Some(data) = sse_event.data else { continue };
                                if data.trim().is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<ServerJsonRpcMessage>(data.trim()) {
                                    Ok(msg) => {
                                        if sse_tx.send(msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => tracing::warn!("legacy sse: failed to parse message: {e}"),
                                }
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                tracing::error!("legacy sse: stream error: {e}");
                                break;
                            }
                            None => {
                                tracing::info!("legacy sse: stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        loop {
            let result = tokio::select! {
                handler_msg = context.recv_from_handler() => {
                    let WorkerSendRequest { message, responder } = handler_msg?;
                    let post_result = client
                        .post(&messages_url)
                        .header("Content-Type", "application/json")
                        .json(&message)
                        .send()
                        .await;
                    let send_result = match post_result {
                        Ok(resp) if resp.status().is_success() => Ok(()),
                        Ok(resp) => Err(LegacySseError::InvalidUrl(format!("POST returned status {}", resp.status()))),
                        Err(e) => Err(LegacySseError::Reqwest(e)),
                    };
                    let _ = responder.send(send_result);
                    continue;
                }
                server_msg = sse_rx.recv() => {
                    match server_msg {
                        Some(msg) => context.send_to_handler(msg).await,
                        None => break Err(WorkerQuitReason::fatal("SSE stream closed", "wait for server message")),
                    }
                }
                _ = ct.cancelled() => break Err(WorkerQuitReason::Cancelled),
            };
            result?;
        }
    }
}

impl LegacySseWorker {
    async fn next_message(
        sse_stream: &mut (impl futures::Stream<Item = Result<sse_stream::Sse, sse_stream::Error>> + Unpin),
    ) -> Result<ServerJsonRpcMessage, WorkerQuitReason> {
        loop {
            let sse = sse_stream
                .next()
                .await
                .ok_or_else(|| WorkerQuitReason::fatal("unexpected end of stream", "wait for initialize response"))?
                .map_err(WorkerQuitReason::fatal_context("wait for initialize response"))?;
            if sse.event.as_deref().unwrap_or("message") != "message" {
                continue;
            }
            let Some(data) = sse.data else { continue };
            if data.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(data.trim())
                .map_err(WorkerQuitReason::fatal_context("parse initialize response"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_base_url_and_path() {
        let c = LegacySseClientConfig::from_url("http://localhost:9000/sse").unwrap();
        assert_eq!(c.base_url, "http://localhost:9000");
        assert_eq!(c.sse_path, "/sse");
    }

    #[test]
    fn full_url_keeps_absolute_paths() {
        let c = LegacySseClientConfig::from_url("http://localhost:9000/sse").unwrap();
        assert_eq!(c.full_url("https://other/x"), "https://other/x");
        assert_eq!(c.full_url("/messages?sessionId=1"), "http://localhost:9000/messages?sessionId=1");
    }
}
