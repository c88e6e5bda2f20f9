//! Shared data types (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The reserved separator between an upstream name and a tool/prompt name.
pub const TOOL_SEPARATOR: char = '.';
/// The reserved separator between an upstream name and a resource URI.
pub const RESOURCE_SEPARATOR: &str = "://";

/// How an upstream is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    ModernHttp,
    LegacySse,
    HttpWithFallback,
}

/// Connection lifecycle state of a single upstream (spec §3 Upstream).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

/// One entry of `mcpServers` in the configuration file (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Not part of the JSON body — filled in from the map key.
    #[serde(skip)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub forced_type: Option<String>,
}

impl UpstreamConfig {
    /// Resolve the transport kind per spec §4.1 "Transport selection".
    pub fn transport_kind(&self) -> Result<TransportKind, String> {
        if self.command.is_some() {
            return Ok(TransportKind::Stdio);
        }
        let Some(_) = &self.url else {
            return Err(format!(
                "upstream '{}' has neither `command` nor `url`",
                self.name
            ));
        };
        match self.forced_type.as_deref() {
            Some("sse") => Ok(TransportKind::LegacySse),
            Some("stream") => Ok(TransportKind::ModernHttp),
            Some("http") | None => Ok(TransportKind::HttpWithFallback),
            Some(other) => Err(format!(
                "upstream '{}' has unknown type '{}'",
                self.name, other
            )),
        }
    }

    /// Validate the name itself against the reserved separators (spec §3).
    pub fn validate_name(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("upstream name must not be empty".to_string());
        }
        if self.name.contains(TOOL_SEPARATOR) {
            return Err(format!(
                "upstream name '{}' must not contain the reserved separator '.'",
                self.name
            ));
        }
        if self.name.contains(RESOURCE_SEPARATOR) {
            return Err(format!(
                "upstream name '{}' must not contain the reserved separator '://'",
                self.name
            ));
        }
        Ok(())
    }
}

/// Top level configuration file shape: `{ "mcpServers": { name: {..} } }`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, UpstreamConfig>,
}

/// A tool as advertised by an upstream, before namespacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// A resource as advertised by an upstream, before namespacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "mimeType")]
    pub mime_type: Option<String>,
}

/// A prompt as advertised by an upstream, before namespacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// Fan-out channel for upstream notifications (spec §4.2 "Response routing":
/// "Notifications (no id) from upstreams are broadcast to every client
/// session"). Shared by every `Upstream` on the producing side and by both
/// session managers on the consuming side.
pub type NotificationSender = tokio::sync::broadcast::Sender<serde_json::Value>;

/// Status snapshot for `list_servers` and the `/mcps` style introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamStatus {
    pub name: String,
    pub kind: TransportKind,
    pub state: ConnectionState,
    pub tools_count: usize,
    pub resources_count: usize,
    pub prompts_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            command: None,
            args: None,
            env: None,
            url: None,
            headers: None,
            forced_type: None,
        }
    }

    #[test]
    fn stdio_wins_when_command_present() {
        let mut c = cfg("a");
        c.command = Some("foo".into());
        c.url = Some("http://x".into());
        assert_eq!(c.transport_kind().unwrap(), TransportKind::Stdio);
    }

    #[test]
    fn url_without_type_defaults_to_fallback() {
        let mut c = cfg("a");
        c.url = Some("http://x".into());
        assert_eq!(c.transport_kind().unwrap(), TransportKind::HttpWithFallback);
    }

    #[test]
    fn forced_sse_type() {
        let mut c = cfg("a");
        c.url = Some("http://x".into());
        c.forced_type = Some("sse".into());
        assert_eq!(c.transport_kind().unwrap(), TransportKind::LegacySse);
    }

    #[test]
    fn neither_command_nor_url_is_an_error() {
        let c = cfg("a");
        assert!(c.transport_kind().is_err());
    }

    #[test]
    fn reserved_separator_in_name_rejected() {
        let c = cfg("a.b");
        assert!(c.validate_name().is_err());
        let c2 = cfg("a://b");
        assert!(c2.validate_name().is_err());
    }
}
