//! Catalog aggregation and namespaced routing (spec §4.2).
//!
//! Grounded on the teacher's `proxy/server.rs::handle_single_request` for
//! the "dispatch one JSON-RPC method" shape, and on the pack's agentgateway
//! `mcp/session.rs` (`parse_resource_name`, `send_single`) for the
//! namespaced-name split-and-route pattern. The management tools
//! (`list_servers`, `get_server_info`) and the unprefixed-name fallback have
//! no direct teacher counterpart and are grounded on spec §4.2 alone.

use crate::error::GatewayError;
use crate::types::{Prompt, Resource, Tool, RESOURCE_SEPARATOR, TOOL_SEPARATOR};
use crate::upstream::UpstreamPool;
use serde_json::{json, Value};
use std::sync::Arc;

pub const LIST_SERVERS_TOOL: &str = "list_servers";
pub const GET_SERVER_INFO_TOOL: &str = "get_server_info";

/// Shared, read-mostly view over the upstream pool that resolves namespaced
/// names to (upstream, local name) pairs and aggregates capability lists.
pub struct Catalog {
    pool: Arc<UpstreamPool>,
}

impl Catalog {
    pub fn new(pool: Arc<UpstreamPool>) -> Self {
        Self { pool }
    }

    /// Dispatch one already-parsed JSON-RPC method/params pair. Used by
    /// both session managers so routing behavior never drifts between the
    /// two transports (spec §9 "handler-copy-to-child-server pattern").
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        match method {
            "initialize" => Ok(Self::initialize_result()),
            "notifications/initialized" | "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.list_tools().await })),
            "resources/list" => Ok(json!({ "resources": self.list_resources().await })),
            "prompts/list" => Ok(json!({ "prompts": self.list_prompts().await })),
            "tools/call" => self.call_tool(params).await,
            "prompts/get" => self.get_prompt(params).await,
            "resources/read" => self.read_resource(params).await,
            other => Err(GatewayError::UnknownTarget(other.to_string())),
        }
    }

    /// The gateway's own `initialize` response. Shared by both session
    /// managers (spec §9 "handler-copy-to-child-server pattern": one
    /// dispatcher, not a copy per transport) — the modern manager calls this
    /// directly because it also has session-creation bookkeeping to do
    /// around it; the legacy manager reaches it through `dispatch` like any
    /// other method, since a legacy client's `initialize` arrives as just
    /// another POST `/messages` body.
    pub fn initialize_result() -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
            "serverInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") },
        })
    }

    /// Live re-probe of every upstream's `tools/list`, namespaced and
    /// merged with the two management tools (spec §9 Open Question: the
    /// startup-time cache is a warm start only, not the source of truth).
    pub async fn list_tools(&self) -> Vec<Value> {
        let mut merged = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for upstream in self.pool.all().await {
            let live = upstream.execute_request("tools/list", Value::Null).await;
            let tools: Vec<Tool> = match live {
                Ok(result) => serde_json::from_value::<ListToolsResult>(result).map(|r| r.tools).unwrap_or_default(),
                Err(_) => upstream.get_tools().await,
            };
            for tool in tools {
                let namespaced = format!("{}{}{}", upstream.name, TOOL_SEPARATOR, tool.name);
                if !seen.insert(namespaced.clone()) {
                    tracing::warn!(name = %namespaced, "skipping colliding tool name");
                    continue;
                }
                merged.push(json!({
                    "name": namespaced,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                }));
            }
        }

        merged.push(management_tool_schema(
            LIST_SERVERS_TOOL,
            "List every configured upstream with its transport kind and catalog counts.",
            json!({ "type": "object", "properties": {} }),
        ));
        merged.push(management_tool_schema(
            GET_SERVER_INFO_TOOL,
            "Return the full tool/resource/prompt catalog for one upstream.",
            json!({
                "type": "object",
                "properties": { "serverName": { "type": "string" } },
                "required": ["serverName"],
            }),
        ));

        merged
    }

    pub async fn list_resources(&self) -> Vec<Value> {
        let mut merged = Vec::new();
        for upstream in self.pool.all().await {
            let live = upstream.execute_request("resources/list", Value::Null).await;
            let resources: Vec<Resource> = match live {
                Ok(result) => {
                    serde_json::from_value::<ListResourcesResult>(result).map(|r| r.resources).unwrap_or_default()
                }
                Err(_) => upstream.get_resources().await,
            };
            for resource in resources {
                merged.push(json!({
                    "uri": format!("{}{}{}", upstream.name, RESOURCE_SEPARATOR, resource.uri),
                    "name": resource.name,
                    "description": resource.description,
                    "mimeType": resource.mime_type,
                }));
            }
        }
        merged
    }

    pub async fn list_prompts(&self) -> Vec<Value> {
        let mut merged = Vec::new();
        for upstream in self.pool.all().await {
            let live = upstream.execute_request("prompts/list", Value::Null).await;
            let prompts: Vec<Prompt> = match live {
                Ok(result) => serde_json::from_value::<ListPromptsResult>(result).map(|r| r.prompts).unwrap_or_default(),
                Err(_) => upstream.get_prompts().await,
            };
            for prompt in prompts {
                merged.push(json!({
                    "name": format!("{}{}{}", upstream.name, TOOL_SEPARATOR, prompt.name),
                    "description": prompt.description,
                    "arguments": prompt.arguments,
                }));
            }
        }
        merged
    }

    async fn call_tool(&self, params: Value) -> Result<Value, GatewayError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::ClientProtocolError("tools/call missing 'name'".into()))?
            .to_string();

        if name == LIST_SERVERS_TOOL {
            return self.list_servers_tool_result().await;
        }
        if name == GET_SERVER_INFO_TOOL {
            return self.get_server_info_tool_result(&params).await;
        }

        let (upstream_name, local_name) = self.resolve_tool(&name).await?;
        let upstream = self.pool.get(&upstream_name).await.ok_or_else(|| GatewayError::UnknownUpstream(upstream_name.clone()))?;

        let mut forwarded = params.clone();
        forwarded["name"] = Value::String(local_name);
        upstream
            .execute_request("tools/call", forwarded)
            .await
            .map_err(|e| GatewayError::InternalForwardingFailure(e.to_string()))
    }

    async fn get_prompt(&self, params: Value) -> Result<Value, GatewayError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::ClientProtocolError("prompts/get missing 'name'".into()))?
            .to_string();

        let (upstream_name, local_name) = self.resolve_prompt(&name).await?;
        let upstream = self.pool.get(&upstream_name).await.ok_or_else(|| GatewayError::UnknownUpstream(upstream_name.clone()))?;

        let mut forwarded = params.clone();
        forwarded["name"] = Value::String(local_name);
        upstream
            .execute_request("prompts/get", forwarded)
            .await
            .map_err(|e| GatewayError::InternalForwardingFailure(e.to_string()))
    }

    async fn read_resource(&self, params: Value) -> Result<Value, GatewayError> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::ClientProtocolError("resources/read missing 'uri'".into()))?
            .to_string();

        let (upstream_name, local_uri) = self.resolve_resource(&uri).await?;
        let upstream = self.pool.get(&upstream_name).await.ok_or_else(|| GatewayError::UnknownUpstream(upstream_name.clone()))?;

        let mut forwarded = params.clone();
        forwarded["uri"] = Value::String(local_uri);
        upstream
            .execute_request("resources/read", forwarded)
            .await
            .map_err(|e| GatewayError::InternalForwardingFailure(e.to_string()))
    }

    /// Split on the first `.`; with no separator, fall back to a
    /// unique-lookup-by-bare-name across every upstream's cached tool list
    /// (spec §4.2 "Routing rules").
    async fn resolve_tool(&self, name: &str) -> Result<(String, String), GatewayError> {
        if let Some(idx) = name.find(TOOL_SEPARATOR) {
            let (prefix, rest) = name.split_at(idx);
            return Ok((prefix.to_string(), rest[1..].to_string()));
        }
        self.resolve_unprefixed(name, |tools| tools.iter().any(|t| t.name == name)).await
    }

    async fn resolve_prompt(&self, name: &str) -> Result<(String, String), GatewayError> {
        if let Some(idx) = name.find(TOOL_SEPARATOR) {
            let (prefix, rest) = name.split_at(idx);
            return Ok((prefix.to_string(), rest[1..].to_string()));
        }
        self.resolve_unprefixed_prompts(name).await
    }

    /// Splitting on the FIRST `://` exactly reverses the namespacing, even
    /// when the original URI itself contains a scheme separator further in
    /// (spec §9 Open Question: preserve the original URI bytes verbatim).
    async fn resolve_resource(&self, uri: &str) -> Result<(String, String), GatewayError> {
        if let Some(idx) = uri.find(RESOURCE_SEPARATOR) {
            let (prefix, rest) = uri.split_at(idx);
            return Ok((prefix.to_string(), rest[RESOURCE_SEPARATOR.len()..].to_string()));
        }
        self.resolve_unprefixed_resources(uri).await
    }

    async fn resolve_unprefixed(
        &self,
        name: &str,
        matches: impl Fn(&[Tool]) -> bool,
    ) -> Result<(String, String), GatewayError> {
        let mut owners = Vec::new();
        for upstream in self.pool.all().await {
            let tools = upstream.get_tools().await;
            if matches(&tools) {
                owners.push(upstream.name.clone());
            }
        }
        self.pick_owner(name, owners)
    }

    async fn resolve_unprefixed_prompts(&self, name: &str) -> Result<(String, String), GatewayError> {
        let mut owners = Vec::new();
        for upstream in self.pool.all().await {
            if upstream.get_prompts().await.iter().any(|p| p.name == name) {
                owners.push(upstream.name.clone());
            }
        }
        self.pick_owner(name, owners)
    }

    async fn resolve_unprefixed_resources(&self, uri: &str) -> Result<(String, String), GatewayError> {
        let mut owners = Vec::new();
        for upstream in self.pool.all().await {
            if upstream.get_resources().await.iter().any(|r| r.uri == uri) {
                owners.push(upstream.name.clone());
            }
        }
        self.pick_owner(uri, owners)
    }

    fn pick_owner(&self, name: &str, mut owners: Vec<String>) -> Result<(String, String), GatewayError> {
        match owners.len() {
            0 => Err(GatewayError::UnknownTarget(name.to_string())),
            1 => {
                let owner = owners.remove(0);
                Ok((owner, name.to_string()))
            }
            _ => {
                owners.sort();
                let forms = owners.iter().map(|o| format!("{}.{}", o, name)).collect::<Vec<_>>().join(", ");
                Err(GatewayError::AmbiguousTarget(name.to_string(), forms))
            }
        }
    }

    async fn list_servers_tool_result(&self) -> Result<Value, GatewayError> {
        let statuses = self.pool.statuses().await;
        Ok(json!({
            "content": [{ "type": "text", "text": serde_json::to_string(&statuses).unwrap_or_default() }],
            "servers": statuses,
        }))
    }

    async fn get_server_info_tool_result(&self, params: &Value) -> Result<Value, GatewayError> {
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        let server_name = arguments
            .get("serverName")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::ClientProtocolError("get_server_info requires 'serverName'".into()))?;

        let upstream = self.pool.get(server_name).await.ok_or_else(|| GatewayError::UnknownUpstream(server_name.to_string()))?;

        let detail = json!({
            "name": upstream.name,
            "kind": upstream.kind,
            "state": upstream.get_state().await,
            "connectedAt": upstream.connected_at().await,
            "tools": upstream.get_tools().await,
            "resources": upstream.get_resources().await,
            "prompts": upstream.get_prompts().await,
        });

        Ok(json!({
            "content": [{ "type": "text", "text": serde_json::to_string(&detail).unwrap_or_default() }],
            "server": detail,
        }))
    }
}

fn management_tool_schema(name: &str, description: &str, input_schema: Value) -> Value {
    json!({ "name": name, "description": description, "inputSchema": input_schema })
}

#[derive(serde::Deserialize, Default)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<Tool>,
}

#[derive(serde::Deserialize, Default)]
struct ListResourcesResult {
    #[serde(default)]
    resources: Vec<Resource>,
}

#[derive(serde::Deserialize, Default)]
struct ListPromptsResult {
    #[serde(default)]
    prompts: Vec<Prompt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_catalog_still_exposes_management_tools() {
        let catalog = Catalog::new(Arc::new(UpstreamPool::new()));
        let tools = catalog.list_tools().await;
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&LIST_SERVERS_TOOL));
        assert!(names.contains(&GET_SERVER_INFO_TOOL));
    }

    /// A legacy SSE client's `initialize` arrives through `dispatch` like any
    /// other posted message (no separate session-creation path the way the
    /// modern transport has), so it has to be handled here too.
    #[tokio::test]
    async fn initialize_is_handled_via_dispatch() {
        let catalog = Catalog::new(Arc::new(UpstreamPool::new()));
        let result = catalog.dispatch("initialize", json!({})).await.unwrap();
        assert_eq!(result["serverInfo"]["name"], "mcp-gateway");
    }

    #[tokio::test]
    async fn unknown_tool_call_is_unknown_target() {
        let catalog = Catalog::new(Arc::new(UpstreamPool::new()));
        let err = catalog.call_tool(json!({ "name": "nope" })).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn get_server_info_unknown_upstream_errors() {
        let catalog = Catalog::new(Arc::new(UpstreamPool::new()));
        let err = catalog
            .call_tool(json!({ "name": GET_SERVER_INFO_TOOL, "arguments": { "serverName": "nope" } }))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownUpstream(_)));
    }

    #[test]
    fn namespaced_tool_name_splits_on_first_dot() {
        let name = "fs.read.file";
        let idx = name.find(TOOL_SEPARATOR).unwrap();
        let (prefix, rest) = name.split_at(idx);
        assert_eq!(prefix, "fs");
        assert_eq!(&rest[1..], "read.file");
    }

    #[test]
    fn namespaced_resource_uri_splits_on_first_triple_slash_arrow() {
        let uri = "fs://file:///etc/passwd";
        let idx = uri.find(RESOURCE_SEPARATOR).unwrap();
        let (prefix, rest) = uri.split_at(idx);
        assert_eq!(prefix, "fs");
        assert_eq!(&rest[RESOURCE_SEPARATOR.len()..], "file:///etc/passwd");
    }

    fn fake_tool(name: &str) -> Tool {
        Tool { name: name.to_string(), description: None, input_schema: json!({ "type": "object" }) }
    }

    /// Spec §8 boundary scenario 5: two upstreams both advertising tool `t`,
    /// called unprefixed, must fail with the disambiguated `"A.t"`/`"B.t"`
    /// forms named in the error message.
    #[tokio::test]
    async fn ambiguous_unprefixed_tool_call_names_both_upstreams() {
        let pool = Arc::new(UpstreamPool::new());
        pool.insert_for_test(crate::upstream::Upstream::new_fake("a", vec![fake_tool("t")], vec![], vec![]).await).await;
        pool.insert_for_test(crate::upstream::Upstream::new_fake("b", vec![fake_tool("t")], vec![], vec![]).await).await;
        let catalog = Catalog::new(pool);

        let err = catalog.call_tool(json!({ "name": "t" })).await.unwrap_err();
        let GatewayError::AmbiguousTarget(name, forms) = err else { panic!("expected AmbiguousTarget, got {err:?}") };
        assert_eq!(name, "t");
        assert!(forms.contains("a.t"), "forms: {forms}");
        assert!(forms.contains("b.t"), "forms: {forms}");
    }

    /// An unprefixed call that resolves to exactly one upstream routes there
    /// without needing the `.` form at all.
    #[tokio::test]
    async fn unique_unprefixed_tool_call_resolves() {
        let pool = Arc::new(UpstreamPool::new());
        pool.insert_for_test(crate::upstream::Upstream::new_fake("a", vec![fake_tool("only")], vec![], vec![]).await).await;
        let catalog = Catalog::new(pool);

        let (upstream, local) = catalog.resolve_tool("only").await.unwrap();
        assert_eq!(upstream, "a");
        assert_eq!(local, "only");
    }

    /// `tools/list` aggregates across upstreams and always appends the two
    /// management tools, with every upstream-sourced name namespaced
    /// (spec §8 round-trip law: "exactly (Σ tool counts) + 2").
    #[tokio::test]
    async fn tools_list_aggregates_and_namespaces() {
        let pool = Arc::new(UpstreamPool::new());
        pool.insert_for_test(crate::upstream::Upstream::new_fake("a", vec![fake_tool("x"), fake_tool("y")], vec![], vec![]).await).await;
        pool.insert_for_test(crate::upstream::Upstream::new_fake("b", vec![fake_tool("z")], vec![], vec![]).await).await;
        let catalog = Catalog::new(pool);

        let tools = catalog.list_tools().await;
        assert_eq!(tools.len(), 3 + 2);
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&"a.x"));
        assert!(names.contains(&"a.y"));
        assert!(names.contains(&"b.z"));
        assert!(names.contains(&LIST_SERVERS_TOOL));
        assert!(names.contains(&GET_SERVER_INFO_TOOL));
    }
}
