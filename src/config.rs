//! Configuration-file loading and validation (spec §6 "Configuration file").

use crate::types::GatewayConfig;
use anyhow::{Context, Result};
use std::path::Path;

/// Load and validate the `mcpServers` configuration file.
///
/// Mirrors the teacher's `ConfigManager::load`, but the gateway has no
/// default-on-missing-file behaviour: an absent or malformed config file is
/// a startup failure (spec §7 `ConfigInvalid`), not a silent default.
pub fn load(path: &Path) -> Result<GatewayConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;

    let mut config: GatewayConfig =
        serde_json::from_str(&data).with_context(|| format!("failed to parse config file {:?}", path))?;

    for (name, upstream) in config.mcp_servers.iter_mut() {
        upstream.name = name.clone();
    }

    validate(&config).map_err(anyhow::Error::msg)?;

    tracing::info!(
        upstreams = config.mcp_servers.len(),
        path = ?path,
        "loaded configuration"
    );

    Ok(config)
}

/// Validate a config structure (spec §6: "Must contain at least one entry").
pub fn validate(config: &GatewayConfig) -> Result<(), String> {
    if config.mcp_servers.is_empty() {
        return Err("configuration must contain at least one entry in `mcpServers`".to_string());
    }

    for upstream in config.mcp_servers.values() {
        upstream.validate_name()?;
        upstream.transport_kind()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct TempFile {
        path: std::path::PathBuf,
    }

    impl TempFile {
        fn new(contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!("mcp-gateway-test-{}.json", uuid::Uuid::new_v4()));
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(contents.as_bytes()).unwrap();
            Self { path }
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[test]
    fn empty_mcp_servers_refused() {
        let cfg = GatewayConfig::default();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn loads_valid_config() {
        let f = TempFile::new(r#"{ "mcpServers": { "fs": { "command": "npx", "args": ["-y", "x"] } } }"#);
        let cfg = load(&f.path).unwrap();
        assert_eq!(cfg.mcp_servers.len(), 1);
        assert_eq!(cfg.mcp_servers["fs"].name, "fs");
    }

    #[test]
    fn rejects_missing_file() {
        assert!(load(Path::new("/nonexistent/path.json")).is_err());
    }
}
