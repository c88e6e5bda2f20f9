//! CLI surface (spec §6 "CLI surface").

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    None,
    Debug,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-gateway", about = "Aggregating gateway for the Model Context Protocol")]
pub struct Args {
    /// Path to the mcpServers configuration file.
    #[arg(short = 'c', long = "config", required = true)]
    pub config: PathBuf,

    /// Port the HTTP surface listens on.
    #[arg(long, default_value_t = 3006)]
    pub port: u16,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Shorthand for `--log-level debug`.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Enable permissive CORS on the HTTP surface.
    #[arg(long, default_value_t = true)]
    pub cors: bool,

    /// A health-check path; may be repeated.
    #[arg(long = "health-endpoint")]
    pub health_endpoint: Vec<String>,

    /// Upstream connect timeout, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub timeout: u64,

    /// Max concurrent in-flight requests per modern session.
    #[arg(long, default_value_t = 10)]
    pub max_concurrent_requests_per_session: i64,

    /// Max concurrent parallel upstream connect attempts; non-positive means unbounded.
    #[arg(long, default_value_t = 0)]
    pub max_concurrent_server_connections: i64,

    /// Second OPTIONS/CLI alias kept for older invocations: `-> --cors=false`.
    #[arg(long, default_value_t = false)]
    pub no_cors: bool,
}

impl Args {
    pub fn effective_log_level(&self) -> LogLevel {
        if self.debug {
            LogLevel::Debug
        } else {
            self.log_level
        }
    }

    pub fn effective_cors(&self) -> bool {
        self.cors && !self.no_cors
    }

    /// Collapses non-positive/unset inputs to "unbounded" per spec §4.1.
    pub fn bounded_parallelism(&self, total_upstreams: usize) -> usize {
        if self.max_concurrent_server_connections > 0 {
            self.max_concurrent_server_connections as usize
        } else {
            total_upstreams.max(1)
        }
    }

    /// Non-positive values also collapse to the default of 10 (spec §6).
    pub fn per_session_cap(&self) -> usize {
        if self.max_concurrent_requests_per_session > 0 {
            self.max_concurrent_requests_per_session as usize
        } else {
            10
        }
    }
}

impl LogLevel {
    pub fn as_env_filter(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::None => "off",
            LogLevel::Debug => "debug",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_overrides_log_level() {
        let args = Args {
            config: "x".into(),
            port: 3006,
            log_level: LogLevel::Info,
            debug: true,
            cors: true,
            health_endpoint: vec![],
            timeout: 30_000,
            max_concurrent_requests_per_session: 10,
            max_concurrent_server_connections: 0,
            no_cors: false,
        };
        assert_eq!(args.effective_log_level(), LogLevel::Debug);
    }

    #[test]
    fn non_positive_parallelism_collapses_to_unbounded() {
        let args = Args {
            config: "x".into(),
            port: 3006,
            log_level: LogLevel::Info,
            debug: false,
            cors: true,
            health_endpoint: vec![],
            timeout: 30_000,
            max_concurrent_requests_per_session: 10,
            max_concurrent_server_connections: -1,
            no_cors: false,
        };
        assert_eq!(args.bounded_parallelism(7), 7);
    }
}
