use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use forgefleet_node::client::{NodeConfig, NodeError};

use crate::engine::EngineConfig;

/// Default Gradio function index of the txt2img handler on Forge builds.
pub const DEFAULT_TXT2IMG_FN_INDEX: u32 = 257;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("FORGE_NODES is invalid: {0}")]
    Nodes(#[from] NodeError),
}

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Postgres URL. `None` selects the in-memory job store.
    pub database_url: Option<String>,
    /// Compute nodes jobs can be routed to.
    pub nodes: Vec<NodeConfig>,
    /// Per-request timeout for node HTTP calls (default: `30`).
    pub node_request_timeout_secs: u64,
    /// Dispatcher and monitor tuning.
    pub engine: EngineConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                 |
    /// |------------------------------|-------------------------|
    /// | `HOST`                       | `0.0.0.0`               |
    /// | `PORT`                       | `3000`                  |
    /// | `CORS_ORIGINS`               | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`       | `30`                    |
    /// | `DATABASE_URL`               | unset (in-memory store) |
    /// | `FORGE_NODES`                | empty                   |
    /// | `FORGE_TXT2IMG_FN_INDEX`     | `257`                   |
    /// | `NODE_REQUEST_TIMEOUT_SECS`  | `30`                    |
    /// | `OUTPUT_DIR`                 | `./output`              |
    /// | `DISPATCH_INTERVAL_SECS`     | `3`                     |
    /// | `PENDING_WINDOW_SECS`        | `86400` (`0` = no bound)|
    /// | `POLL_INTERVAL_MS`           | `1500`                  |
    /// | `MAX_POLL_ATTEMPTS`          | `800`                   |
    /// | `STALL_WINDOW_SECS`          | `20`                    |
    /// | `MAX_EMPTY_COMPLETIONS`      | `3`                     |
    /// | `ASSUME_COMPLETE_AFTER_SECS` | `45` (`0` = disabled)   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_var(&lookup, "PORT", 3000, "u16")?;

        let cors_origins: Vec<String> = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = parse_var(&lookup, "REQUEST_TIMEOUT_SECS", 30, "u64")?;

        let database_url = lookup("DATABASE_URL").filter(|s| !s.trim().is_empty());

        let fn_index: u32 = parse_var(
            &lookup,
            "FORGE_TXT2IMG_FN_INDEX",
            DEFAULT_TXT2IMG_FN_INDEX,
            "u32",
        )?;
        let nodes = match lookup("FORGE_NODES") {
            Some(spec) => NodeConfig::parse_list(&spec, fn_index)?,
            None => Vec::new(),
        };
        let node_request_timeout_secs: u64 =
            parse_var(&lookup, "NODE_REQUEST_TIMEOUT_SECS", 30, "u64")?;

        let defaults = EngineConfig::default();
        let output_dir = lookup("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);
        let dispatch_interval_secs: u64 = parse_var(&lookup, "DISPATCH_INTERVAL_SECS", 3, "u64")?;
        let pending_window_secs: u64 = parse_var(&lookup, "PENDING_WINDOW_SECS", 86_400, "u64")?;
        let poll_interval_ms: u64 = parse_var(&lookup, "POLL_INTERVAL_MS", 1500, "u64")?;
        let max_poll_attempts: u32 = parse_var(&lookup, "MAX_POLL_ATTEMPTS", 800, "u32")?;
        let stall_window_secs: u64 = parse_var(&lookup, "STALL_WINDOW_SECS", 20, "u64")?;
        let max_empty_completions: u32 = parse_var(&lookup, "MAX_EMPTY_COMPLETIONS", 3, "u32")?;
        let assume_complete_after_secs: u64 =
            parse_var(&lookup, "ASSUME_COMPLETE_AFTER_SECS", 45, "u64")?;

        let engine = EngineConfig {
            output_dir,
            dispatch_interval: Duration::from_secs(dispatch_interval_secs.max(1)),
            pending_window: nonzero_secs(pending_window_secs),
            poll_interval: Duration::from_millis(poll_interval_ms.max(100)),
            max_poll_attempts,
            stall_window: Duration::from_secs(stall_window_secs.max(1)),
            max_empty_completions: max_empty_completions.max(1),
            assume_complete_after: nonzero_secs(assume_complete_after_secs),
        };

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            database_url,
            nodes,
            node_request_timeout_secs,
            engine,
        })
    }
}

fn parse_var<F, T>(
    lookup: &F,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            expected,
            value: raw,
        }),
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
