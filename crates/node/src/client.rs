//! The node client seam and its shared types.
//!
//! The engine never talks HTTP directly. Everything it needs from a node
//! goes through [`NodeClient`], which [`ForgeApi`](crate::api::ForgeApi)
//! implements over `reqwest` and tests implement with scripted fakes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use forgefleet_core::types::NodeId;

use crate::payload::QueueJoinRequest;

/// Raw `data:` payloads from a node's event stream, one item per event.
pub type EventStream = BoxStream<'static, Result<String, NodeError>>;

/// Errors from talking to a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The node returned a non-2xx status code.
    #[error("Node API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The event stream broke or ended unexpectedly.
    #[error("Event stream error: {0}")]
    Stream(String),

    /// The node answered with something we cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A node definition could not be parsed.
    #[error("Invalid node definition: {0}")]
    InvalidConfig(String),
}

/// Connection settings for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Base URL without credentials, e.g. `http://10.0.0.5:7860`.
    pub api_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Gradio function index of the txt2img handler.
    pub fn_index: u32,
}

impl NodeConfig {
    /// Parse one `id=url` entry. Credentials may be embedded as URL
    /// userinfo and are moved out of the stored URL.
    pub fn parse(entry: &str, fn_index: u32) -> Result<Self, NodeError> {
        let (id, url) = entry
            .split_once('=')
            .ok_or_else(|| NodeError::InvalidConfig(format!("expected id=url, got '{entry}'")))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(NodeError::InvalidConfig(format!("empty node id in '{entry}'")));
        }
        let mut url = reqwest::Url::parse(url.trim())
            .map_err(|e| NodeError::InvalidConfig(format!("node '{id}': {e}")))?;

        let username = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let password = url.password().map(str::to_string);
        // set_username / set_password only fail for cannot-be-a-base URLs.
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Self {
            id: id.to_string(),
            api_url: url.as_str().trim_end_matches('/').to_string(),
            username,
            password,
            fn_index,
        })
    }

    /// Parse a `;`-separated list of `id=url` entries.
    pub fn parse_list(spec: &str, fn_index: u32) -> Result<Vec<Self>, NodeError> {
        let mut nodes: Vec<Self> = Vec::new();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let node = Self::parse(entry, fn_index)?;
            if nodes.iter().any(|n| n.id == node.id) {
                return Err(NodeError::InvalidConfig(format!("duplicate node id '{}'", node.id)));
            }
            nodes.push(node);
        }
        Ok(nodes)
    }
}

/// One checkpoint from `GET /sdapi/v1/sd-models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub title: String,
    pub model_name: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

/// Acknowledgement from `POST /queue/join`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueJoinAck {
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Operations the engine needs from a compute node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    fn node_id(&self) -> &str;

    /// Base URL (credentials stripped), for display.
    fn base_url(&self) -> &str;

    /// Gradio function index to submit to.
    fn fn_index(&self) -> u32;

    /// Checkpoints available on the node.
    async fn list_models(&self) -> Result<Vec<ModelEntry>, NodeError>;

    /// Queue a generation request.
    async fn submit(&self, request: &QueueJoinRequest) -> Result<QueueJoinAck, NodeError>;

    /// Open the event stream for a session.
    async fn open_stream(&self, session_hash: &str) -> Result<EventStream, NodeError>;

    /// Poll progress for a task token. Returns the raw response body.
    async fn poll_progress(&self, task_token: &str) -> Result<serde_json::Value, NodeError>;

    /// Fetch a file from the node's output directory.
    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, NodeError>;

    /// Fetch an absolute URL reported by the node.
    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, NodeError>;

    /// Interrupt whatever the node is currently generating.
    async fn interrupt(&self) -> Result<(), NodeError>;
}
