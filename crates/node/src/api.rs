//! HTTP client for Forge / SD-WebUI nodes.
//!
//! Wraps the node endpoints the engine consumes (checkpoint catalog,
//! Gradio queue join and event stream, progress poll, file fetch,
//! interrupt) using [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde_json::json;

use crate::client::{EventStream, ModelEntry, NodeClient, NodeConfig, NodeError, QueueJoinAck};
use crate::payload::QueueJoinRequest;
use crate::sse::decode_stream;

/// HTTP client for a single node.
pub struct ForgeApi {
    client: reqwest::Client,
    config: NodeConfig,
    request_timeout: Duration,
}

impl ForgeApi {
    /// Create a client for `config`.
    ///
    /// `request_timeout` bounds every call except the event stream, which
    /// stays open for the whole generation.
    pub fn new(config: NodeConfig, request_timeout: Duration) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self::with_client(client, config, request_timeout))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, config: NodeConfig, request_timeout: Duration) -> Self {
        Self {
            client,
            config,
            request_timeout,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url, path)
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.username {
            Some(user) => request.basic_auth(user, self.config.password.as_deref()),
            None => request,
        }
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code, or turn it into a
    /// [`NodeError::Api`] carrying the status and body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, NodeError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(NodeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, NodeError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn read_bytes(response: reqwest::Response) -> Result<Vec<u8>, NodeError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl NodeClient for ForgeApi {
    fn node_id(&self) -> &str {
        &self.config.id
    }

    fn base_url(&self) -> &str {
        &self.config.api_url
    }

    fn fn_index(&self) -> u32 {
        self.config.fn_index
    }

    async fn list_models(&self) -> Result<Vec<ModelEntry>, NodeError> {
        let response = self
            .with_auth(self.client.get(self.url("/sdapi/v1/sd-models")))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn submit(&self, request: &QueueJoinRequest) -> Result<QueueJoinAck, NodeError> {
        let response = self
            .with_auth(self.client.post(self.url("/queue/join")))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn open_stream(&self, session_hash: &str) -> Result<EventStream, NodeError> {
        let response = self
            .with_auth(
                self.client
                    .get(self.url(&format!("/queue/data?session_hash={session_hash}"))),
            )
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(decode_stream(Box::pin(response.bytes_stream())))
    }

    async fn poll_progress(&self, task_token: &str) -> Result<serde_json::Value, NodeError> {
        let body = json!({
            "id_task": task_token,
            "id_live_preview": -1,
            "live_preview": true,
        });
        let response = self
            .with_auth(self.client.post(self.url("/internal/progress")))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, NodeError> {
        let response = self
            .with_auth(self.client.get(self.url(&format!("/file={path}"))))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::read_bytes(response).await
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, NodeError> {
        let request = self.client.get(url).timeout(self.request_timeout);
        // Only hand our credentials to the node itself.
        let request = if url.starts_with(&self.config.api_url) {
            self.with_auth(request)
        } else {
            request
        };
        Self::read_bytes(request.send().await?).await
    }

    async fn interrupt(&self) -> Result<(), NodeError> {
        let response = self
            .with_auth(self.client.post(self.url("/sdapi/v1/interrupt")))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }
}
