//! Persisting generated images to the output directory.
//!
//! Layout: `<output_dir>/<job_id>/<index>_<hash>.<ext>` for results and
//! `<output_dir>/<job_id>/preview.<ext>` for the latest live preview.
//! Returned paths are relative to the output directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use forgefleet_core::hashing::sha256_hex;
use forgefleet_core::types::DbId;
use forgefleet_node::client::{NodeClient, NodeError};
use forgefleet_node::normalize::ArtifactRef;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to fetch artifact from node: {0}")]
    Fetch(#[from] NodeError),

    #[error("invalid inline image data: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("artifact is empty")]
    Empty,

    #[error("failed to write artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Where result artifacts and previews end up.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Persist result `index` of `job_id`, fetching from `node` when needed.
    async fn save_result(
        &self,
        job_id: DbId,
        index: usize,
        artifact: &ArtifactRef,
        node: &dyn NodeClient,
    ) -> Result<String, ArtifactError>;

    /// Persist an inline preview image, replacing the previous one.
    async fn save_preview(&self, job_id: DbId, data: &str) -> Result<String, ArtifactError>;
}

/// [`ArtifactSink`] writing into a local directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn write(&self, job_id: DbId, name: &str, bytes: &[u8]) -> Result<String, ArtifactError> {
        let dir = self.root.join(job_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(name), bytes).await?;
        Ok(format!("{job_id}/{name}"))
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactStore {
    async fn save_result(
        &self,
        job_id: DbId,
        index: usize,
        artifact: &ArtifactRef,
        node: &dyn NodeClient,
    ) -> Result<String, ArtifactError> {
        let bytes = match artifact {
            ArtifactRef::Inline(data) => decode_inline(data)?,
            ArtifactRef::NodePath(path) => node.fetch_file(path).await?,
            ArtifactRef::Url(url) => node.fetch_url(url).await?,
        };
        if bytes.is_empty() {
            return Err(ArtifactError::Empty);
        }

        let hash = sha256_hex(&bytes);
        let name = format!("{index:02}_{}.{}", &hash[..12], extension_for(&bytes));
        let path = self.write(job_id, &name, &bytes).await?;
        tracing::debug!(job_id, path = %path, bytes = bytes.len(), "Saved result artifact");
        Ok(path)
    }

    async fn save_preview(&self, job_id: DbId, data: &str) -> Result<String, ArtifactError> {
        let bytes = decode_inline(data)?;
        if bytes.is_empty() {
            return Err(ArtifactError::Empty);
        }
        let name = format!("preview.{}", extension_for(&bytes));
        self.write(job_id, &name, &bytes).await
    }
}

/// Decode base64 image data, with or without a `data:` URL prefix.
pub fn decode_inline(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let encoded = match data.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, payload)| payload),
        None => data,
    };
    base64::engine::general_purpose::STANDARD.decode(encoded.trim())
}

fn extension_for(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin")
}
