//! Model-artifact lookup ahead of submission.
//!
//! The dispatcher asks the catalog whether the checkpoint a job requests
//! exists on its target node before anything is sent. Lookups are
//! tolerant of path separators, hash suffixes and extensions; see
//! [`forgefleet_core::model_match`].

use async_trait::async_trait;
use forgefleet_core::model_match::{resolve_model_name, MatchStrategy, ModelCandidate};

use crate::client::{ModelEntry, NodeClient, NodeError};

/// Result of a catalog lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogMatch {
    Found {
        /// The node's canonical title for the checkpoint.
        title: String,
        strategy: MatchStrategy,
    },
    NotFound,
}

/// Resolves requested checkpoint names against a node.
#[async_trait]
pub trait ArtifactCatalog: Send + Sync {
    async fn resolve(&self, node: &dyn NodeClient, requested: &str) -> Result<CatalogMatch, NodeError>;
}

/// [`ArtifactCatalog`] backed by the node's live checkpoint list.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeModelCatalog;

#[async_trait]
impl ArtifactCatalog for NodeModelCatalog {
    async fn resolve(&self, node: &dyn NodeClient, requested: &str) -> Result<CatalogMatch, NodeError> {
        let models = node.list_models().await?;
        Ok(match_entries(requested, &models))
    }
}

/// Match `requested` against catalog entries.
pub fn match_entries(requested: &str, models: &[ModelEntry]) -> CatalogMatch {
    let candidates: Vec<ModelCandidate> = models.iter().map(candidate).collect();
    match resolve_model_name(requested, &candidates) {
        Some((found, strategy)) => CatalogMatch::Found {
            title: found.canonical.clone(),
            strategy,
        },
        None => CatalogMatch::NotFound,
    }
}

fn candidate(entry: &ModelEntry) -> ModelCandidate {
    let mut aliases = vec![entry.model_name.clone()];
    if let Some(filename) = &entry.filename {
        aliases.push(filename.clone());
    }
    ModelCandidate {
        canonical: entry.title.clone(),
        aliases,
    }
}
