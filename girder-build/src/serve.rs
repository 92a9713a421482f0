//! Serve interface (consumed, not provided)
//!
//! When a target root is absent, the analyzer delegates to a serve
//! endpoint through this interface. The core never speaks the wire
//! protocol itself; an implementation is injected by the front-end.

use async_trait::async_trait;
use girder_core::Digest;
use serde_json::Value as Json;

/// Outcome of asking the serve endpoint for a target.
#[derive(Debug, Clone)]
pub enum ServedTarget {
    /// Digest of a cached target-result entry.
    CachedResult(Digest),
    /// Identifier of the resolved repository root tree.
    Tree(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServeError {
    #[error("Serve endpoint failed: {msg}")]
    Failed { msg: String },

    #[error("Target {target} not known to serve endpoint")]
    UnknownTarget { target: String },
}

#[async_trait]
pub trait ServeApi: Send + Sync {
    /// Analyse `target` under `config` against the repository root
    /// identified by `repo_root_tree_id`.
    async fn serve_target(
        &self,
        repo_root_tree_id: &str,
        config: &Json,
        target: &Json,
    ) -> Result<ServedTarget, ServeError>;

    /// The configuration variables the named export target depends on.
    async fn serve_target_variables(
        &self,
        repo_root_tree_id: &str,
        target: &Json,
    ) -> Result<Vec<String>, ServeError>;

    /// Whether this serve endpoint shares the execution backend of the
    /// local configuration; mismatches make served results unusable.
    fn compatible_remote_execution(&self) -> bool {
        true
    }
}
