//! Analysis context
//!
//! Everything an analysis run needs, threaded explicitly: the
//! repository configuration (roots and entry-point file names), the
//! evaluator with its error-formatting limits, statistics counters,
//! and the optional serve endpoint and export-cache hooks.

use crate::roots::FileRoot;
use crate::serve::ServeApi;
use crate::statistics::Statistics;
use async_trait::async_trait;
use girder_core::Digest;
use girder_expr::{Evaluator, TargetResult};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;

/// One repository: its source root, the names of its entry-point
/// files, and an optional content fingerprint (e.g. the git tree id of
/// the root) used in target-cache keys.
#[derive(Clone)]
pub struct Repository {
    pub root: Arc<dyn FileRoot>,
    pub target_file_name: String,
    pub rule_file_name: String,
    pub fingerprint: Option<Digest>,
}

impl Repository {
    pub fn new(root: Arc<dyn FileRoot>) -> Self {
        Self {
            root,
            target_file_name: "TARGETS".to_string(),
            rule_file_name: "RULES".to_string(),
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Digest) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }
}

/// Multi-repository configuration.
#[derive(Clone, Default)]
pub struct RepositoryConfig {
    repositories: HashMap<String, Repository>,
}

impl RepositoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: impl Into<String>, repository: Repository) -> Self {
        self.repositories.insert(name.into(), repository);
        self
    }

    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.get(name)
    }
}

/// Export-cache lookup consumed by the analyzer; the storage layer (or
/// a serve client) provides the implementation.
#[async_trait]
pub trait ExportCacheHook: Send + Sync {
    /// Cached elaborated result for an export target, if present.
    async fn lookup(
        &self,
        repo_fingerprint: &Digest,
        target: &Json,
        effective_config: &Json,
    ) -> Option<TargetResult>;

    /// Materialize a cache entry the serve endpoint referenced by
    /// digest; only implementations backed by a CAS can do this.
    async fn entry_by_digest(&self, _digest: &Digest) -> Option<TargetResult> {
        None
    }
}

/// Shared context of one analysis run.
pub struct AnalyseContext {
    pub repo_config: RepositoryConfig,
    pub evaluator: Evaluator,
    pub statistics: Arc<Statistics>,
    pub serve: Option<Arc<dyn ServeApi>>,
    pub export_cache: Option<Arc<dyn ExportCacheHook>>,
}

impl AnalyseContext {
    pub fn new(repo_config: RepositoryConfig) -> Arc<Self> {
        Arc::new(Self {
            repo_config,
            evaluator: Evaluator::default(),
            statistics: Arc::new(Statistics::new()),
            serve: None,
            export_cache: None,
        })
    }

    pub fn with_hooks(
        repo_config: RepositoryConfig,
        serve: Option<Arc<dyn ServeApi>>,
        export_cache: Option<Arc<dyn ExportCacheHook>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo_config,
            evaluator: Evaluator::default(),
            statistics: Arc::new(Statistics::new()),
            serve,
            export_cache,
        })
    }
}
