//! Analyzer-facing view of the target cache
//!
//! Implements the analyzer's export-cache interface on top of the
//! local target cache, so export targets short-circuit to their cached
//! elaboration when one is present.

use crate::target_cache::{TargetCache, TargetCacheKey};
use async_trait::async_trait;
use girder_build::ExportCacheHook;
use girder_core::Digest;
use girder_expr::TargetResult;
use serde_json::Value as Json;

pub struct LocalExportCache {
    cache: TargetCache,
}

impl LocalExportCache {
    pub fn new(cache: TargetCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &TargetCache {
        &self.cache
    }
}

#[async_trait]
impl ExportCacheHook for LocalExportCache {
    async fn lookup(
        &self,
        repo_fingerprint: &Digest,
        target: &Json,
        effective_config: &Json,
    ) -> Option<TargetResult> {
        let key = TargetCacheKey::new(repo_fingerprint, target, effective_config);
        let (entry, _info) = self.cache.read(&key)?;
        entry.to_result().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target_cache::TargetCacheEntry;
    use girder_core::{compute_hash, ArtifactDescription, ObjectType};
    use girder_expr::Value;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_lookup_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = TargetCache::new(dir.path(), &json!({"backend": "local"}), 2);
        let fingerprint = compute_hash(b"repo");
        let target = json!(["base", "", "exp"]);
        let config = json!({});
        let key = TargetCacheKey::new(&fingerprint, &target, &config);
        let result = TargetResult::new(
            Value::map_from(BTreeMap::from([(
                "out".to_string(),
                Value::artifact(ArtifactDescription::known(
                    compute_hash(b"bin"),
                    ObjectType::File,
                )),
            )])),
            Value::empty_map(),
            Value::empty_map(),
        );
        let entry = TargetCacheEntry::from_json(result.to_json().expect("serializes"));
        cache.store(&key, &entry, &|_| true).expect("stores");

        let hook = LocalExportCache::new(cache);
        let looked_up = hook
            .lookup(&fingerprint, &target, &config)
            .await
            .expect("cache hit");
        assert_eq!(looked_up, result);
        assert!(hook
            .lookup(&fingerprint, &json!(["base", "", "other"]), &config)
            .await
            .is_none());
    }
}
