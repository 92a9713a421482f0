//! Target cache
//!
//! Content-addressed persistence of elaborated export-target results.
//! Keys fingerprint (repository, target name, effective configuration);
//! entries are the serialized target result with every artifact
//! replaced by a known digest, plus the implied export targets. The
//! on-disk layout is sharded by a description of the execution backend
//! and organized in GC generations: writes are last-wins in the newest
//! generation, reads uplink hits from older generations.

use crate::file_store::{FileStore, StoreMode};
use girder_build::AnalysedTarget;
use girder_core::{compute_hash, ArtifactDescription, Digest, ObjectInfo, ObjectType};
use girder_expr::{ResultError, TargetResult};
use serde_json::{json, Value as Json};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Key of a cache entry: the object info of the serialized key blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetCacheKey {
    id: ObjectInfo,
}

impl TargetCacheKey {
    /// Compute the key for (repository fingerprint, target name,
    /// effective configuration).
    pub fn new(repo_key: &Digest, target: &Json, effective_config: &Json) -> Self {
        let blob = json!({
            "repo_key": repo_key.hex(),
            "target": target,
            "effective_config": effective_config,
        });
        Self {
            id: ObjectInfo {
                digest: compute_hash(blob.to_string().as_bytes()),
                object_type: ObjectType::File,
            },
        }
    }

    pub fn id(&self) -> &ObjectInfo {
        &self.id
    }

    pub fn digest(&self) -> &Digest {
        &self.id.digest
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache entry is not valid JSON: {source}")]
    MalformedEntry { source: serde_json::Error },

    #[error("Cache entry cannot be decoded: {source}")]
    MalformedResult { source: ResultError },

    #[error("Not all artifacts referenced by the entry could be synchronized")]
    SyncFailed,

    #[error(transparent)]
    Store(#[from] crate::file_store::StoreError),

    #[error("Serializing target result failed: {source}")]
    Serialize { source: ResultError },
}

/// One cache entry: the JSON blob persisted in the file store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCacheEntry {
    desc: Json,
}

impl TargetCacheEntry {
    pub fn from_json(desc: Json) -> Self {
        Self { desc }
    }

    /// Create the entry from an analysed target, replacing every
    /// non-known artifact by its known counterpart. `implied_entries`
    /// are the hex digests of the cache entries of implied export
    /// targets.
    pub fn from_target(
        target: &AnalysedTarget,
        replacements: &HashMap<ArtifactDescription, ObjectInfo>,
        implied_entries: &BTreeSet<String>,
    ) -> Result<Self, CacheError> {
        let mut desc = target
            .result()
            .replace_non_known_and_to_json(replacements)
            .map_err(|source| CacheError::Serialize { source })?;
        if !implied_entries.is_empty() {
            let obj = desc.as_object_mut().expect("result serializes to a map");
            obj.insert(
                "implied".to_string(),
                json!(implied_entries.iter().collect::<Vec<_>>()),
            );
        }
        Ok(Self { desc })
    }

    pub fn to_json(&self) -> &Json {
        &self.desc
    }

    /// Reconstruct the target result; results from cache are cacheable.
    pub fn to_result(&self) -> Result<TargetResult, CacheError> {
        TargetResult::from_json(&self.desc)
            .map_err(|source| CacheError::MalformedResult { source })
    }

    /// The implied export-target entries recorded in this entry.
    pub fn to_implied(&self) -> BTreeSet<String> {
        self.desc
            .get("implied")
            .and_then(Json::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Json::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The implied entries as object infos, excluding this entry's own
    /// digest; `None` if any entry fails to parse as a digest.
    pub fn to_implied_ids(&self, own_entry: &Digest) -> Option<Vec<ObjectInfo>> {
        let mut ids = Vec::new();
        for implied in self.to_implied() {
            let digest = Digest::from_str(&implied).ok()?;
            if &digest != own_entry {
                ids.push(ObjectInfo {
                    digest,
                    object_type: ObjectType::File,
                });
            }
        }
        Some(ids)
    }

    /// Every object referenced by the entry (artifacts, runfiles, and
    /// provided artifacts); all are known post-replacement.
    pub fn to_artifacts(&self) -> Result<Vec<ObjectInfo>, CacheError> {
        let mut infos = Vec::new();
        let mut collect_stage = |stage: Option<&Json>| -> Result<(), CacheError> {
            let Some(map) = stage.and_then(Json::as_object) else {
                return Ok(());
            };
            for value in map.values() {
                if let Ok(artifact) = ArtifactDescription::from_json(value) {
                    if let Some(info) = artifact.to_known_info() {
                        infos.push(info);
                    }
                }
            }
            Ok(())
        };
        collect_stage(self.desc.get("artifacts"))?;
        collect_stage(self.desc.get("runfiles"))?;
        if let Some(provides) = self.desc.get("provides") {
            let nodes = provides.get("nodes");
            let provided = provides
                .get("provided_artifacts")
                .and_then(Json::as_array)
                .cloned()
                .unwrap_or_default();
            for id in provided {
                if let Some(node) = id.as_str().and_then(|i| nodes.and_then(|n| n.get(i))) {
                    if let Ok(artifact) = ArtifactDescription::from_json(node) {
                        if let Some(info) = artifact.to_known_info() {
                            infos.push(info);
                        }
                    }
                }
            }
        }
        Ok(infos)
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.desc.to_string().into_bytes()
    }
}

/// Synchronizes referenced digests into the local CAS before an entry
/// is persisted or after one is read.
pub type ArtifactDownloader<'a> = &'a dyn Fn(&[ObjectInfo]) -> bool;

/// Generation-aware, sharded target cache.
pub struct TargetCache {
    newest: FileStore,
    older: Vec<FileStore>,
}

impl TargetCache {
    /// Open the cache under `base_dir`, sharded by the execution
    /// backend description, with the given number of GC generations.
    pub fn new(base_dir: &Path, backend_description: &Json, generations: usize) -> Self {
        let shard = compute_hash(backend_description.to_string().as_bytes()).hex();
        let generation_root = |index: usize| -> PathBuf {
            base_dir
                .join(format!("generation-{}", index))
                .join("target-cache")
                .join(&shard)
        };
        let newest = FileStore::new(generation_root(0), StoreMode::LastWins);
        let older = (1..generations.max(1))
            .map(|index| FileStore::new(generation_root(index), StoreMode::FirstWins))
            .collect();
        Self { newest, older }
    }

    /// Store an entry; the downloader must synchronize every referenced
    /// artifact first, otherwise the entry is not written.
    pub fn store(
        &self,
        key: &TargetCacheKey,
        entry: &TargetCacheEntry,
        downloader: ArtifactDownloader,
    ) -> Result<(), CacheError> {
        let artifacts = entry.to_artifacts()?;
        if !downloader(&artifacts) {
            return Err(CacheError::SyncFailed);
        }
        self.newest.add(key.digest(), &entry.to_bytes())?;
        Ok(())
    }

    /// Read an entry; hits in older generations are uplinked into the
    /// newest generation.
    pub fn read(&self, key: &TargetCacheKey) -> Option<(TargetCacheEntry, ObjectInfo)> {
        let content = match self.newest.read(key.digest()) {
            Some(content) => content,
            None => {
                let content = self
                    .older
                    .iter()
                    .find_map(|generation| generation.read(key.digest()))?;
                // uplink into the newest generation
                let _ = self.newest.add(key.digest(), &content);
                content
            }
        };
        let desc: Json = serde_json::from_slice(&content).ok()?;
        let info = ObjectInfo {
            digest: compute_hash(&content),
            object_type: ObjectType::File,
        };
        Some((TargetCacheEntry::from_json(desc), info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_expr::Value;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn cache(dir: &Path) -> TargetCache {
        TargetCache::new(dir, &json!({"remote_address": null}), 3)
    }

    fn sample_key() -> TargetCacheKey {
        TargetCacheKey::new(
            &compute_hash(b"repo"),
            &json!(["base", "", "exported"]),
            &json!({"OS": "linux"}),
        )
    }

    fn sample_entry() -> TargetCacheEntry {
        let known = Value::artifact(ArtifactDescription::known(
            compute_hash(b"content"),
            ObjectType::File,
        ));
        let result = TargetResult::new(
            Value::map_from(BTreeMap::from([("out".to_string(), known)])),
            Value::empty_map(),
            Value::empty_map(),
        );
        TargetCacheEntry::from_json(result.to_json().expect("serializes"))
    }

    #[test]
    fn test_key_is_deterministic() {
        assert_eq!(sample_key(), sample_key());
        let other = TargetCacheKey::new(
            &compute_hash(b"repo"),
            &json!(["base", "", "exported"]),
            &json!({"OS": "darwin"}),
        );
        assert_ne!(sample_key(), other);
    }

    #[test]
    fn test_store_requires_successful_sync() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache(dir.path());
        let key = sample_key();
        let entry = sample_entry();
        let result = cache.store(&key, &entry, &|_| false);
        assert!(matches!(result, Err(CacheError::SyncFailed)));
        assert!(cache.read(&key).is_none());
    }

    #[test]
    fn test_store_and_read_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache(dir.path());
        let key = sample_key();
        let entry = sample_entry();
        let synced = Mutex::new(Vec::new());
        cache
            .store(&key, &entry, &|infos| {
                synced.lock().expect("lock").extend_from_slice(infos);
                true
            })
            .expect("stores");
        assert_eq!(synced.lock().expect("lock").len(), 1);
        let (read_back, info) = cache.read(&key).expect("hit");
        assert_eq!(read_back, entry);
        assert_eq!(info.object_type, ObjectType::File);
        let result = read_back.to_result().expect("decodes");
        assert!(result.is_cacheable);
    }

    #[test]
    fn test_read_uplinks_from_older_generation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = sample_key();
        let entry = sample_entry();
        // plant the entry in generation 1 only
        let shard_store = {
            let shard =
                compute_hash(json!({"remote_address": null}).to_string().as_bytes()).hex();
            FileStore::new(
                dir.path()
                    .join("generation-1")
                    .join("target-cache")
                    .join(shard),
                StoreMode::FirstWins,
            )
        };
        shard_store
            .add(key.digest(), &entry.to_bytes())
            .expect("planted");
        let cache = cache(dir.path());
        let (read_back, _) = cache.read(&key).expect("found in older generation");
        assert_eq!(read_back, entry);
        // now present in the newest generation as well
        let newest = FileStore::new(
            dir.path()
                .join("generation-0")
                .join("target-cache")
                .join(compute_hash(json!({"remote_address": null}).to_string().as_bytes()).hex()),
            StoreMode::LastWins,
        );
        assert!(newest.lookup(key.digest()).is_some());
    }

    #[test]
    fn test_entry_round_trip_with_replacement() {
        // a result with a non-known artifact, cached with a replacement
        let action_artifact = ArtifactDescription::action("act0", "out/bin");
        let built = ObjectInfo {
            digest: compute_hash(b"built binary"),
            object_type: ObjectType::Executable,
        };
        let result = TargetResult::new(
            Value::map_from(BTreeMap::from([(
                "out/bin".to_string(),
                Value::artifact(action_artifact.clone()),
            )])),
            Value::empty_map(),
            Value::map_from(BTreeMap::from([(
                "binary".to_string(),
                Value::artifact(action_artifact.clone()),
            )])),
        );
        assert!(!result.is_cacheable);
        let analysed = AnalysedTarget::source(result);
        let replacements = HashMap::from([(action_artifact, built)]);
        let entry = TargetCacheEntry::from_target(&analysed, &replacements, &BTreeSet::new())
            .expect("replaces and serializes");

        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache(dir.path());
        let key = sample_key();
        cache.store(&key, &entry, &|_| true).expect("stores");
        let (read_back, _) = cache.read(&key).expect("hit");
        let round_tripped = read_back.to_result().expect("decodes");
        assert!(round_tripped.is_cacheable);
        let staged = round_tripped
            .artifact_stage
            .get("out/bin")
            .expect("staged")
            .as_artifact()
            .cloned()
            .expect("artifact");
        assert_eq!(staged, ArtifactDescription::known(built.digest, built.object_type));
        let provided = round_tripped
            .provides
            .get("binary")
            .expect("provided")
            .as_artifact()
            .cloned()
            .expect("artifact");
        assert!(provided.is_known());
    }

    #[test]
    fn test_implied_entries() {
        let analysed = AnalysedTarget::source(TargetResult::new(
            Value::empty_map(),
            Value::empty_map(),
            Value::empty_map(),
        ));
        let own = compute_hash(b"own entry");
        let other = compute_hash(b"other entry");
        let implied = BTreeSet::from([own.hex(), other.hex()]);
        let entry = TargetCacheEntry::from_target(&analysed, &HashMap::new(), &implied)
            .expect("serializes");
        assert_eq!(entry.to_implied(), implied);
        let ids = entry.to_implied_ids(&own).expect("all digests parse");
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].digest, other);
    }
}
