//! Symlink resolver
//!
//! Translates the symlinks contained in a result stage into canonical
//! form. Non-upwards relative symlinks are traversable; what happens
//! at an upwards or absolute symlink depends on the policy: it is kept
//! (ignore/partial) or fatal (complete). Resolutions are cached in a
//! persistent id-file keyed by (source tree id, policy).

use girder_core::{path, ArtifactDescription, Digest, ObjectType, Tree};
use girder_expr::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// How to treat symlinks during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolvePolicy {
    /// Keep all symlinks as they are.
    Ignore,
    /// Resolve non-upwards relative symlinks; keep the rest.
    PartiallyResolve,
    /// Resolve everything; upwards or absolute symlinks are fatal.
    CompletelyResolve,
}

impl ResolvePolicy {
    fn as_str(&self) -> &'static str {
        match self {
            ResolvePolicy::Ignore => "ignore",
            ResolvePolicy::PartiallyResolve => "partial",
            ResolvePolicy::CompletelyResolve => "complete",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Stage is not a map of artifacts")]
    NotAStage,

    #[error("Content of symlink at {path} is not known")]
    UnknownContent { path: String },

    #[error("Symlink at {path} points outside the stage: {target}")]
    EscapingSymlink { path: String, target: String },

    #[error("Symlink at {path} is dangling: {target}")]
    Dangling { path: String, target: String },

    #[error("Symlink chain at {path} is too long")]
    ChainTooLong { path: String },
}

/// Supplies the content of a known symlink by its digest.
pub type SymlinkLookup<'a> = &'a dyn Fn(&Digest) -> Option<String>;

const MAX_CHAIN: usize = 255;

pub struct SymlinkResolver {
    id_file: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl SymlinkResolver {
    /// Open a resolver backed by the given id-file; existing entries
    /// are loaded, unreadable lines are skipped.
    pub fn new(id_file: impl Into<PathBuf>) -> Self {
        let id_file = id_file.into();
        let mut cache = HashMap::new();
        if let Ok(file) = OpenOptions::new().read(true).open(&id_file) {
            for line in BufReader::new(file).lines().map_while(Result::ok) {
                let mut parts = line.split_whitespace();
                if let (Some(key), Some(resolved)) = (parts.next(), parts.next()) {
                    cache.insert(key.to_string(), resolved.to_string());
                }
            }
        }
        Self {
            id_file,
            cache: Mutex::new(cache),
        }
    }

    /// Resolve a stage under the policy; returns the tree id of the
    /// resolution result.
    pub fn resolve(
        &self,
        stage: &Value,
        policy: ResolvePolicy,
        lookup: SymlinkLookup,
    ) -> Result<String, ResolveError> {
        let map = stage.as_map().ok_or(ResolveError::NotAStage)?;
        let mut entries: BTreeMap<String, ArtifactDescription> = BTreeMap::new();
        for (entry_path, value) in map.items() {
            let artifact = value.as_artifact().ok_or(ResolveError::NotAStage)?;
            entries.insert(path::normalize(entry_path), artifact.clone());
        }
        let source_id = Tree::new(entries.clone()).id();
        let cache_key = format!("{}:{}", source_id, policy.as_str());
        if let Some(resolved) = self
            .cache
            .lock()
            .expect("resolver cache poisoned")
            .get(&cache_key)
        {
            return Ok(resolved.clone());
        }

        let resolved_id = if policy == ResolvePolicy::Ignore {
            source_id
        } else {
            let resolved = resolve_entries(&entries, policy, lookup)?;
            Tree::new(resolved).id()
        };

        self.cache
            .lock()
            .expect("resolver cache poisoned")
            .insert(cache_key.clone(), resolved_id.clone());
        self.persist(&cache_key, &resolved_id);
        Ok(resolved_id)
    }

    fn persist(&self, key: &str, resolved: &str) {
        if let Some(parent) = self.id_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.id_file)
        {
            let _ = writeln!(file, "{} {}", key, resolved);
        }
    }
}

fn is_symlink(artifact: &ArtifactDescription) -> Option<Digest> {
    match artifact.to_known_info() {
        Some(info) if info.object_type == ObjectType::Symlink => Some(info.digest),
        _ => None,
    }
}

fn resolve_entries(
    entries: &BTreeMap<String, ArtifactDescription>,
    policy: ResolvePolicy,
    lookup: SymlinkLookup,
) -> Result<BTreeMap<String, ArtifactDescription>, ResolveError> {
    let mut resolved = BTreeMap::new();
    for (entry_path, artifact) in entries {
        let mut current_path = entry_path.clone();
        let mut current = artifact.clone();
        let mut steps = 0;
        loop {
            let Some(digest) = is_symlink(&current) else {
                break;
            };
            steps += 1;
            if steps > MAX_CHAIN {
                return Err(ResolveError::ChainTooLong {
                    path: entry_path.clone(),
                });
            }
            let Some(content) = lookup(&digest) else {
                return Err(ResolveError::UnknownContent {
                    path: entry_path.clone(),
                });
            };
            if content.starts_with('/') || !path::is_non_upwards(&content) {
                if policy == ResolvePolicy::CompletelyResolve {
                    return Err(ResolveError::EscapingSymlink {
                        path: entry_path.clone(),
                        target: content,
                    });
                }
                // partial resolution stops the traversal here
                break;
            }
            let parent = match current_path.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => String::new(),
            };
            let target_path = path::join(&parent, &content);
            match entries.get(&target_path) {
                Some(target) => {
                    current = target.clone();
                    current_path = target_path;
                }
                None => {
                    if policy == ResolvePolicy::CompletelyResolve {
                        return Err(ResolveError::Dangling {
                            path: entry_path.clone(),
                            target: target_path,
                        });
                    }
                    break;
                }
            }
        }
        resolved.insert(entry_path.clone(), current);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::compute_hash;

    fn file_artifact(content: &[u8]) -> ArtifactDescription {
        ArtifactDescription::known(compute_hash(content), ObjectType::File)
    }

    fn symlink_artifact(target: &str) -> ArtifactDescription {
        ArtifactDescription::known(compute_hash(target.as_bytes()), ObjectType::Symlink)
    }

    fn stage(entries: Vec<(&str, ArtifactDescription)>) -> Value {
        Value::map_from(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), Value::artifact(v)))
                .collect(),
        )
    }

    fn lookup_for(links: Vec<(&str, &str)>) -> impl Fn(&Digest) -> Option<String> {
        let table: HashMap<Digest, String> = links
            .into_iter()
            .map(|(_, target)| (compute_hash(target.as_bytes()), target.to_string()))
            .collect();
        move |digest| table.get(digest).cloned()
    }

    #[test]
    fn test_ignore_keeps_symlinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = SymlinkResolver::new(dir.path().join("ids"));
        let the_stage = stage(vec![
            ("file", file_artifact(b"data")),
            ("link", symlink_artifact("file")),
        ]);
        let lookup = lookup_for(vec![("link", "file")]);
        let ignored = resolver
            .resolve(&the_stage, ResolvePolicy::Ignore, &lookup)
            .expect("resolves");
        let resolved = resolver
            .resolve(&the_stage, ResolvePolicy::CompletelyResolve, &lookup)
            .expect("resolves");
        assert_ne!(ignored, resolved);
    }

    #[test]
    fn test_complete_resolution_replaces_symlink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = SymlinkResolver::new(dir.path().join("ids"));
        let the_stage = stage(vec![
            ("sub/file", file_artifact(b"data")),
            ("sub/link", symlink_artifact("file")),
        ]);
        let lookup = lookup_for(vec![("sub/link", "file")]);
        let resolved = resolver
            .resolve(&the_stage, ResolvePolicy::CompletelyResolve, &lookup)
            .expect("resolves");
        // identical to the stage with the symlink replaced by the file
        let expected = stage(vec![
            ("sub/file", file_artifact(b"data")),
            ("sub/link", file_artifact(b"data")),
        ]);
        let expected_id = resolver
            .resolve(&expected, ResolvePolicy::Ignore, &lookup)
            .expect("resolves");
        assert_eq!(resolved, expected_id);
    }

    #[test]
    fn test_upwards_symlink_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = SymlinkResolver::new(dir.path().join("ids"));
        let the_stage = stage(vec![("link", symlink_artifact("../outside"))]);
        let lookup = lookup_for(vec![("link", "../outside")]);
        // partial keeps the symlink
        resolver
            .resolve(&the_stage, ResolvePolicy::PartiallyResolve, &lookup)
            .expect("partial keeps going");
        // complete is fatal
        let err = resolver
            .resolve(&the_stage, ResolvePolicy::CompletelyResolve, &lookup)
            .expect_err("complete must fail");
        assert!(matches!(err, ResolveError::EscapingSymlink { .. }));
    }

    #[test]
    fn test_cache_is_persistent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id_file = dir.path().join("ids");
        let the_stage = stage(vec![
            ("file", file_artifact(b"data")),
            ("link", symlink_artifact("file")),
        ]);
        let lookup = lookup_for(vec![("link", "file")]);
        let first = SymlinkResolver::new(&id_file)
            .resolve(&the_stage, ResolvePolicy::CompletelyResolve, &lookup)
            .expect("resolves");
        // a fresh resolver reads the persisted id without a lookup
        let failing_lookup = |_digest: &Digest| -> Option<String> { None };
        let second = SymlinkResolver::new(&id_file)
            .resolve(&the_stage, ResolvePolicy::CompletelyResolve, &failing_lookup)
            .expect("cache hit needs no symlink content");
        assert_eq!(first, second);
    }
}
