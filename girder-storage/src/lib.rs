//! GIRDER Storage - Target Cache and Friends
//!
//! Disk-backed persistence of the analysis engine: the
//! content-addressed file store, the generation-aware target cache for
//! export targets, garbage-collection locking, and the symlink
//! resolver with its persistent id cache.

pub mod cache_hook;
pub mod file_store;
pub mod gc;
pub mod symlink_resolver;
pub mod target_cache;

pub use cache_hook::LocalExportCache;
pub use file_store::{FileStore, StoreError, StoreMode};
pub use gc::{GarbageCollector, GcError, LockFile};
pub use symlink_resolver::{ResolveError, ResolvePolicy, SymlinkLookup, SymlinkResolver};
pub use target_cache::{
    ArtifactDownloader, CacheError, TargetCache, TargetCacheEntry, TargetCacheKey,
};
