//! Analysis statistics

use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters, incremented from pool workers.
#[derive(Debug, Default)]
pub struct Statistics {
    targets_analysed: AtomicUsize,
    trees_analysed: AtomicUsize,
    exports_cached: AtomicUsize,
    exports_served: AtomicUsize,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_targets_analysed(&self) {
        self.targets_analysed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_trees_analysed(&self) {
        self.trees_analysed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_exports_cached(&self) {
        self.exports_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_exports_served(&self) {
        self.exports_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn targets_analysed(&self) -> usize {
        self.targets_analysed.load(Ordering::Relaxed)
    }

    pub fn trees_analysed(&self) -> usize {
        self.trees_analysed.load(Ordering::Relaxed)
    }

    pub fn exports_cached(&self) -> usize {
        self.exports_cached.load(Ordering::Relaxed)
    }

    pub fn exports_served(&self) -> usize {
        self.exports_served.load(Ordering::Relaxed)
    }
}
