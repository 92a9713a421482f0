//! Result map
//!
//! Deduplicating registry of analysed targets keyed by (target name,
//! effective configuration). Analyses racing on the same key hand back
//! the canonical instance; the registry is also the export surface for
//! the traverser (all actions, blobs, and trees of a build).

use crate::analysed_target::AnalysedTargetPtr;
use crate::configured_target::ConfiguredTarget;
use girder_core::{ActionDescription, Tree};
use girder_expr::{Configuration, EntityName};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct ResultMap {
    targets: Mutex<HashMap<ConfiguredTarget, AnalysedTargetPtr>>,
}

impl ResultMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an analysed target; returns the canonical instance for
    /// its (name, effective configuration) key.
    pub fn add(
        &self,
        target: EntityName,
        effective_config: Configuration,
        analysed: AnalysedTargetPtr,
    ) -> AnalysedTargetPtr {
        let key = ConfiguredTarget::new(target, effective_config);
        let mut targets = self.targets.lock().expect("result map poisoned");
        targets.entry(key).or_insert(analysed).clone()
    }

    pub fn size(&self) -> usize {
        self.targets.lock().expect("result map poisoned").len()
    }

    /// All distinct actions of the registered targets.
    pub fn actions(&self) -> Vec<Arc<ActionDescription>> {
        let targets = self.targets.lock().expect("result map poisoned");
        let mut seen = std::collections::HashSet::new();
        let mut actions = Vec::new();
        for analysed in targets.values() {
            for action in analysed.actions() {
                if seen.insert(action.id()) {
                    actions.push(action.clone());
                }
            }
        }
        actions
    }

    /// All distinct blobs of the registered targets.
    pub fn blobs(&self) -> Vec<String> {
        let targets = self.targets.lock().expect("result map poisoned");
        let mut seen = std::collections::HashSet::new();
        let mut blobs = Vec::new();
        for analysed in targets.values() {
            for blob in analysed.blobs() {
                if seen.insert(blob.clone()) {
                    blobs.push(blob.clone());
                }
            }
        }
        blobs
    }

    /// All distinct synthesized trees of the registered targets.
    pub fn trees(&self) -> Vec<Arc<Tree>> {
        let targets = self.targets.lock().expect("result map poisoned");
        let mut seen = std::collections::HashSet::new();
        let mut trees = Vec::new();
        for analysed in targets.values() {
            for tree in analysed.trees() {
                if seen.insert(tree.id()) {
                    trees.push(tree.clone());
                }
            }
        }
        trees
    }
}
