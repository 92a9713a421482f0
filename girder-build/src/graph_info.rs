//! Target graph information
//!
//! Per-target record of the configured-target identity and its
//! declared, implicit, and anonymous children. Source-kind leaves
//! (files, trees, globs, symlinks) carry the sentinel with no node.

use crate::configured_target::ConfiguredTargetPtr;

#[derive(Debug, Clone, Default)]
pub struct TargetGraphInformation {
    node: Option<ConfiguredTargetPtr>,
    declared: Vec<ConfiguredTargetPtr>,
    implicit: Vec<ConfiguredTargetPtr>,
    anonymous: Vec<ConfiguredTargetPtr>,
}

impl TargetGraphInformation {
    pub fn new(
        node: ConfiguredTargetPtr,
        declared: Vec<ConfiguredTargetPtr>,
        implicit: Vec<ConfiguredTargetPtr>,
        anonymous: Vec<ConfiguredTargetPtr>,
    ) -> Self {
        Self {
            node: Some(node),
            declared,
            implicit,
            anonymous,
        }
    }

    /// Sentinel for source-kind leaves.
    pub fn source() -> Self {
        Self::default()
    }

    pub fn node(&self) -> Option<&ConfiguredTargetPtr> {
        self.node.as_ref()
    }

    pub fn declared(&self) -> &[ConfiguredTargetPtr] {
        &self.declared
    }

    pub fn implicit(&self) -> &[ConfiguredTargetPtr] {
        &self.implicit
    }

    pub fn anonymous(&self) -> &[ConfiguredTargetPtr] {
        &self.anonymous
    }
}
