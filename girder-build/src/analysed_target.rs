//! Analysed targets
//!
//! The bundle a successful analysis produces: the target result, the
//! actions/blobs/trees it synthesized, the configuration variables it
//! demonstrably depends on, its taints, the export targets it implies,
//! and its position in the target graph.

use crate::graph_info::TargetGraphInformation;
use girder_core::{ActionDescription, ArtifactDescription, Tree};
use girder_expr::{TargetResult, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

pub type AnalysedTargetPtr = Arc<AnalysedTarget>;

#[derive(Debug, Clone)]
pub struct AnalysedTarget {
    result: TargetResult,
    actions: Vec<Arc<ActionDescription>>,
    blobs: Vec<String>,
    trees: Vec<Arc<Tree>>,
    vars: BTreeSet<String>,
    tainted: BTreeSet<String>,
    implied_export: BTreeSet<String>,
    graph_information: TargetGraphInformation,
}

impl AnalysedTarget {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        result: TargetResult,
        actions: Vec<Arc<ActionDescription>>,
        blobs: Vec<String>,
        trees: Vec<Arc<Tree>>,
        vars: BTreeSet<String>,
        tainted: BTreeSet<String>,
        implied_export: BTreeSet<String>,
        graph_information: TargetGraphInformation,
    ) -> Self {
        Self {
            result,
            actions,
            blobs,
            trees,
            vars,
            tainted,
            implied_export,
            graph_information,
        }
    }

    /// A leaf target carrying just a result.
    pub fn source(result: TargetResult) -> Self {
        Self::new(
            result,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            BTreeSet::new(),
            BTreeSet::new(),
            BTreeSet::new(),
            TargetGraphInformation::source(),
        )
    }

    pub fn result(&self) -> &TargetResult {
        &self.result
    }

    pub fn artifacts(&self) -> &Value {
        &self.result.artifact_stage
    }

    pub fn runfiles(&self) -> &Value {
        &self.result.runfiles
    }

    pub fn provides(&self) -> &Value {
        &self.result.provides
    }

    pub fn actions(&self) -> &[Arc<ActionDescription>] {
        &self.actions
    }

    pub fn blobs(&self) -> &[String] {
        &self.blobs
    }

    pub fn trees(&self) -> &[Arc<Tree>] {
        &self.trees
    }

    pub fn vars(&self) -> &BTreeSet<String> {
        &self.vars
    }

    pub fn tainted(&self) -> &BTreeSet<String> {
        &self.tainted
    }

    pub fn implied_export(&self) -> &BTreeSet<String> {
        &self.implied_export
    }

    pub fn graph_information(&self) -> &TargetGraphInformation {
        &self.graph_information
    }

    /// Every non-known artifact reachable from artifacts, runfiles, or
    /// provides; the domain of the replacement map an export-target
    /// cache entry needs.
    pub fn contained_non_known_artifacts(&self) -> Vec<ArtifactDescription> {
        let mut found = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for value in [
            &self.result.artifact_stage,
            &self.result.runfiles,
            &self.result.provides,
        ] {
            collect_non_known(value, &mut found, &mut seen);
        }
        found
    }
}

fn collect_non_known(
    value: &Value,
    found: &mut Vec<ArtifactDescription>,
    seen: &mut std::collections::HashSet<girder_core::Digest>,
) {
    if !seen.insert(value.to_hash()) {
        return;
    }
    if let Some(artifact) = value.as_artifact() {
        if !artifact.is_known() {
            found.push(artifact.clone());
        }
        return;
    }
    if let Some(list) = value.as_list() {
        for item in list {
            collect_non_known(item, found, seen);
        }
        return;
    }
    if let Some(map) = value.as_map() {
        for (_, item) in map.items() {
            collect_non_known(item, found, seen);
        }
        return;
    }
    if let Some(node) = value.as_node() {
        match node {
            girder_expr::TargetNode::Value(inner) => collect_non_known(inner, found, seen),
            girder_expr::TargetNode::Abstract(abstract_node) => {
                collect_non_known(&abstract_node.string_fields, found, seen);
                collect_non_known(&abstract_node.target_fields, found, seen);
            }
        }
        return;
    }
    if let Some(result) = value.as_result() {
        collect_non_known(&result.artifact_stage, found, seen);
        collect_non_known(&result.runfiles, found, seen);
        collect_non_known(&result.provides, found, seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::{compute_hash, ObjectType};
    use std::collections::BTreeMap;

    #[test]
    fn test_contained_non_known_artifacts() {
        let action = ArtifactDescription::action("act", "out");
        let known = ArtifactDescription::known(compute_hash(b"k"), ObjectType::File);
        let stage = Value::map_from(BTreeMap::from([
            ("a".to_string(), Value::artifact(action.clone())),
            ("b".to_string(), Value::artifact(known)),
        ]));
        let target = AnalysedTarget::source(TargetResult::new(
            stage,
            Value::empty_map(),
            Value::empty_map(),
        ));
        let non_known = target.contained_non_known_artifacts();
        assert_eq!(non_known, vec![action]);
    }
}
