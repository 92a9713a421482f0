//! Synthesized trees
//!
//! A tree is a staged directory assembled at analysis time: a sorted
//! map from logical path to artifact. Its id fingerprints the staging
//! map, so equal stagings yield the same tree.

use crate::artifact::ArtifactDescription;
use crate::hash::{compute_hash, Digest};
use serde_json::Value as Json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    artifacts: BTreeMap<String, ArtifactDescription>,
}

impl Tree {
    pub fn new(artifacts: BTreeMap<String, ArtifactDescription>) -> Self {
        Self { artifacts }
    }

    pub fn artifacts(&self) -> &BTreeMap<String, ArtifactDescription> {
        &self.artifacts
    }

    pub fn to_json(&self) -> Json {
        let map: BTreeMap<&str, Json> = self
            .artifacts
            .iter()
            .map(|(path, artifact)| (path.as_str(), artifact.to_json()))
            .collect();
        serde_json::json!(map)
    }

    pub fn digest(&self) -> Digest {
        compute_hash(self.to_json().to_string().as_bytes())
    }

    /// Tree ids are prefixed so they cannot collide with action ids.
    pub fn id(&self) -> String {
        format!("tree:{}", self.digest().hex())
    }
}
