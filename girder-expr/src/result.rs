//! Target results
//!
//! The {artifact_stage, runfiles, provides} triple produced by
//! analysing a target, together with the deduplicating serialization
//! used by the target cache: every structurally distinct
//! sub-expression of the provides map is written once into a shared
//! nodes table, and three membership lists record which entries are
//! artifacts, nodes, and results so deserialization can undo the
//! encoding unambiguously.

use crate::linked_map::LinkedMap;
use crate::node::{AbstractNode, TargetNode};
use crate::value::Value;
use girder_core::{ArtifactDescription, ObjectInfo};
use serde_json::{json, Value as Json};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Errors from (de)serializing target results.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResultError {
    #[error("No replacement for non-known artifact found.")]
    MissingReplacement,

    #[error("Malformed target-result entry: {reason}")]
    Malformed { reason: String },
}

/// Output of analysing one target.
#[derive(Debug, Clone)]
pub struct TargetResult {
    pub artifact_stage: Value,
    pub runfiles: Value,
    pub provides: Value,
    pub is_cacheable: bool,
}

impl TargetResult {
    pub fn new(artifact_stage: Value, runfiles: Value, provides: Value) -> Self {
        let is_cacheable = provides.is_cacheable();
        Self {
            artifact_stage,
            runfiles,
            provides,
            is_cacheable,
        }
    }

    /// A result reconstructed from cache is cacheable by construction.
    fn from_cache(artifact_stage: Value, runfiles: Value, provides: Value) -> Self {
        Self {
            artifact_stage,
            runfiles,
            provides,
            is_cacheable: true,
        }
    }

    /// Serialize without artifact replacement.
    pub fn to_json(&self) -> Result<Json, ResultError> {
        self.serialize_with(&HashMap::new())
    }

    /// Serialize, replacing every non-known artifact via `replacements`.
    /// A non-known artifact without a replacement is an error.
    pub fn replace_non_known_and_to_json(
        &self,
        replacements: &HashMap<ArtifactDescription, ObjectInfo>,
    ) -> Result<Json, ResultError> {
        self.serialize_with(replacements)
    }

    fn serialize_with(
        &self,
        replacements: &HashMap<ArtifactDescription, ObjectInfo>,
    ) -> Result<Json, ResultError> {
        Ok(json!({
            "artifacts": serialize_artifact_map(&self.artifact_stage, replacements)?,
            "runfiles": serialize_artifact_map(&self.runfiles, replacements)?,
            "provides": serialize_provides_map(&self.provides, replacements)?,
        }))
    }

    /// Reconstruct a result from its serialized form.
    pub fn from_json(json: &Json) -> Result<Self, ResultError> {
        let artifacts = deserialize_artifact_map(field(json, "artifacts")?)?;
        let runfiles = deserialize_artifact_map(field(json, "runfiles")?)?;
        let provides = deserialize_provides_map(field(json, "provides")?)?;
        Ok(TargetResult::from_cache(artifacts, runfiles, provides))
    }
}

impl PartialEq for TargetResult {
    fn eq(&self, other: &Self) -> bool {
        self.artifact_stage == other.artifact_stage
            && self.provides == other.provides
            && self.runfiles == other.runfiles
    }
}

impl Eq for TargetResult {}

impl std::hash::Hash for TargetResult {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.artifact_stage.hash(state);
        self.provides.hash(state);
        self.runfiles.hash(state);
    }
}

fn field<'a>(json: &'a Json, name: &str) -> Result<&'a Json, ResultError> {
    json.get(name).ok_or_else(|| ResultError::Malformed {
        reason: format!("missing field '{}'", name),
    })
}

fn serialize_artifact(
    value: &Value,
    replacements: &HashMap<ArtifactDescription, ObjectInfo>,
) -> Result<Json, ResultError> {
    let artifact = value.as_artifact().ok_or_else(|| ResultError::Malformed {
        reason: format!("expected artifact, got {}", value.type_string()),
    })?;
    if !replacements.is_empty() && !artifact.is_known() {
        let info = replacements
            .get(artifact)
            .ok_or(ResultError::MissingReplacement)?;
        return Ok(ArtifactDescription::known(info.digest, info.object_type).to_json());
    }
    Ok(value.to_json_all())
}

fn serialize_artifact_map(
    stage: &Value,
    replacements: &HashMap<ArtifactDescription, ObjectInfo>,
) -> Result<Json, ResultError> {
    if replacements.is_empty() {
        return Ok(stage.to_json_all());
    }
    let map = stage.as_map().ok_or_else(|| ResultError::Malformed {
        reason: format!("expected artifact map, got {}", stage.type_string()),
    })?;
    let mut object = serde_json::Map::new();
    for (path, value) in map.items() {
        object.insert(path.clone(), serialize_artifact(value, replacements)?);
    }
    Ok(Json::Object(object))
}

fn deserialize_artifact_map(json: &Json) -> Result<Value, ResultError> {
    let object = json.as_object().ok_or_else(|| ResultError::Malformed {
        reason: "artifact map is not an object".to_string(),
    })?;
    let mut entries = BTreeMap::new();
    for (path, value) in object {
        let artifact =
            ArtifactDescription::from_json(value).map_err(|e| ResultError::Malformed {
                reason: format!("artifact at {}: {}", path, e),
            })?;
        entries.insert(path.clone(), Value::artifact(artifact));
    }
    Ok(Value::map_from(entries))
}

/// Walk the expression, writing every structurally distinct
/// sub-expression once into `nodes` and returning its identifier.
fn serialize_expression(
    nodes: &mut BTreeMap<String, Json>,
    provided_artifacts: &mut Vec<String>,
    provided_nodes: &mut Vec<String>,
    provided_results: &mut Vec<String>,
    expr: &Value,
    replacements: &HashMap<ArtifactDescription, ObjectInfo>,
) -> Result<String, ResultError> {
    let id = expr.to_identifier();
    if nodes.contains_key(&id) {
        return Ok(id);
    }
    let json = if let Some(map) = expr.as_map() {
        let mut hashes = serde_json::Map::new();
        for (key, value) in map.items() {
            let hash = serialize_expression(
                nodes,
                provided_artifacts,
                provided_nodes,
                provided_results,
                value,
                replacements,
            )?;
            hashes.insert(key.clone(), json!(hash));
        }
        Json::Object(hashes)
    } else if let Some(list) = expr.as_list() {
        let mut hashes = Vec::with_capacity(list.len());
        for value in list {
            hashes.push(json!(serialize_expression(
                nodes,
                provided_artifacts,
                provided_nodes,
                provided_results,
                value,
                replacements,
            )?));
        }
        Json::Array(hashes)
    } else if let Some(node) = expr.as_node() {
        provided_nodes.push(id.clone());
        match node {
            TargetNode::Value(result) => {
                let hash = serialize_expression(
                    nodes,
                    provided_artifacts,
                    provided_nodes,
                    provided_results,
                    result,
                    replacements,
                )?;
                json!({"type": "VALUE_NODE", "result": hash})
            }
            TargetNode::Abstract(abstract_node) => {
                let string_fields = serialize_expression(
                    nodes,
                    provided_artifacts,
                    provided_nodes,
                    provided_results,
                    &abstract_node.string_fields,
                    replacements,
                )?;
                let target_fields = serialize_expression(
                    nodes,
                    provided_artifacts,
                    provided_nodes,
                    provided_results,
                    &abstract_node.target_fields,
                    replacements,
                )?;
                json!({
                    "type": "ABSTRACT_NODE",
                    "node_type": abstract_node.node_type,
                    "string_fields": string_fields,
                    "target_fields": target_fields,
                })
            }
        }
    } else if let Some(result) = expr.as_result() {
        provided_results.push(id.clone());
        let artifact_stage = serialize_expression(
            nodes,
            provided_artifacts,
            provided_nodes,
            provided_results,
            &result.artifact_stage,
            replacements,
        )?;
        let runfiles = serialize_expression(
            nodes,
            provided_artifacts,
            provided_nodes,
            provided_results,
            &result.runfiles,
            replacements,
        )?;
        let provides = serialize_expression(
            nodes,
            provided_artifacts,
            provided_nodes,
            provided_results,
            &result.provides,
            replacements,
        )?;
        json!({
            "artifact_stage": artifact_stage,
            "runfiles": runfiles,
            "provides": provides,
        })
    } else if expr.is_artifact() {
        provided_artifacts.push(id.clone());
        serialize_artifact(expr, replacements)?
    } else {
        expr.to_json_all()
    };
    nodes.insert(id.clone(), json);
    Ok(id)
}

fn serialize_provides_map(
    provides: &Value,
    replacements: &HashMap<ArtifactDescription, ObjectInfo>,
) -> Result<Json, ResultError> {
    let mut nodes = BTreeMap::new();
    let mut provided_artifacts = Vec::new();
    let mut provided_nodes = Vec::new();
    let mut provided_results = Vec::new();
    let entry = serialize_expression(
        &mut nodes,
        &mut provided_artifacts,
        &mut provided_nodes,
        &mut provided_results,
        provides,
        replacements,
    )?;
    Ok(json!({
        "entry": entry,
        "nodes": nodes,
        "provided_artifacts": provided_artifacts,
        "provided_nodes": provided_nodes,
        "provided_results": provided_results,
    }))
}

fn json_set(json: &Json) -> Result<HashSet<String>, ResultError> {
    let list = json.as_array().ok_or_else(|| ResultError::Malformed {
        reason: "membership set is not a list".to_string(),
    })?;
    list.iter()
        .map(|entry| {
            entry
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ResultError::Malformed {
                    reason: "membership entry is not a string".to_string(),
                })
        })
        .collect()
}

struct ProvidesDecoder<'a> {
    nodes: &'a Json,
    provided_artifacts: HashSet<String>,
    provided_nodes: HashSet<String>,
    provided_results: HashSet<String>,
    sofar: HashMap<String, Value>,
}

impl ProvidesDecoder<'_> {
    fn decode(&mut self, entry: &Json) -> Result<Value, ResultError> {
        let id = entry
            .as_str()
            .ok_or_else(|| ResultError::Malformed {
                reason: "node reference is not a string".to_string(),
            })?
            .to_string();
        if let Some(value) = self.sofar.get(&id) {
            return Ok(value.clone());
        }
        let json = self
            .nodes
            .get(&id)
            .ok_or_else(|| ResultError::Malformed {
                reason: format!("dangling node reference {}", id),
            })?
            .clone();
        let value = if json.is_object() {
            if self.provided_artifacts.contains(&id) {
                let artifact =
                    ArtifactDescription::from_json(&json).map_err(|e| ResultError::Malformed {
                        reason: format!("artifact node {}: {}", id, e),
                    })?;
                Value::artifact(artifact)
            } else if self.provided_nodes.contains(&id) {
                match json.get("type").and_then(Json::as_str) {
                    Some("VALUE_NODE") => {
                        let result = self.decode(field(&json, "result")?)?;
                        Value::node(TargetNode::Value(result))
                    }
                    Some("ABSTRACT_NODE") => {
                        let node_type = field(&json, "node_type")?
                            .as_str()
                            .ok_or_else(|| ResultError::Malformed {
                                reason: "node_type is not a string".to_string(),
                            })?
                            .to_string();
                        let string_fields = self.decode(field(&json, "string_fields")?)?;
                        let target_fields = self.decode(field(&json, "target_fields")?)?;
                        Value::node(TargetNode::Abstract(AbstractNode {
                            node_type,
                            string_fields,
                            target_fields,
                        }))
                    }
                    _ => {
                        return Err(ResultError::Malformed {
                            reason: format!("unknown node encoding for {}", id),
                        })
                    }
                }
            } else if self.provided_results.contains(&id) {
                let artifact_stage = self.decode(field(&json, "artifact_stage")?)?;
                let runfiles = self.decode(field(&json, "runfiles")?)?;
                let provides = self.decode(field(&json, "provides")?)?;
                Value::result(TargetResult::from_cache(artifact_stage, runfiles, provides))
            } else {
                let object = json.as_object().expect("checked object above");
                let mut entries = BTreeMap::new();
                for (key, reference) in object {
                    entries.insert(key.clone(), self.decode(reference)?);
                }
                Value::map(LinkedMap::from_map(entries))
            }
        } else if let Some(list) = json.as_array() {
            let mut items = Vec::with_capacity(list.len());
            for reference in list {
                items.push(self.decode(reference)?);
            }
            Value::list(items)
        } else {
            Value::from_json(&json)
        };
        self.sofar.insert(id, value.clone());
        Ok(value)
    }
}

fn deserialize_provides_map(json: &Json) -> Result<Value, ResultError> {
    let mut decoder = ProvidesDecoder {
        nodes: field(json, "nodes")?,
        provided_artifacts: json_set(field(json, "provided_artifacts")?)?,
        provided_nodes: json_set(field(json, "provided_nodes")?)?,
        provided_results: json_set(field(json, "provided_results")?)?,
        sofar: HashMap::new(),
    };
    decoder.decode(field(json, "entry")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::{compute_hash, ObjectType};

    fn known(data: &[u8]) -> Value {
        Value::artifact(ArtifactDescription::known(
            compute_hash(data),
            ObjectType::File,
        ))
    }

    fn stage(entries: &[(&str, Value)]) -> Value {
        Value::map_from(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_round_trip_plain() {
        let result = TargetResult::new(
            stage(&[("out", known(b"a"))]),
            stage(&[("run", known(b"b"))]),
            Value::from_json(&serde_json::json!({"flags": ["-O2"]})),
        );
        let json = result.to_json().expect("serializes");
        let back = TargetResult::from_json(&json).expect("deserializes");
        assert_eq!(result, back);
        assert!(back.is_cacheable);
    }

    #[test]
    fn test_round_trip_with_nodes_and_results() {
        let inner = TargetResult::new(
            stage(&[("f", known(b"inner"))]),
            Value::empty_map(),
            Value::empty_map(),
        );
        let node = Value::node(TargetNode::Value(Value::result(inner)));
        let provides = stage(&[("nodes", Value::list(vec![node]))]);
        let result = TargetResult::new(Value::empty_map(), Value::empty_map(), provides);
        let json = result.to_json().expect("serializes");
        let back = TargetResult::from_json(&json).expect("deserializes");
        assert_eq!(result, back);
    }

    #[test]
    fn test_replacement_of_non_known() {
        let action_artifact = ArtifactDescription::action("act0", "out");
        let replacement = ObjectInfo {
            digest: compute_hash(b"built"),
            object_type: ObjectType::File,
        };
        let result = TargetResult::new(
            stage(&[("out", Value::artifact(action_artifact.clone()))]),
            Value::empty_map(),
            stage(&[("direct", Value::artifact(action_artifact.clone()))]),
        );
        let replacements = HashMap::from([(action_artifact, replacement)]);
        let json = result
            .replace_non_known_and_to_json(&replacements)
            .expect("serializes with replacement");
        let back = TargetResult::from_json(&json).expect("deserializes");
        assert!(back.is_cacheable);
        let replaced = back.artifact_stage.get("out").expect("out is staged");
        assert_eq!(
            replaced.as_artifact().expect("is artifact"),
            &ArtifactDescription::known(replacement.digest, replacement.object_type)
        );
        let provided = back.provides.get("direct").expect("provided");
        assert!(provided.as_artifact().expect("is artifact").is_known());
    }

    #[test]
    fn test_missing_replacement_is_fatal() {
        let result = TargetResult::new(
            stage(&[("out", Value::artifact(ArtifactDescription::action("a", "p")))]),
            Value::empty_map(),
            Value::empty_map(),
        );
        let replacements = HashMap::from([(
            ArtifactDescription::action("other", "p"),
            ObjectInfo {
                digest: compute_hash(b"x"),
                object_type: ObjectType::File,
            },
        )]);
        assert_eq!(
            result.replace_non_known_and_to_json(&replacements),
            Err(ResultError::MissingReplacement)
        );
    }

    #[test]
    fn test_shared_subexpressions_written_once() {
        let shared = Value::from_json(&serde_json::json!(["shared", "value"]));
        let provides = stage(&[("a", shared.clone()), ("b", shared)]);
        let result = TargetResult::new(Value::empty_map(), Value::empty_map(), provides);
        let json = result.to_json().expect("serializes");
        let nodes = json["provides"]["nodes"].as_object().expect("nodes table");
        // one entry each: the shared list, its two strings, the two
        // stage maps of the result, and the provides map itself
        let list_entries = nodes.values().filter(|v| v.is_array()).count();
        assert_eq!(list_entries, 1);
    }
}
