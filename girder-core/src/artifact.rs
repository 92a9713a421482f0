//! Artifact descriptions
//!
//! An artifact description references a produced or known file-system
//! object. Only known and tree artifacts are content-addressed by
//! themselves; local and action artifacts carry identity that is
//! resolved later by the traverser.

use crate::hash::{compute_hash, Digest};
use crate::object_type::ObjectType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::fmt;

/// Digest plus object type; everything needed to address an object in
/// the CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub digest: Digest,
    #[serde(rename = "file_type")]
    pub object_type: ObjectType,
}

impl fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.digest, self.object_type)
    }
}

/// Errors from parsing artifact descriptions.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("Invalid artifact type '{found}'")]
    InvalidType { found: String },

    #[error("Missing field '{field}' in {artifact_type} artifact")]
    MissingField {
        artifact_type: String,
        field: String,
    },

    #[error("Invalid value for field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

/// One of the four artifact shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactDescription {
    /// A file in a source root, by path and repository.
    Local { path: String, repository: String },
    /// An object already present in the CAS.
    Known { info: ObjectInfo },
    /// An output of an action, by action id and path within its outputs.
    Action { action_id: String, path: String },
    /// A synthesized tree, by tree id.
    Tree { tree_id: String },
}

impl ArtifactDescription {
    pub fn local(path: impl Into<String>, repository: impl Into<String>) -> Self {
        ArtifactDescription::Local {
            path: path.into(),
            repository: repository.into(),
        }
    }

    pub fn known(digest: Digest, object_type: ObjectType) -> Self {
        ArtifactDescription::Known {
            info: ObjectInfo {
                digest,
                object_type,
            },
        }
    }

    pub fn action(action_id: impl Into<String>, path: impl Into<String>) -> Self {
        ArtifactDescription::Action {
            action_id: action_id.into(),
            path: path.into(),
        }
    }

    pub fn tree(tree_id: impl Into<String>) -> Self {
        ArtifactDescription::Tree {
            tree_id: tree_id.into(),
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ArtifactDescription::Known { .. })
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, ArtifactDescription::Tree { .. })
    }

    /// Known and tree artifacts are fingerprinted by content; local and
    /// action artifacts carry opaque identity.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            ArtifactDescription::Known { .. } | ArtifactDescription::Tree { .. }
        )
    }

    /// The object info of a known artifact.
    pub fn to_known_info(&self) -> Option<ObjectInfo> {
        match self {
            ArtifactDescription::Known { info } => Some(*info),
            _ => None,
        }
    }

    /// Canonical JSON form.
    pub fn to_json(&self) -> Json {
        match self {
            ArtifactDescription::Local { path, repository } => json!({
                "type": "LOCAL",
                "data": {"path": path, "repository": repository},
            }),
            ArtifactDescription::Known { info } => json!({
                "type": "KNOWN",
                "data": {"id": info.digest.hex(), "file_type": info.object_type.as_str()},
            }),
            ArtifactDescription::Action { action_id, path } => json!({
                "type": "ACTION",
                "data": {"id": action_id, "path": path},
            }),
            ArtifactDescription::Tree { tree_id } => json!({
                "type": "TREE",
                "data": {"id": tree_id},
            }),
        }
    }

    /// Parse the canonical JSON form.
    pub fn from_json(json: &Json) -> Result<Self, ArtifactError> {
        let type_str = json
            .get("type")
            .and_then(Json::as_str)
            .ok_or_else(|| ArtifactError::MissingField {
                artifact_type: "artifact".to_string(),
                field: "type".to_string(),
            })?;
        let data = json.get("data").ok_or_else(|| ArtifactError::MissingField {
            artifact_type: type_str.to_string(),
            field: "data".to_string(),
        })?;
        let get_str = |field: &str| -> Result<String, ArtifactError> {
            data.get(field)
                .and_then(Json::as_str)
                .map(str::to_string)
                .ok_or_else(|| ArtifactError::MissingField {
                    artifact_type: type_str.to_string(),
                    field: field.to_string(),
                })
        };
        match type_str {
            "LOCAL" => Ok(ArtifactDescription::Local {
                path: get_str("path")?,
                repository: get_str("repository")?,
            }),
            "KNOWN" => {
                let digest: Digest =
                    get_str("id")?
                        .parse()
                        .map_err(|e| ArtifactError::InvalidField {
                            field: "id".to_string(),
                            reason: format!("{}", e),
                        })?;
                let file_type = get_str("file_type")?;
                let object_type = ObjectType::from_str_opt(&file_type).ok_or(
                    ArtifactError::InvalidField {
                        field: "file_type".to_string(),
                        reason: format!("unknown object type '{}'", file_type),
                    },
                )?;
                Ok(ArtifactDescription::known(digest, object_type))
            }
            "ACTION" => Ok(ArtifactDescription::Action {
                action_id: get_str("id")?,
                path: get_str("path")?,
            }),
            "TREE" => Ok(ArtifactDescription::Tree {
                tree_id: get_str("id")?,
            }),
            other => Err(ArtifactError::InvalidType {
                found: other.to_string(),
            }),
        }
    }

    /// Stable identifier: digest of the canonical JSON form.
    pub fn id(&self) -> Digest {
        compute_hash(self.to_json().to_string().as_bytes())
    }
}
