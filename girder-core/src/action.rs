//! Action descriptions
//!
//! An action description is the traverser-facing record of one command
//! invocation: its staged inputs, declared outputs, command line, and
//! execution attributes. The id is the digest of the canonical JSON
//! form, so semantically equal actions coincide.

use crate::artifact::ArtifactDescription;
use crate::hash::{compute_hash, Digest};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

/// Errors raised when assembling an action description.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("cmd must not be an empty list")]
    EmptyCommand,

    #[error("cwd has to be a non-upwards relative path, but found {cwd}")]
    UpwardsCwd { cwd: String },
}

/// Full description of one build action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDescription {
    pub outputs: Vec<String>,
    pub output_dirs: Vec<String>,
    pub command: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub may_fail: Option<String>,
    pub no_cache: bool,
    pub timeout_scale: f64,
    pub execution_properties: BTreeMap<String, String>,
    pub inputs: BTreeMap<String, ArtifactDescription>,
}

impl ActionDescription {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outputs: Vec<String>,
        output_dirs: Vec<String>,
        command: Vec<String>,
        cwd: String,
        env: BTreeMap<String, String>,
        may_fail: Option<String>,
        no_cache: bool,
        timeout_scale: f64,
        execution_properties: BTreeMap<String, String>,
        inputs: BTreeMap<String, ArtifactDescription>,
    ) -> Result<Self, ActionError> {
        if command.is_empty() {
            return Err(ActionError::EmptyCommand);
        }
        if !crate::path::is_non_upwards(&cwd) {
            return Err(ActionError::UpwardsCwd { cwd });
        }
        Ok(Self {
            outputs,
            output_dirs,
            command,
            cwd,
            env,
            may_fail,
            no_cache,
            timeout_scale,
            execution_properties,
            inputs,
        })
    }

    /// Canonical JSON form; optional attributes are emitted only when
    /// they deviate from their defaults.
    pub fn to_json(&self) -> Json {
        let inputs: BTreeMap<&str, Json> = self
            .inputs
            .iter()
            .map(|(path, artifact)| (path.as_str(), artifact.to_json()))
            .collect();
        let mut desc = json!({
            "output": self.outputs,
            "output_dirs": self.output_dirs,
            "command": self.command,
            "input": inputs,
            "env": self.env,
        });
        let obj = desc
            .as_object_mut()
            .expect("literal object is always a map");
        if self.cwd != "." && !self.cwd.is_empty() {
            obj.insert("cwd".to_string(), json!(self.cwd));
        }
        if let Some(msg) = &self.may_fail {
            obj.insert("may_fail".to_string(), json!(msg));
        }
        if self.no_cache {
            obj.insert("no_cache".to_string(), json!(true));
        }
        if self.timeout_scale != 1.0 {
            obj.insert("timeout scaling".to_string(), json!(self.timeout_scale));
        }
        if !self.execution_properties.is_empty() {
            obj.insert(
                "execution properties".to_string(),
                json!(self.execution_properties),
            );
        }
        desc
    }

    /// Stable identifier: digest of the canonical JSON form.
    pub fn id(&self) -> String {
        self.digest().hex()
    }

    pub fn digest(&self) -> Digest {
        compute_hash(self.to_json().to_string().as_bytes())
    }
}
