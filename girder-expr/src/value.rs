//! Expression values
//!
//! The tagged value type of the expression language: ten variants,
//! immutable after construction, shared by reference. Every value
//! exposes a memoized content hash; equality is hash equality, so
//! structurally equal values compare equal regardless of how they were
//! assembled.

use crate::linked_map::LinkedMap;
use crate::name::EntityName;
use crate::node::TargetNode;
use crate::result::TargetResult;
use girder_core::hash::{compute_hash, Digest, Hasher};
use girder_core::ArtifactDescription;
use once_cell::sync::{Lazy, OnceCell};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Map payload of a value.
pub type MapExpr = Arc<LinkedMap<Value>>;

/// JSON serialization modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonMode {
    /// Expand artifacts, results, and nodes structurally.
    SerializeAll,
    /// Render nodes as `{"type": "NODE", "id": ...}` to break cycles.
    SerializeAllButNodes,
    /// Collapse artifacts, results, nodes, and names to JSON null.
    NullForNonJson,
}

/// The ten value variants.
#[derive(Clone)]
pub enum Kind {
    None,
    Bool(bool),
    Number(f64),
    String(String),
    Name(EntityName),
    Artifact(ArtifactDescription),
    Result(TargetResult),
    Node(TargetNode),
    List(Vec<Value>),
    Map(MapExpr),
}

struct Inner {
    kind: Kind,
    hash: OnceCell<Digest>,
    cacheable: OnceCell<bool>,
}

/// Shared immutable expression value. Cloning is pointer-cheap.
#[derive(Clone)]
pub struct Value(Arc<Inner>);

/// Error raised by typed accessors on a value of the wrong kind.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("Expression is not of type '{expected}' but '{found}'.")]
pub struct TypeError {
    pub expected: &'static str,
    pub found: &'static str,
}

static NONE: Lazy<Value> = Lazy::new(|| Value::new(Kind::None));
static TRUE: Lazy<Value> = Lazy::new(|| Value::new(Kind::Bool(true)));
static FALSE: Lazy<Value> = Lazy::new(|| Value::new(Kind::Bool(false)));
static EMPTY_LIST: Lazy<Value> = Lazy::new(|| Value::new(Kind::List(Vec::new())));
static EMPTY_MAP: Lazy<Value> = Lazy::new(|| Value::new(Kind::Map(LinkedMap::empty())));
static EMPTY_MAP_EXPR: Lazy<Value> = Lazy::new(|| {
    Value::map_from(
        [("type".to_string(), Value::string("empty_map"))]
            .into_iter()
            .collect(),
    )
});

impl Value {
    fn new(kind: Kind) -> Self {
        Value(Arc::new(Inner {
            kind,
            hash: OnceCell::new(),
            cacheable: OnceCell::new(),
        }))
    }

    pub fn none() -> Self {
        NONE.clone()
    }

    pub fn bool(b: bool) -> Self {
        if b {
            TRUE.clone()
        } else {
            FALSE.clone()
        }
    }

    pub fn number(n: f64) -> Self {
        Value::new(Kind::Number(n))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::new(Kind::String(s.into()))
    }

    pub fn name(name: EntityName) -> Self {
        Value::new(Kind::Name(name))
    }

    pub fn artifact(artifact: ArtifactDescription) -> Self {
        Value::new(Kind::Artifact(artifact))
    }

    pub fn result(result: TargetResult) -> Self {
        Value::new(Kind::Result(result))
    }

    pub fn node(node: TargetNode) -> Self {
        Value::new(Kind::Node(node))
    }

    pub fn list(items: Vec<Value>) -> Self {
        if items.is_empty() {
            return EMPTY_LIST.clone();
        }
        Value::new(Kind::List(items))
    }

    pub fn map(map: MapExpr) -> Self {
        Value::new(Kind::Map(map))
    }

    pub fn map_from(entries: BTreeMap<String, Value>) -> Self {
        if entries.is_empty() {
            return EMPTY_MAP.clone();
        }
        Value::map(LinkedMap::from_map(entries))
    }

    pub fn empty_list() -> Self {
        EMPTY_LIST.clone()
    }

    pub fn empty_map() -> Self {
        EMPTY_MAP.clone()
    }

    /// The expression `{"type": "empty_map"}`, the default for map-typed
    /// operator arguments.
    pub fn empty_map_expr() -> Self {
        EMPTY_MAP_EXPR.clone()
    }

    /// Build a value from plain JSON. Only none/bool/number/string/
    /// list/map can result; names, artifacts, results, and nodes have
    /// their own constructors.
    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Value::none(),
            Json::Bool(b) => Value::bool(*b),
            Json::Number(n) => Value::number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => Value::string(s.clone()),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(entries) => Value::map_from(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn kind(&self) -> &Kind {
        &self.0.kind
    }

    pub fn type_string(&self) -> &'static str {
        match &self.0.kind {
            Kind::None => "none",
            Kind::Bool(_) => "bool",
            Kind::Number(_) => "number",
            Kind::String(_) => "string",
            Kind::Name(_) => "name",
            Kind::Artifact(_) => "artifact",
            Kind::Result(_) => "result",
            Kind::Node(_) => "node",
            Kind::List(_) => "list",
            Kind::Map(_) => "map",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(&self.0.kind, Kind::None)
    }

    pub fn is_bool(&self) -> bool {
        matches!(&self.0.kind, Kind::Bool(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(&self.0.kind, Kind::Number(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(&self.0.kind, Kind::String(_))
    }

    pub fn is_name(&self) -> bool {
        matches!(&self.0.kind, Kind::Name(_))
    }

    pub fn is_artifact(&self) -> bool {
        matches!(&self.0.kind, Kind::Artifact(_))
    }

    pub fn is_result(&self) -> bool {
        matches!(&self.0.kind, Kind::Result(_))
    }

    pub fn is_node(&self) -> bool {
        matches!(&self.0.kind, Kind::Node(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(&self.0.kind, Kind::List(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(&self.0.kind, Kind::Map(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.0.kind {
            Kind::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match &self.0.kind {
            Kind::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0.kind {
            Kind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&EntityName> {
        match &self.0.kind {
            Kind::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&ArtifactDescription> {
        match &self.0.kind {
            Kind::Artifact(artifact) => Some(artifact),
            _ => None,
        }
    }

    pub fn as_result(&self) -> Option<&TargetResult> {
        match &self.0.kind {
            Kind::Result(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&TargetNode> {
        match &self.0.kind {
            Kind::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match &self.0.kind {
            Kind::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapExpr> {
        match &self.0.kind {
            Kind::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Typed accessor with a descriptive error.
    pub fn try_str(&self) -> Result<&str, TypeError> {
        self.as_str().ok_or(TypeError {
            expected: "string",
            found: self.type_string(),
        })
    }

    pub fn try_list(&self) -> Result<&[Value], TypeError> {
        self.as_list().ok_or(TypeError {
            expected: "list",
            found: self.type_string(),
        })
    }

    pub fn try_map(&self) -> Result<&MapExpr, TypeError> {
        self.as_map().ok_or(TypeError {
            expected: "map",
            found: self.type_string(),
        })
    }

    /// Map lookup; `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.find(key))
    }

    /// Map lookup with a default for missing keys.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    /// JSON rendering under the given mode.
    pub fn to_json(&self, mode: JsonMode) -> Json {
        match &self.0.kind {
            Kind::None => Json::Null,
            Kind::Bool(b) => json!(b),
            Kind::Number(n) => json!(n),
            Kind::String(s) => json!(s),
            Kind::Name(name) => match mode {
                JsonMode::NullForNonJson => Json::Null,
                _ => name.to_json(),
            },
            Kind::Artifact(artifact) => match mode {
                JsonMode::NullForNonJson => Json::Null,
                _ => artifact.to_json(),
            },
            Kind::Result(result) => match mode {
                JsonMode::NullForNonJson => Json::Null,
                _ => json!({
                    "artifact_stage": result.artifact_stage.to_json(JsonMode::SerializeAllButNodes),
                    "runfiles": result.runfiles.to_json(JsonMode::SerializeAllButNodes),
                    "provides": result.provides.to_json(JsonMode::SerializeAllButNodes),
                }),
            },
            Kind::Node(node) => match mode {
                JsonMode::NullForNonJson => Json::Null,
                JsonMode::SerializeAll => node.to_json(),
                JsonMode::SerializeAllButNodes => json!({
                    "type": "NODE",
                    "id": self.to_identifier(),
                }),
            },
            Kind::List(items) => {
                Json::Array(items.iter().map(|item| item.to_json(mode)).collect())
            }
            Kind::Map(map) => {
                let mut object = serde_json::Map::new();
                for (key, value) in map.items() {
                    object.insert(key.clone(), value.to_json(mode));
                }
                Json::Object(object)
            }
        }
    }

    /// JSON rendering with everything expanded.
    pub fn to_json_all(&self) -> Json {
        self.to_json(JsonMode::SerializeAll)
    }

    /// Compact JSON dump.
    pub fn to_string_json(&self) -> String {
        self.to_json_all().to_string()
    }

    /// JSON dump truncated to at most `limit` characters, with an
    /// elision marker when truncated.
    pub fn to_abbrev_string(&self, limit: usize) -> String {
        abbreviate(&self.to_string_json(), limit)
    }

    /// Content hash; computed once per value under the set-once
    /// discipline.
    pub fn to_hash(&self) -> Digest {
        *self.0.hash.get_or_init(|| self.compute_hash())
    }

    /// Hex rendering of the content hash.
    pub fn to_identifier(&self) -> String {
        self.to_hash().hex()
    }

    /// A value is cacheable iff it transitively contains no names and
    /// no opaque artifact references.
    pub fn is_cacheable(&self) -> bool {
        *self
            .0
            .cacheable
            .get_or_init(|| match &self.0.kind {
                Kind::Name(_) => false,
                Kind::Artifact(artifact) => artifact.is_cacheable(),
                Kind::Result(result) => result.is_cacheable,
                Kind::Node(node) => node.is_cacheable(),
                Kind::List(items) => items.iter().all(Value::is_cacheable),
                Kind::Map(map) => map.items().iter().all(|(_, v)| v.is_cacheable()),
                _ => true,
            })
    }

    fn compute_hash(&self) -> Digest {
        match &self.0.kind {
            Kind::List(items) => {
                let mut hasher = Hasher::new();
                hasher.update(b"[");
                for item in items {
                    hasher.update(item.to_hash().as_bytes());
                }
                hasher.finalize()
            }
            Kind::Map(map) => {
                let mut hasher = Hasher::new();
                hasher.update(b"{");
                for (key, value) in map.items() {
                    hasher.update(compute_hash(key.as_bytes()).as_bytes());
                    hasher.update(value.to_hash().as_bytes());
                }
                hasher.finalize()
            }
            kind => {
                // type-discriminating prefix prevents cross-kind collisions
                let prefix = match kind {
                    Kind::Artifact(_) => "@",
                    Kind::Result(_) => "=",
                    Kind::Node(_) => "#",
                    Kind::Name(_) => "$",
                    _ => "",
                };
                let mut hasher = Hasher::new();
                hasher.update(prefix.as_bytes());
                hasher.update(self.to_string_json().as_bytes());
                hasher.finalize()
            }
        }
    }
}

fn abbreviate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(3);
    let truncated: String = text.chars().take(keep).collect();
    format!("{}...", truncated)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.to_hash() == other.to_hash()
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(&self.to_hash().as_bytes()[..8]);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.to_abbrev_string(64))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_json())
    }
}
