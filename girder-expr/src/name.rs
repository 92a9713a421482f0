//! Entity names
//!
//! A name references an entity without carrying its content: a named
//! reference into a repository/module, or an anonymous reference
//! consisting of a rule map and a target node. Names are the one value
//! kind that is never cacheable.

use crate::value::Value;
use serde_json::{json, Value as Json};
use std::fmt;

/// What a named reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Target,
    File,
    Tree,
    Symlink,
    Glob,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Target => "target",
            ReferenceKind::File => "file",
            ReferenceKind::Tree => "tree",
            ReferenceKind::Symlink => "symlink",
            ReferenceKind::Glob => "glob",
        }
    }
}

/// A reference by repository, module path, and local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedTarget {
    pub repository: String,
    pub module: String,
    pub name: String,
    pub reference: ReferenceKind,
}

impl NamedTarget {
    pub fn new(
        repository: impl Into<String>,
        module: impl Into<String>,
        name: impl Into<String>,
        reference: ReferenceKind,
    ) -> Self {
        Self {
            repository: repository.into(),
            module: module.into(),
            name: name.into(),
            reference,
        }
    }

    /// The `[repository, module, name]` triple used in cache keys.
    pub fn to_triple(&self) -> Json {
        json!([self.repository, self.module, self.name])
    }
}

/// An uninstantiated rule application: the rule map to resolve the node
/// type in, and the node to instantiate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnonymousTarget {
    pub rule_map: Value,
    pub target_node: Value,
}

/// Entity reference: named or anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityName {
    Named(NamedTarget),
    Anonymous(AnonymousTarget),
}

impl EntityName {
    pub fn named(
        repository: impl Into<String>,
        module: impl Into<String>,
        name: impl Into<String>,
        reference: ReferenceKind,
    ) -> Self {
        EntityName::Named(NamedTarget::new(repository, module, name, reference))
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, EntityName::Anonymous(_))
    }

    pub fn as_named(&self) -> Option<&NamedTarget> {
        match self {
            EntityName::Named(named) => Some(named),
            EntityName::Anonymous(_) => None,
        }
    }

    pub fn as_anonymous(&self) -> Option<&AnonymousTarget> {
        match self {
            EntityName::Named(_) => None,
            EntityName::Anonymous(anonymous) => Some(anonymous),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            EntityName::Named(named) => {
                if named.reference == ReferenceKind::Target {
                    json!([named.repository, named.module, named.name])
                } else {
                    json!([
                        named.repository,
                        named.module,
                        named.name,
                        named.reference.as_str()
                    ])
                }
            }
            EntityName::Anonymous(anonymous) => json!({
                "anonymous": {
                    "rule_map": anonymous.rule_map.to_identifier(),
                    "target_node": anonymous.target_node.to_identifier(),
                }
            }),
        }
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_to_json() {
        let target = EntityName::named("base", "src", "lib", ReferenceKind::Target);
        assert_eq!(target.to_json(), json!(["base", "src", "lib"]));
        let file = EntityName::named("base", "src", "main.c", ReferenceKind::File);
        assert_eq!(file.to_json(), json!(["base", "src", "main.c", "file"]));
    }

    #[test]
    fn test_equality_includes_reference_kind() {
        let target = EntityName::named("r", "m", "n", ReferenceKind::Target);
        let file = EntityName::named("r", "m", "n", ReferenceKind::File);
        assert_ne!(target, file);
    }
}
