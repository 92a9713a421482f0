//! Target nodes
//!
//! A node wraps either a finished target result (value node) or an
//! uninstantiated rule application (abstract node) that the analyzer
//! turns into an anonymous target later.

use crate::value::Value;
use serde_json::{json, Value as Json};

/// Abstract node data: a node type resolved via a rule map, plus the
/// string and target fields to instantiate the rule with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbstractNode {
    pub node_type: String,
    /// map from field name to list of strings
    pub string_fields: Value,
    /// map from field name to list of target nodes
    pub target_fields: Value,
}

impl AbstractNode {
    pub fn is_cacheable(&self) -> bool {
        self.target_fields.is_cacheable()
    }
}

/// Value node or abstract node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetNode {
    Value(Value),
    Abstract(AbstractNode),
}

impl TargetNode {
    pub fn value(result: Value) -> Self {
        TargetNode::Value(result)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, TargetNode::Value(_))
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self, TargetNode::Abstract(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            TargetNode::Value(value) => Some(value),
            TargetNode::Abstract(_) => None,
        }
    }

    pub fn as_abstract(&self) -> Option<&AbstractNode> {
        match self {
            TargetNode::Value(_) => None,
            TargetNode::Abstract(abstract_node) => Some(abstract_node),
        }
    }

    pub fn is_cacheable(&self) -> bool {
        match self {
            TargetNode::Value(value) => value.is_cacheable(),
            TargetNode::Abstract(abstract_node) => abstract_node.is_cacheable(),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            TargetNode::Value(value) => json!({
                "type": "VALUE_NODE",
                "result": value.to_json_all(),
            }),
            TargetNode::Abstract(abstract_node) => json!({
                "type": "ABSTRACT_NODE",
                "node_type": abstract_node.node_type,
                "string_fields": abstract_node.string_fields.to_json_all(),
                "target_fields": abstract_node.target_fields.to_json_all(),
            }),
        }
    }
}
