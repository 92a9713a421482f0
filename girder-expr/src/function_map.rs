//! Function maps
//!
//! Operator dispatch table for the evaluator: a linked map from
//! operator name to evaluation function. Overlaying user-defined
//! callees or provider-injected built-ins over the base catalog is one
//! O(1) link.

use crate::configuration::Configuration;
use crate::evaluator::EvalError;
use crate::linked_map::LinkedMap;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Re-entry point handed to operator implementations for evaluating
/// sub-expressions.
pub type SubEval<'a> = &'a dyn Fn(&Value, &Configuration) -> Result<Value, EvalError>;

/// One operator implementation.
pub type EvalFunction =
    Arc<dyn Fn(SubEval, &Value, &Configuration) -> Result<Value, EvalError> + Send + Sync>;

/// Linked overlay of operator tables.
#[derive(Clone)]
pub struct FunctionMap {
    map: Arc<LinkedMap<EvalFunction>>,
}

impl FunctionMap {
    pub fn empty() -> Self {
        Self {
            map: LinkedMap::empty(),
        }
    }

    pub fn from_entries(entries: Vec<(&str, EvalFunction)>) -> Self {
        let table: BTreeMap<String, EvalFunction> = entries
            .into_iter()
            .map(|(name, function)| (name.to_string(), function))
            .collect();
        Self {
            map: LinkedMap::from_map(table),
        }
    }

    /// Overlay `entries` over `base`; the overlay shadows.
    pub fn link(base: &FunctionMap, entries: Vec<(&str, EvalFunction)>) -> Self {
        let table: BTreeMap<String, EvalFunction> = entries
            .into_iter()
            .map(|(name, function)| (name.to_string(), function))
            .collect();
        Self {
            map: LinkedMap::shadow(base.map.clone(), table),
        }
    }

    /// Overlay a whole function map over `base`.
    pub fn chain(base: &FunctionMap, overlay: &FunctionMap) -> Self {
        Self {
            map: LinkedMap::link(base.map.clone(), overlay.map.clone()),
        }
    }

    pub fn find(&self, name: &str) -> Option<&EvalFunction> {
        self.map.find(name)
    }
}
