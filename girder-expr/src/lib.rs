//! GIRDER Expression Language
//!
//! The JSON-embedded, side-effect-free expression language of the
//! build engine and its evaluator: content-addressed values, the
//! persistent linked map backing environments and stages, lexically
//! scoped configurations, and user-definable expression functions.

pub mod configuration;
pub mod evaluator;
pub mod function;
pub mod function_map;
pub mod linked_map;
pub mod name;
pub mod node;
pub mod result;
pub mod value;

pub use configuration::Configuration;
pub use evaluator::{builtins, value_is_true, EvalError, Evaluator};
pub use function::{ExpressionFunction, ExpressionFunctionPtr};
pub use function_map::{EvalFunction, FunctionMap, SubEval};
pub use linked_map::LinkedMap;
pub use name::{AnonymousTarget, EntityName, NamedTarget, ReferenceKind};
pub use node::{AbstractNode, TargetNode};
pub use result::{ResultError, TargetResult};
pub use value::{JsonMode, Kind, MapExpr, Value};
