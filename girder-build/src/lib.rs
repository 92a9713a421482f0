//! GIRDER Build - Target Analysis Engine
//!
//! Elaborates declarative target descriptions into a DAG of
//! content-addressed actions: rule schemas, configured-target
//! memoization, the recursive target analyzer with its built-in rule
//! handlers, and the result registry the traverser consumes.

pub mod analysed_target;
pub mod built_in_rules;
pub mod configured_target;
pub mod context;
pub mod exit_code;
pub mod graph_info;
pub mod result_map;
pub mod roots;
pub mod rules;
pub mod serve;
pub mod statistics;
pub mod target_map;
pub mod utils;

pub use analysed_target::{AnalysedTarget, AnalysedTargetPtr};
pub use configured_target::{ConfiguredTarget, ConfiguredTargetPtr};
pub use context::{AnalyseContext, ExportCacheHook, Repository, RepositoryConfig};
pub use exit_code::ExitCode;
pub use graph_info::TargetGraphInformation;
pub use result_map::ResultMap;
pub use roots::{DirectoryEntries, FileRoot, InMemoryFileRoot, RootError};
pub use rules::{parse_entity_name, parse_rule, AnonymousDefinition, RuleError, UserRule, UserRulePtr};
pub use serve::{ServeApi, ServeError, ServedTarget};
pub use statistics::Statistics;
pub use target_map::{create_target_map, Analysis, TargetCtx, TargetMap};
