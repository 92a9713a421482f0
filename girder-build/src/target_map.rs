//! Target analyzer
//!
//! Reader for the configured-target map: dispatches on the reference
//! kind of the requested name (file, symlink, tree, glob, anonymous,
//! named target), drives rule evaluation, and registers elaborated
//! results. All recursion between configured targets goes through the
//! async task map, so sharing and cycle detection come for free.

use crate::analysed_target::{AnalysedTarget, AnalysedTargetPtr};
use crate::built_in_rules;
use crate::configured_target::{ConfiguredTarget, ConfiguredTargetPtr};
use crate::context::AnalyseContext;
use crate::graph_info::TargetGraphInformation;
use crate::result_map::ResultMap;
use crate::rules::{
    parse_entity_name, parse_entity_name_from_expression, parse_rule, UserRulePtr,
};
use crate::serve::ServedTarget;
use crate::utils;
use girder_async::{AsyncTaskMap, Failure, Logger, Reader, TaskContext};
use girder_core::{compute_hash, path, ArtifactDescription, ObjectType, Tree};
use girder_expr::{
    AbstractNode, AnonymousTarget, Configuration, EntityName, EvalError, EvalFunction,
    FunctionMap, NamedTarget, ReferenceKind, TargetNode, TargetResult, Value,
};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub type TargetMap = AsyncTaskMap<ConfiguredTarget, AnalysedTargetPtr>;
pub type TargetCtx = TaskContext<ConfiguredTarget, AnalysedTargetPtr>;

/// Shared state of one analysis run: the context plus memoized
/// entry-point files.
pub struct Analysis {
    pub context: Arc<AnalyseContext>,
    pub result_map: Arc<ResultMap>,
    targets_files: Mutex<HashMap<(String, String), Arc<Json>>>,
    rules: Mutex<HashMap<NamedTarget, UserRulePtr>>,
}

impl Analysis {
    pub fn new(context: Arc<AnalyseContext>, result_map: Arc<ResultMap>) -> Arc<Self> {
        Arc::new(Self {
            context,
            result_map,
            targets_files: Mutex::new(HashMap::new()),
            rules: Mutex::new(HashMap::new()),
        })
    }
}

/// Build the configured-target map over the given analysis state.
pub fn create_target_map(analysis: Arc<Analysis>, logger: Logger) -> Arc<TargetMap> {
    let reader: Reader<ConfiguredTarget, AnalysedTargetPtr> = Arc::new(move |ctx, key| {
        let analysis = analysis.clone();
        Box::pin(async move { analyse_target(analysis, ctx, key).await })
    });
    AsyncTaskMap::new(reader, logger)
}

fn fatal(msg: impl Into<String>) -> Failure {
    Failure::fatal(msg)
}

fn while_analysing(what: &str, target: &ConfiguredTarget, failure: Failure) -> Failure {
    Failure {
        msg: format!(
            "While analysing {} {}:\n{}",
            what,
            target.to_short_string(girder_expr::Evaluator::DEFAULT_LOG_LIMIT),
            failure.msg
        ),
        fatal: failure.fatal,
    }
}

/// Evaluate a plain expression, turning the logged error trace into a
/// message.
fn eval_expr(
    analysis: &Analysis,
    expr: &Value,
    env: &Configuration,
    functions: &FunctionMap,
) -> Result<Value, String> {
    let buffer = Mutex::new(String::new());
    let result = analysis.context.evaluator.evaluate_expression(
        expr,
        env,
        functions,
        &|msg| {
            if let Ok(mut b) = buffer.lock() {
                b.push_str(msg);
            }
        },
        None,
        None,
    );
    result.ok_or_else(|| buffer.lock().map(|b| b.clone()).unwrap_or_default())
}

async fn analyse_target(
    analysis: Arc<Analysis>,
    ctx: TargetCtx,
    key: ConfiguredTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    analysis.context.statistics.increment_targets_analysed();
    match key.target.clone() {
        EntityName::Anonymous(anonymous) => {
            with_target_node(&analysis, &ctx, &key, &anonymous).await
        }
        EntityName::Named(named) => match named.reference {
            ReferenceKind::File => source_file_target(&analysis, &named)
                .map_err(|f| while_analysing("target as explicit source target", &key, f)),
            ReferenceKind::Symlink => source_symlink_target(&analysis, &named)
                .map_err(|f| while_analysing("target as symlink", &key, f)),
            ReferenceKind::Tree => tree_target(&analysis, &ctx, &key, &named)
                .await
                .map_err(|f| while_analysing("explicit tree reference", &key, f)),
            ReferenceKind::Glob => glob_target(&analysis, &ctx, &named)
                .await
                .map_err(|f| while_analysing("glob", &key, f)),
            ReferenceKind::Target => named_target(&analysis, &ctx, &key, &named).await,
        },
    }
}

fn repository<'a>(
    analysis: &'a Analysis,
    name: &str,
) -> Result<&'a crate::context::Repository, Failure> {
    analysis
        .context
        .repo_config
        .repository(name)
        .ok_or_else(|| fatal(format!("Unknown repository {:?}", name)))
}

// ---------------------------------------------------------------------------
// Source targets
// ---------------------------------------------------------------------------

fn source_file_target(
    analysis: &Analysis,
    named: &NamedTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    let repo = repository(analysis, &named.repository)?;
    let entries = repo
        .root
        .directory_entries(&named.module)
        .map_err(|err| fatal(err.to_string()))?;
    if !entries.files.iter().any(|f| f == &named.name) {
        return Err(fatal(format!(
            "{:?} is not a file in module {:?}",
            named.name, named.module
        )));
    }
    let artifact_path = path::join(&named.module, &named.name);
    let artifact = Value::artifact(ArtifactDescription::local(
        artifact_path,
        named.repository.clone(),
    ));
    let stage = Value::map_from(BTreeMap::from([(named.name.clone(), artifact)]));
    Ok(Arc::new(AnalysedTarget::source(TargetResult::new(
        stage.clone(),
        stage,
        Value::empty_map(),
    ))))
}

fn source_symlink_target(
    analysis: &Analysis,
    named: &NamedTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    let repo = repository(analysis, &named.repository)?;
    let link_path = path::join(&named.module, &named.name);
    let Some(content) = repo.root.symlink_content(&link_path) else {
        return Err(fatal(format!(
            "{:?} is not a symlink in module {:?}",
            named.name, named.module
        )));
    };
    if !path::is_non_upwards(&content) {
        return Err(fatal(format!(
            "Symlink {:?} is not non-upwards, pointing to {:?}",
            link_path, content
        )));
    }
    let artifact = Value::artifact(ArtifactDescription::known(
        compute_hash(content.as_bytes()),
        ObjectType::Symlink,
    ));
    let stage = Value::map_from(BTreeMap::from([(named.name.clone(), artifact)]));
    let result = TargetResult::new(stage.clone(), stage, Value::empty_map());
    Ok(Arc::new(AnalysedTarget::new(
        result,
        Vec::new(),
        vec![content],
        Vec::new(),
        BTreeSet::new(),
        BTreeSet::new(),
        BTreeSet::new(),
        TargetGraphInformation::source(),
    )))
}

async fn tree_target(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    named: &NamedTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    let repo = repository(analysis, &named.repository)?;
    let dir_name = path::join(&named.module, &named.name);
    let entries = repo
        .root
        .directory_entries(&dir_name)
        .map_err(|err| fatal(err.to_string()))?;
    analysis.context.statistics.increment_trees_analysed();

    let mut children = Vec::new();
    for file in &entries.files {
        children.push(ConfiguredTarget::new(
            EntityName::named(&named.repository, &dir_name, file, ReferenceKind::File),
            Configuration::default(),
        ));
    }
    for symlink in &entries.symlinks {
        children.push(ConfiguredTarget::new(
            EntityName::named(&named.repository, &dir_name, symlink, ReferenceKind::Symlink),
            Configuration::default(),
        ));
    }
    for directory in &entries.directories {
        children.push(ConfiguredTarget::new(
            EntityName::named(&named.repository, &dir_name, directory, ReferenceKind::Tree),
            Configuration::default(),
        ));
    }
    let values = ctx.deps(children).await?;

    let mut artifacts = BTreeMap::new();
    let mut blobs = Vec::new();
    let mut trees = Vec::new();
    for value in &values {
        for (entry_path, artifact) in value
            .runfiles()
            .as_map()
            .map(|m| m.items().to_vec())
            .unwrap_or_default()
        {
            if let Some(description) = artifact.as_artifact() {
                artifacts.insert(path::normalize(&entry_path), description.clone());
            }
        }
        blobs.extend(value.blobs().iter().cloned());
        trees.extend(value.trees().iter().cloned());
    }
    let tree = Arc::new(Tree::new(artifacts));
    let tree_id = tree.id();
    trees.push(tree);
    let stage = Value::map_from(BTreeMap::from([(
        named.name.clone(),
        Value::artifact(ArtifactDescription::tree(tree_id)),
    )]));
    let result = TargetResult::new(stage.clone(), stage, Value::empty_map());
    let analysed = Arc::new(AnalysedTarget::new(
        result,
        Vec::new(),
        blobs,
        trees,
        BTreeSet::new(),
        BTreeSet::new(),
        BTreeSet::new(),
        TargetGraphInformation::source(),
    ));
    Ok(analysis
        .result_map
        .add(key.target.clone(), Configuration::default(), analysed))
}

async fn glob_target(
    analysis: &Analysis,
    ctx: &TargetCtx,
    named: &NamedTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    let repo = repository(analysis, &named.repository)?;
    let entries = repo
        .root
        .directory_entries(&named.module)
        .map_err(|err| fatal(err.to_string()))?;
    let mut matches = Vec::new();
    for file in &entries.files {
        if utils::fnmatch(&named.name, file) {
            matches.push(ConfiguredTarget::new(
                EntityName::named(&named.repository, &named.module, file, ReferenceKind::File),
                Configuration::default(),
            ));
        }
    }
    for symlink in &entries.symlinks {
        if utils::fnmatch(&named.name, symlink) {
            matches.push(ConfiguredTarget::new(
                EntityName::named(
                    &named.repository,
                    &named.module,
                    symlink,
                    ReferenceKind::Symlink,
                ),
                Configuration::default(),
            ));
        }
    }
    let values = ctx.deps(matches).await?;
    let mut stage_entries = BTreeMap::new();
    let mut blobs = Vec::new();
    for value in &values {
        if let Some(map) = value.artifacts().as_map() {
            for (entry_path, artifact) in map.items() {
                stage_entries.insert(entry_path.clone(), artifact.clone());
            }
        }
        blobs.extend(value.blobs().iter().cloned());
    }
    let stage = Value::map_from(stage_entries);
    Ok(Arc::new(AnalysedTarget::new(
        TargetResult::new(stage.clone(), stage, Value::empty_map()),
        Vec::new(),
        blobs,
        Vec::new(),
        BTreeSet::new(),
        BTreeSet::new(),
        BTreeSet::new(),
        TargetGraphInformation::source(),
    )))
}

// ---------------------------------------------------------------------------
// Entry-point files
// ---------------------------------------------------------------------------

fn read_json_file(analysis: &Analysis, repo_name: &str, file_path: &str) -> Result<Json, Failure> {
    let repo = repository(analysis, repo_name)?;
    let Some(content) = repo.root.read_file(file_path) else {
        return Err(fatal(format!(
            "Missing file {:?} in repository {:?}",
            file_path, repo_name
        )));
    };
    serde_json::from_slice(&content).map_err(|err| {
        fatal(format!(
            "Malformed JSON in {:?} of repository {:?}: {}",
            file_path, repo_name, err
        ))
    })
}

fn targets_file(analysis: &Analysis, repo_name: &str, module: &str) -> Result<Arc<Json>, Failure> {
    let cache_key = (repo_name.to_string(), module.to_string());
    if let Some(cached) = analysis
        .targets_files
        .lock()
        .expect("targets file cache poisoned")
        .get(&cache_key)
    {
        return Ok(cached.clone());
    }
    let repo = repository(analysis, repo_name)?;
    let file_path = path::join(module, &repo.target_file_name);
    let json = Arc::new(read_json_file(analysis, repo_name, &file_path)?);
    analysis
        .targets_files
        .lock()
        .expect("targets file cache poisoned")
        .insert(cache_key, json.clone());
    Ok(json)
}

fn lookup_rule(analysis: &Analysis, rule_name: &NamedTarget) -> Result<UserRulePtr, Failure> {
    if let Some(cached) = analysis
        .rules
        .lock()
        .expect("rule cache poisoned")
        .get(rule_name)
    {
        return Ok(cached.clone());
    }
    let repo = repository(analysis, &rule_name.repository)?;
    let file_path = path::join(&rule_name.module, &repo.rule_file_name);
    let rules_json = read_json_file(analysis, &rule_name.repository, &file_path)?;
    let Some(desc) = rules_json.get(&rule_name.name) else {
        return Err(fatal(format!(
            "Unknown rule {:?} in module {:?}",
            rule_name.name, rule_name.module
        )));
    };
    let rule = parse_rule(desc, rule_name).map_err(|err| fatal(err.to_string()))?;
    analysis
        .rules
        .lock()
        .expect("rule cache poisoned")
        .insert(rule_name.clone(), rule.clone());
    Ok(rule)
}

// ---------------------------------------------------------------------------
// Named targets
// ---------------------------------------------------------------------------

async fn named_target(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    named: &NamedTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    let repo = repository(analysis, &named.repository)?;
    if repo.root.is_absent() {
        return absent_target(analysis, key, named).await;
    }
    let targets_json = targets_file(analysis, &named.repository, &named.module)?;
    let Some(desc) = targets_json.get(&named.name) else {
        // not a defined target; fall back to an implicit source target
        return implicit_source_target(analysis, named).map_err(|f| {
            while_analysing("target as implicit source target", key, f)
        });
    };
    let Some(rule_type) = desc.get("type") else {
        return Err(fatal(format!(
            "No type specified in the definition of target {}",
            key.target
        )));
    };
    if let Some(handled) =
        built_in_rules::handle_builtin(analysis, ctx, key, named, rule_type, desc).await
    {
        return handled;
    }
    // not a built-in, so the type names a user rule
    let rule_name_entity = parse_entity_name(rule_type, named).map_err(|err| {
        fatal(format!(
            "Parsing rule name {} for target {} failed with:\n{}",
            rule_type, key.target, err
        ))
    })?;
    let Some(rule_name) = rule_name_entity.as_named() else {
        return Err(fatal(format!(
            "Rule name for target {} must be a named reference",
            key.target
        )));
    };
    let rule = lookup_rule(analysis, rule_name).map_err(|failure| Failure {
        msg: format!(
            "While looking up rule {} for {}:\n{}",
            rule_name_entity, key.target, failure.msg
        ),
        fatal: failure.fatal,
    })?;
    let data = TargetData::from_description(&rule, desc, named)?;
    with_rule_definition(analysis, ctx, &rule, &data, key)
        .await
        .map_err(|failure| Failure {
            msg: format!(
                "While analysing {} target {}:\n{}",
                rule_name_entity,
                key.to_short_string(girder_expr::Evaluator::DEFAULT_LOG_LIMIT),
                failure.msg
            ),
            fatal: failure.fatal,
        })
}

fn implicit_source_target(
    analysis: &Analysis,
    named: &NamedTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    let repo = repository(analysis, &named.repository)?;
    let entries = repo
        .root
        .directory_entries(&named.module)
        .map_err(|err| fatal(err.to_string()))?;
    if entries.files.iter().any(|f| f == &named.name) {
        return source_file_target(analysis, named);
    }
    if entries.symlinks.iter().any(|s| s == &named.name) {
        return source_symlink_target(analysis, named);
    }
    Err(fatal(format!(
        "{:?} is neither a defined target nor a source entry in module {:?}",
        named.name, named.module
    )))
}

async fn absent_target(
    analysis: &Analysis,
    key: &ConfiguredTarget,
    named: &NamedTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    let Some(serve) = &analysis.context.serve else {
        return Err(fatal(format!(
            "Root for target {} is absent, but no serve endpoint was configured. Please provide --remote-serve-address and retry.",
            key.target.to_json()
        )));
    };
    if !serve.compatible_remote_execution() {
        return Err(fatal(
            "Inconsistent remote execution endpoint and serve endpoint configuration detected.",
        ));
    }
    let repo = repository(analysis, &named.repository)?;
    let root_id = repo
        .fingerprint
        .map(|digest| digest.hex())
        .unwrap_or_default();
    let served = serve
        .serve_target(&root_id, &key.config.to_json(), &key.target.to_json())
        .await
        .map_err(|err| {
            while_analysing(
                "absent target",
                key,
                fatal(err.to_string()),
            )
        })?;
    match served {
        ServedTarget::CachedResult(digest) => {
            let Some(hook) = &analysis.context.export_cache else {
                return Err(fatal(format!(
                    "Serve endpoint provided cache entry {} but no local target cache is configured",
                    digest
                )));
            };
            let Some(result) = hook.entry_by_digest(&digest).await else {
                return Err(fatal(format!(
                    "Failed to materialize served cache entry {}",
                    digest
                )));
            };
            let vars = serve
                .serve_target_variables(&root_id, &key.target.to_json())
                .await
                .unwrap_or_default();
            analysis.context.statistics.increment_exports_served();
            let analysed = Arc::new(AnalysedTarget::new(
                result,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                vars.into_iter().collect(),
                BTreeSet::new(),
                BTreeSet::new(),
                TargetGraphInformation::source(),
            ));
            Ok(analysis.result_map.add(
                key.target.clone(),
                key.config.clone(),
                analysed,
            ))
        }
        ServedTarget::Tree(tree_id) => {
            let stage = Value::map_from(BTreeMap::from([(
                named.name.clone(),
                Value::artifact(ArtifactDescription::tree(tree_id)),
            )]));
            Ok(Arc::new(AnalysedTarget::source(TargetResult::new(
                stage.clone(),
                stage,
                Value::empty_map(),
            ))))
        }
    }
}

// ---------------------------------------------------------------------------
// Target data
// ---------------------------------------------------------------------------

/// The typed fields extracted from a target description (or an
/// abstract node) according to a rule's schema.
pub struct TargetData {
    pub target_vars: Vec<String>,
    pub config_exprs: HashMap<String, Value>,
    pub string_exprs: HashMap<String, Value>,
    pub target_exprs: HashMap<String, Value>,
    pub tainted_expr: Value,
    pub parse_target_names: bool,
}

impl TargetData {
    fn from_description(
        rule: &UserRulePtr,
        desc: &Json,
        named: &NamedTarget,
    ) -> Result<Self, Failure> {
        let object = desc.as_object().ok_or_else(|| {
            fatal(format!(
                "Target description for {:?} has to be a map",
                named.name
            ))
        })?;
        for field in object.keys() {
            if !rule.expected_fields().contains(field) {
                return Err(fatal(format!(
                    "Unknown field {:?} in description of target {:?}",
                    field, named.name
                )));
            }
        }
        let target_vars = match object.get("arguments_config") {
            None => Vec::new(),
            Some(Json::String(var)) => vec![var.clone()],
            Some(Json::Array(vars)) => vars
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    fatal("arguments_config has to be a list of strings".to_string())
                })?,
            Some(other) => {
                return Err(fatal(format!(
                    "arguments_config has to be a list of strings, but found {}",
                    other
                )))
            }
        };
        let tainted_expr = object
            .get("tainted")
            .map(Value::from_json)
            .unwrap_or_else(Value::empty_list);
        let read_fields = |names: &[String]| -> HashMap<String, Value> {
            names
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        object
                            .get(name)
                            .map(Value::from_json)
                            .unwrap_or_else(Value::empty_list),
                    )
                })
                .collect()
        };
        Ok(Self {
            target_vars,
            config_exprs: read_fields(rule.config_fields()),
            string_exprs: read_fields(rule.string_fields()),
            target_exprs: read_fields(rule.target_fields()),
            tainted_expr,
            parse_target_names: true,
        })
    }

    fn from_target_node(
        rule: &UserRulePtr,
        node: &AbstractNode,
        rule_map: &Value,
    ) -> Result<Self, Failure> {
        let string_fields = node
            .string_fields
            .as_map()
            .ok_or_else(|| fatal("string_fields of abstract node has to be a map"))?;
        let target_fields = node
            .target_fields
            .as_map()
            .ok_or_else(|| fatal("target_fields of abstract node has to be a map"))?;
        let mut config_exprs = HashMap::new();
        let mut string_exprs = HashMap::new();
        let mut target_exprs = HashMap::new();
        for field in rule.config_fields() {
            if target_fields.contains(field) {
                return Err(fatal(format!(
                    "Expected config field '{}' in string_fields of abstract node type '{}', and not in target_fields",
                    field, node.node_type
                )));
            }
            config_exprs.insert(
                field.clone(),
                string_fields
                    .find(field)
                    .cloned()
                    .unwrap_or_else(Value::empty_list),
            );
        }
        for field in rule.string_fields() {
            if target_fields.contains(field) {
                return Err(fatal(format!(
                    "Expected string field '{}' in string_fields of abstract node type '{}', and not in target_fields",
                    field, node.node_type
                )));
            }
            string_exprs.insert(
                field.clone(),
                string_fields
                    .find(field)
                    .cloned()
                    .unwrap_or_else(Value::empty_list),
            );
        }
        for field in rule.target_fields() {
            if string_fields.contains(field) {
                return Err(fatal(format!(
                    "Expected target field '{}' in target_fields of abstract node type '{}', and not in string_fields",
                    field, node.node_type
                )));
            }
            let field_nodes = target_fields
                .find(field)
                .cloned()
                .unwrap_or_else(Value::empty_list);
            let node_list = field_nodes
                .as_list()
                .ok_or_else(|| {
                    fatal(format!(
                        "target field '{}' of abstract node has to be a list",
                        field
                    ))
                })?
                .to_vec();
            let targets: Vec<Value> = node_list
                .into_iter()
                .map(|target_node| {
                    Value::name(EntityName::Anonymous(AnonymousTarget {
                        rule_map: rule_map.clone(),
                        target_node,
                    }))
                })
                .collect();
            target_exprs.insert(field.clone(), Value::list(targets));
        }
        Ok(Self {
            target_vars: Vec::new(),
            config_exprs,
            string_exprs,
            target_exprs,
            tainted_expr: Value::empty_list(),
            parse_target_names: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Anonymous targets
// ---------------------------------------------------------------------------

async fn with_target_node(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    anonymous: &AnonymousTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    let Some(node) = anonymous.target_node.as_node() else {
        return Err(fatal(format!(
            "Invalid anonymous target: {} is not a node",
            anonymous.target_node
        )));
    };
    match node {
        TargetNode::Value(result_value) => {
            let Some(result) = result_value.as_result() else {
                return Err(fatal(format!(
                    "Value node does not wrap a result: {}",
                    result_value
                )));
            };
            Ok(Arc::new(AnalysedTarget::source(result.clone())))
        }
        TargetNode::Abstract(abstract_node) => {
            let Some(rule_name_value) = anonymous.rule_map.get(&abstract_node.node_type) else {
                return Err(fatal(format!(
                    "Cannot resolve type of node {} via rule map {}",
                    anonymous.target_node, anonymous.rule_map
                )));
            };
            let Some(EntityName::Named(rule_name)) = rule_name_value.as_name().cloned() else {
                return Err(fatal(format!(
                    "Rule map entry for node type '{}' is not a rule name",
                    abstract_node.node_type
                )));
            };
            let rule = lookup_rule(analysis, &rule_name).map_err(|failure| Failure {
                msg: format!(
                    "While looking up rule for {}:\n{}",
                    key.target, failure.msg
                ),
                fatal: failure.fatal,
            })?;
            let data = TargetData::from_target_node(&rule, abstract_node, &anonymous.rule_map)?;
            with_rule_definition(analysis, ctx, &rule, &data, key)
                .await
                .map_err(|failure| Failure {
                    msg: format!(
                        "While analysing anonymous target of type '{}':\n{}",
                        abstract_node.node_type, failure.msg
                    ),
                    fatal: failure.fatal,
                })
        }
    }
}

// ---------------------------------------------------------------------------
// User-rule analysis
// ---------------------------------------------------------------------------

fn is_transition(value: &Value) -> Result<&[Value], String> {
    let list = value
        .as_list()
        .ok_or_else(|| format!("expected list, but got {}", value))?;
    if !list.iter().all(Value::is_map) {
        return Err(format!("expected list of dicts, but found {}", value));
    }
    Ok(list)
}

async fn with_rule_definition(
    analysis: &Analysis,
    ctx: &TargetCtx,
    rule: &UserRulePtr,
    data: &TargetData,
    key: &ConfiguredTarget,
) -> Result<AnalysedTargetPtr, Failure> {
    let evaluator = &analysis.context.evaluator;
    let param_config = key.config.prune(&data.target_vars);

    // Evaluate the config_fields
    let mut params: HashMap<String, Value> = HashMap::new();
    for field_name in rule.config_fields() {
        let field_expression = &data.config_exprs[field_name];
        let field_value = eval_expr(analysis, field_expression, &param_config, &FunctionMap::empty())
            .map_err(|msg| {
                fatal(format!(
                    "While evaluating config field {}:\n{}",
                    field_name, msg
                ))
            })?;
        check_string_list(&field_value, "Config field", field_name)?;
        params.insert(field_name.clone(), field_value);
    }

    // Evaluate config transitions under the rule's config_vars, with
    // FIELD resolving the config parameters
    let config_trans_fcts = field_function_map(Arc::new(params.clone()));
    let expression_config = key.config.prune(rule.config_vars());
    let mut config_transitions: HashMap<String, Value> = HashMap::new();
    let transition_fields: Vec<(&'static str, Vec<String>)> = vec![
        ("", rule.target_fields().to_vec()),
        ("implicit ", rule.implicit_targets().keys().cloned().collect()),
        (
            "anonymous ",
            rule.anonymous_definitions().keys().cloned().collect(),
        ),
    ];
    for (kind, fields) in &transition_fields {
        for field_name in fields {
            let transition_function = &rule.config_transitions()[field_name];
            let buffer = Mutex::new(String::new());
            let transition = transition_function.evaluate(
                evaluator,
                &expression_config,
                &config_trans_fcts,
                &|msg| {
                    if let Ok(mut b) = buffer.lock() {
                        b.push_str(msg);
                    }
                },
                None,
                None,
            );
            let transition = transition.ok_or_else(|| {
                fatal(format!(
                    "While evaluating config transition for {}{}:\n{}",
                    kind,
                    field_name,
                    buffer.lock().map(|b| b.clone()).unwrap_or_default()
                ))
            })?;
            is_transition(&transition).map_err(|msg| {
                fatal(format!(
                    "While evaluating config transition for {}{}:\n{}",
                    kind, field_name, msg
                ))
            })?;
            config_transitions.insert(field_name.clone(), transition);
        }
    }

    // Request dependencies: declared target fields first, then implicit
    let mut anon_positions: HashMap<String, Vec<usize>> = rule
        .anonymous_definitions()
        .values()
        .map(|def| (def.target.clone(), Vec::new()))
        .collect();
    let mut dependency_keys: Vec<ConfiguredTarget> = Vec::new();
    let mut transition_keys: Vec<ConfiguredTarget> = Vec::new();
    let current_named = key.target.as_named().cloned().unwrap_or_else(|| {
        NamedTarget::new("", "", "", ReferenceKind::Target)
    });
    for field_name in rule.target_fields() {
        let deps_expression = &data.target_exprs[field_name];
        let deps_names = eval_expr(analysis, deps_expression, &param_config, &FunctionMap::empty())
            .map_err(|msg| {
                fatal(format!(
                    "While evaluating target parameter {}:\n{}",
                    field_name, msg
                ))
            })?;
        let deps_list = deps_names.as_list().ok_or_else(|| {
            fatal(format!(
                "Target parameter {} should evaluate to a list, but got {}",
                field_name, deps_names
            ))
        })?;
        let mut dep_names: Vec<EntityName> = Vec::with_capacity(deps_list.len());
        for dep in deps_list {
            if data.parse_target_names {
                dep_names.push(
                    parse_entity_name_from_expression(dep, &current_named).map_err(|err| {
                        fatal(format!(
                            "Parsing entry {} in target field {} failed with:\n{}",
                            dep, field_name, err
                        ))
                    })?,
                );
            } else {
                let Some(name) = dep.as_name() else {
                    return Err(fatal(format!(
                        "Entry {} in target field {} is not a target name",
                        dep, field_name
                    )));
                };
                dep_names.push(name.clone());
            }
        }
        push_dependency_wave(
            key,
            field_name,
            &dep_names,
            &config_transitions,
            &mut anon_positions,
            &mut dependency_keys,
            &mut transition_keys,
        );
        params.insert(
            field_name.clone(),
            Value::list(dep_names.into_iter().map(Value::name).collect()),
        );
    }
    let declared_count = dependency_keys.len();
    for (field_name, implicit_deps) in rule.implicit_targets() {
        push_dependency_wave(
            key,
            field_name,
            implicit_deps,
            &config_transitions,
            &mut anon_positions,
            &mut dependency_keys,
            &mut transition_keys,
        );
    }
    for (field_name, expr) in rule.implicit_target_exprs() {
        params.insert(field_name.clone(), expr.clone());
    }
    let declared_and_implicit_count = dependency_keys.len();

    let mut dependency_values = ctx.deps(dependency_keys).await?;

    // All non-anonymous dependencies are available; read their provides
    // maps to construct the anonymous targets
    let mut anonymous_keys: Vec<ConfiguredTarget> = Vec::new();
    for (name, def) in rule.anonymous_definitions() {
        let mut anon_names: Vec<EntityName> = Vec::new();
        for position in anon_positions.get(&def.target).into_iter().flatten() {
            let provided = dependency_values[*position].provides();
            let Some(provider_value) = provided.get(&def.provider) else {
                return Err(fatal(format!(
                    "Provider {} in {} does not exist",
                    def.provider, def.target
                )));
            };
            let Some(nodes) = provider_value.as_list() else {
                return Err(fatal(format!(
                    "Provider {} in {} must be list of target nodes but found: {}",
                    def.provider, def.target, provider_value
                )));
            };
            for node in nodes {
                if !node.is_node() {
                    return Err(fatal(format!(
                        "Entry in provider {} in {} must be target node but found: {}",
                        def.provider, def.target, node
                    )));
                }
                anon_names.push(EntityName::Anonymous(AnonymousTarget {
                    rule_map: def.rule_map.clone(),
                    target_node: node.clone(),
                }));
            }
        }
        for transition in is_transition(&config_transitions[name])
            .map_err(|msg| fatal(msg))?
        {
            let transitioned_config = key.config.update_from(transition);
            for anon in &anon_names {
                anonymous_keys.push(ConfiguredTarget::new(
                    anon.clone(),
                    transitioned_config.clone(),
                ));
                transition_keys.push(ConfiguredTarget::new(
                    anon.clone(),
                    Configuration::new(transition.clone()),
                ));
            }
        }
        params.insert(
            name.clone(),
            Value::list(anon_names.into_iter().map(Value::name).collect()),
        );
    }

    let anonymous_values = ctx.deps(anonymous_keys).await?;
    dependency_values.extend(anonymous_values);

    with_dependencies(
        analysis,
        &transition_keys,
        &dependency_values,
        declared_count,
        declared_and_implicit_count,
        rule,
        data,
        key,
        params,
    )
}

fn push_dependency_wave(
    key: &ConfiguredTarget,
    field_name: &str,
    dep_names: &[EntityName],
    config_transitions: &HashMap<String, Value>,
    anon_positions: &mut HashMap<String, Vec<usize>>,
    dependency_keys: &mut Vec<ConfiguredTarget>,
    transition_keys: &mut Vec<ConfiguredTarget>,
) {
    let transitions = config_transitions
        .get(field_name)
        .and_then(Value::as_list)
        .map(|l| l.to_vec())
        .unwrap_or_default();
    for transition in &transitions {
        let transitioned_config = key.config.update_from(transition);
        for dep in dep_names {
            if let Some(positions) = anon_positions.get_mut(field_name) {
                positions.push(dependency_keys.len());
            }
            dependency_keys.push(ConfiguredTarget::new(
                dep.clone(),
                transitioned_config.clone(),
            ));
            transition_keys.push(ConfiguredTarget::new(
                dep.clone(),
                Configuration::new(transition.clone()),
            ));
        }
    }
}

fn check_string_list(value: &Value, what: &str, field_name: &str) -> Result<(), Failure> {
    let list = value.as_list().ok_or_else(|| {
        fatal(format!(
            "{} {} should evaluate to a list of strings, but got {}",
            what, field_name, value
        ))
    })?;
    for entry in list {
        if !entry.is_string() {
            return Err(fatal(format!(
                "{} {} should evaluate to a list of strings, but got entry {}",
                what, field_name, entry
            )));
        }
    }
    Ok(())
}

/// `FIELD` built-in resolving the evaluated parameters.
fn field_function_map(params: Arc<HashMap<String, Value>>) -> FunctionMap {
    let field: EvalFunction = Arc::new(move |eval, expr, env| {
        let name = eval(
            expr.get("name")
                .ok_or_else(|| EvalError::new("Map does not contain key 'name'."))?,
            env,
        )?;
        let Some(name_str) = name.as_str() else {
            return Err(EvalError::new(format!(
                "FIELD argument 'name' should evaluate to a string, but got {}",
                name
            )));
        };
        params
            .get(name_str)
            .cloned()
            .ok_or_else(|| EvalError::new(format!("FIELD '{}' unknown", name_str)))
    });
    FunctionMap::from_entries(vec![("FIELD", field)])
}

#[allow(clippy::too_many_arguments)]
fn with_dependencies(
    analysis: &Analysis,
    transition_keys: &[ConfiguredTarget],
    dependency_values: &[AnalysedTargetPtr],
    declared_count: usize,
    declared_and_implicit_count: usize,
    rule: &UserRulePtr,
    data: &TargetData,
    key: &ConfiguredTarget,
    mut params: HashMap<String, Value>,
) -> Result<AnalysedTargetPtr, Failure> {
    let evaluator = &analysis.context.evaluator;

    // Associate dependency keys with values
    let mut deps_by_transition: HashMap<ConfiguredTarget, AnalysedTargetPtr> = HashMap::new();
    for (transition_key, value) in transition_keys.iter().zip(dependency_values.iter()) {
        deps_by_transition.insert(transition_key.clone(), value.clone());
    }

    // Compute the effective dependency on config variables
    let mut effective_vars: BTreeSet<String> = data.target_vars.iter().cloned().collect();
    effective_vars.extend(rule.config_vars().iter().cloned());
    for (transition_key, target) in &deps_by_transition {
        for var in target.vars() {
            if !transition_key.config.variable_fixed(var) {
                effective_vars.insert(var.clone());
            }
        }
    }
    let effective_conf = key.config.prune(&effective_vars);

    // Target graph information
    let graph_node = |value: &AnalysedTargetPtr| -> Option<ConfiguredTargetPtr> {
        value.graph_information().node().cloned()
    };
    let declared_deps: Vec<ConfiguredTargetPtr> = dependency_values[..declared_count]
        .iter()
        .filter_map(graph_node)
        .collect();
    let implicit_deps: Vec<ConfiguredTargetPtr> = dependency_values
        [declared_count..declared_and_implicit_count]
        .iter()
        .filter_map(graph_node)
        .collect();
    let anonymous_deps: Vec<ConfiguredTargetPtr> = dependency_values
        [declared_and_implicit_count..]
        .iter()
        .filter_map(graph_node)
        .collect();
    let deps_info = TargetGraphInformation::new(
        Arc::new(ConfiguredTarget::new(
            key.target.clone(),
            effective_conf.clone(),
        )),
        declared_deps,
        implicit_deps,
        anonymous_deps,
    );

    // Compute and verify taintedness
    let mut tainted = utils::get_tainted(
        evaluator,
        &key.config.prune(&data.target_vars),
        &data.tainted_expr,
    )
    .map_err(|msg| fatal(msg))?;
    tainted.extend(rule.tainted().iter().cloned());
    for dep in dependency_values {
        if !dep.tainted().is_subset(&tainted) {
            return Err(fatal(
                "Not tainted with all strings the dependencies are tainted with",
            ));
        }
    }

    // Compute implied export targets
    let mut implied_export: BTreeSet<String> = BTreeSet::new();
    for dep in dependency_values {
        implied_export.extend(dep.implied_export().iter().cloned());
    }

    // Evaluate string parameters, with outs/runfiles resolving into the
    // dependencies
    let deps_shared = Arc::new(deps_by_transition);
    let current_named = key.target.as_named().cloned().unwrap_or_else(|| {
        NamedTarget::new("", "", "", ReferenceKind::Target)
    });
    let string_fields_fcts = string_field_function_map(deps_shared.clone(), current_named.clone());
    let param_config = key.config.prune(&data.target_vars);
    for field_name in rule.string_fields() {
        let field_expression = &data.string_exprs[field_name];
        let field_value = eval_expr(analysis, field_expression, &param_config, &string_fields_fcts)
            .map_err(|msg| {
                fatal(format!(
                    "While evaluating string field {}:\n{}",
                    field_name, msg
                ))
            })?;
        check_string_list(&field_value, "String field", field_name)?;
        params.insert(field_name.clone(), field_value);
    }

    // Evaluate the defining expression
    let expression_config = key.config.prune(rule.config_vars());
    let actions: Arc<Mutex<Vec<Arc<girder_core::ActionDescription>>>> =
        Arc::new(Mutex::new(Vec::new()));
    let blobs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let trees: Arc<Mutex<Vec<Arc<Tree>>>> = Arc::new(Mutex::new(Vec::new()));
    let main_fcts = main_function_map(
        Arc::new(params),
        deps_shared.clone(),
        current_named,
        rule.clone(),
        actions.clone(),
        blobs.clone(),
        trees.clone(),
    );
    let effective_for_annotation = effective_conf.clone();
    let deps_for_annotation = deps_shared.clone();
    let annotate_object = move |object: &Value| -> String {
        annotate_artifact(object, &deps_for_annotation, &effective_for_annotation)
    };
    let buffer = Mutex::new(String::new());
    let result = rule.expression().evaluate(
        evaluator,
        &expression_config,
        &main_fcts,
        &|msg| {
            if let Ok(mut b) = buffer.lock() {
                b.push_str(msg);
            }
        },
        Some(&annotate_object),
        None,
    );
    let result = result.ok_or_else(|| {
        fatal(format!(
            "While evaluating defining expression of rule:\n{}",
            buffer.lock().map(|b| b.clone()).unwrap_or_default()
        ))
    })?;
    let Some(target_result) = result.as_result() else {
        return Err(fatal(format!(
            "Defining expression should evaluate to a RESULT, but got: {}",
            result
        )));
    };

    let analysed = Arc::new(AnalysedTarget::new(
        target_result.clone(),
        std::mem::take(&mut *actions.lock().expect("actions poisoned")),
        std::mem::take(&mut *blobs.lock().expect("blobs poisoned")),
        std::mem::take(&mut *trees.lock().expect("trees poisoned")),
        effective_vars,
        tainted,
        implied_export,
        deps_info,
    ));
    Ok(analysis
        .result_map
        .add(key.target.clone(), effective_conf, analysed))
}

/// Annotate an artifact with the direct dependencies it occurs in.
fn annotate_artifact(
    object: &Value,
    deps: &HashMap<ConfiguredTarget, AnalysedTargetPtr>,
    effective_conf: &Configuration,
) -> String {
    if !object.is_artifact() {
        return String::new();
    }
    let mut occurrences = String::new();
    for (transition_key, analysis) in deps {
        let describe = |kind: &str, stage_path: &str| {
            format!(
                "\n - {} ({}), {} at {:?}",
                transition_key.target,
                effective_conf
                    .update_from(transition_key.config.expr())
                    .expr()
                    .to_abbrev_string(girder_expr::Evaluator::DEFAULT_LOG_LIMIT),
                kind,
                stage_path
            )
        };
        if let Some(map) = analysis.artifacts().as_map() {
            for (stage_path, value) in map.items() {
                if value == object {
                    occurrences.push_str(&describe("artifact", stage_path));
                }
            }
        }
        if let Some(map) = analysis.runfiles().as_map() {
            for (stage_path, value) in map.items() {
                if value == object {
                    occurrences.push_str(&describe("runfile", stage_path));
                }
            }
        }
    }
    if occurrences.is_empty() {
        format!("\nArtifact {} unknown to direct dependencies", object)
    } else {
        format!(
            "\nArtifact {} occurs in direct dependencies{}",
            object, occurrences
        )
    }
}

/// Look up a dependency by the `dep` and optional `transition`
/// arguments of a `DEP_*` expression.
fn obtain_target(
    eval: girder_expr::SubEval,
    expr: &Value,
    env: &Configuration,
    deps: &HashMap<ConfiguredTarget, AnalysedTargetPtr>,
    current: &NamedTarget,
) -> Result<AnalysedTargetPtr, EvalError> {
    let dep_value = eval(
        expr.get("dep")
            .ok_or_else(|| EvalError::new("Map does not contain key 'dep'."))?,
        env,
    )?;
    let dep_name = parse_entity_name_from_expression(&dep_value, current)
        .map_err(EvalError::new)?;
    let transition = eval(&expr.get_or("transition", Value::empty_map_expr()), env)?;
    let lookup_key = ConfiguredTarget::new(dep_name, Configuration::new(transition));
    deps.get(&lookup_key).cloned().ok_or_else(|| {
        EvalError::new(format!(
            "Reference to undeclared dependency {}",
            dep_value
        ))
    })
}

fn keys_expr(map: &Value) -> Result<Value, EvalError> {
    let entries = map.try_map()?;
    Ok(Value::list(
        entries
            .items()
            .iter()
            .map(|(k, _)| Value::string(k.clone()))
            .collect(),
    ))
}

/// `outs` and `runfiles` built-ins available to string fields.
fn string_field_function_map(
    deps: Arc<HashMap<ConfiguredTarget, AnalysedTargetPtr>>,
    current: NamedTarget,
) -> FunctionMap {
    let deps_outs = deps.clone();
    let current_outs = current.clone();
    let outs: EvalFunction = Arc::new(move |eval, expr, env| {
        let target = obtain_target(eval, expr, env, &deps_outs, &current_outs)?;
        keys_expr(target.artifacts())
    });
    let runfiles: EvalFunction = Arc::new(move |eval, expr, env| {
        let target = obtain_target(eval, expr, env, &deps, &current)?;
        keys_expr(target.runfiles())
    });
    FunctionMap::from_entries(vec![("outs", outs), ("runfiles", runfiles)])
}

/// The full provider set for the defining expression: FIELD, DEP_*,
/// ACTION, BLOB, SYMLINK, TREE, VALUE_NODE, ABSTRACT_NODE, RESULT.
#[allow(clippy::too_many_arguments)]
fn main_function_map(
    params: Arc<HashMap<String, Value>>,
    deps: Arc<HashMap<ConfiguredTarget, AnalysedTargetPtr>>,
    current: NamedTarget,
    rule: UserRulePtr,
    actions: Arc<Mutex<Vec<Arc<girder_core::ActionDescription>>>>,
    blobs: Arc<Mutex<Vec<String>>>,
    trees: Arc<Mutex<Vec<Arc<Tree>>>>,
) -> FunctionMap {
    let field_map = field_function_map(params);

    let deps_artifacts = deps.clone();
    let current_artifacts = current.clone();
    let dep_artifacts: EvalFunction = Arc::new(move |eval, expr, env| {
        Ok(obtain_target(eval, expr, env, &deps_artifacts, &current_artifacts)?
            .artifacts()
            .clone())
    });

    let deps_runfiles = deps.clone();
    let current_runfiles = current.clone();
    let dep_runfiles: EvalFunction = Arc::new(move |eval, expr, env| {
        Ok(obtain_target(eval, expr, env, &deps_runfiles, &current_runfiles)?
            .runfiles()
            .clone())
    });

    let deps_provides = deps.clone();
    let current_provides = current.clone();
    let dep_provides: EvalFunction = Arc::new(move |eval, expr, env| {
        let target = obtain_target(eval, expr, env, &deps_provides, &current_provides)?;
        let provider = eval(
            expr.get("provider")
                .ok_or_else(|| EvalError::new("Map does not contain key 'provider'."))?,
            env,
        )?;
        let provided = target.provides().get(provider.try_str()?).cloned();
        match provided {
            Some(value) => Ok(value),
            None => eval(&expr.get_or("default", Value::empty_list()), env),
        }
    });

    let action_rule = rule.clone();
    let action_actions = actions.clone();
    let action_trees = trees.clone();
    let action: EvalFunction = Arc::new(move |eval, expr, env| {
        action_builtin(
            eval,
            expr,
            env,
            &action_rule,
            &action_actions,
            &action_trees,
        )
    });

    let blob_blobs = blobs.clone();
    let blob: EvalFunction = Arc::new(move |eval, expr, env| {
        let data = eval(&expr.get_or("data", Value::string("")), env)?;
        let Some(text) = data.as_str() else {
            return Err(EvalError::new(format!(
                "BLOB data has to be a string, but got {}",
                data
            )));
        };
        blob_blobs
            .lock()
            .expect("blobs poisoned")
            .push(text.to_string());
        Ok(Value::artifact(ArtifactDescription::known(
            compute_hash(text.as_bytes()),
            ObjectType::File,
        )))
    });

    let symlink_blobs = blobs.clone();
    let symlink: EvalFunction = Arc::new(move |eval, expr, env| {
        let data = eval(&expr.get_or("data", Value::string("")), env)?;
        let Some(text) = data.as_str() else {
            return Err(EvalError::new(format!(
                "SYMLINK data has to be a string, but got {}",
                data
            )));
        };
        if !path::is_non_upwards(text) {
            return Err(EvalError::new(format!(
                "SYMLINK data has to be non-upwards relative, but got {:?}",
                text
            )));
        }
        symlink_blobs
            .lock()
            .expect("blobs poisoned")
            .push(text.to_string());
        Ok(Value::artifact(ArtifactDescription::known(
            compute_hash(text.as_bytes()),
            ObjectType::Symlink,
        )))
    });

    let tree_trees = trees.clone();
    let tree: EvalFunction = Arc::new(move |eval, expr, env| {
        let val = eval(&expr.get_or("$1", Value::empty_map_expr()), env)?;
        let Some(map) = val.as_map() else {
            return Err(EvalError::new(format!(
                "TREE argument has to be a map of artifacts, but found {}",
                val
            )));
        };
        let mut artifacts = BTreeMap::new();
        for (input_path, artifact) in map.items() {
            let Some(description) = artifact.as_artifact() else {
                return Err(EvalError::new(format!(
                    "TREE argument has to be a map of artifacts, but found {} for {}",
                    artifact, input_path
                )));
            };
            artifacts.insert(path::normalize(input_path), description.clone());
        }
        if let Some(conflict) = utils::tree_conflict(&val) {
            return Err(EvalError::new(format!(
                "TREE conflicts on subtree {}",
                conflict
            )));
        }
        let tree = Arc::new(Tree::new(artifacts));
        let tree_id = tree.id();
        tree_trees.lock().expect("trees poisoned").push(tree);
        Ok(Value::artifact(ArtifactDescription::tree(tree_id)))
    });

    let value_node: EvalFunction = Arc::new(move |eval, expr, env| {
        let val = eval(&expr.get_or("$1", Value::none()), env)?;
        if !val.is_result() {
            return Err(EvalError::new(
                "argument '$1' for VALUE_NODE not a RESULT type.",
            ));
        }
        Ok(Value::node(TargetNode::Value(val)))
    });

    let abstract_node: EvalFunction = Arc::new(move |eval, expr, env| {
        abstract_node_builtin(eval, expr, env)
    });

    let result: EvalFunction = Arc::new(move |eval, expr, env| result_builtin(eval, expr, env));

    FunctionMap::link(
        &field_map,
        vec![
            ("DEP_ARTIFACTS", dep_artifacts),
            ("DEP_RUNFILES", dep_runfiles),
            ("DEP_PROVIDES", dep_provides),
            ("ACTION", action),
            ("BLOB", blob),
            ("SYMLINK", symlink),
            ("TREE", tree),
            ("VALUE_NODE", value_node),
            ("ABSTRACT_NODE", abstract_node),
            ("RESULT", result),
        ],
    )
}

fn read_output_list(value: &Value, field_name: &str) -> Result<Vec<String>, EvalError> {
    let list = value.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "{} has to be a list of strings, but found {}",
            field_name, value
        ))
    })?;
    let mut outputs = Vec::with_capacity(list.len());
    for out_path in list {
        let Some(s) = out_path.as_str() else {
            return Err(EvalError::new(format!(
                "{} has to be a list of strings, but found {}",
                field_name, value
            )));
        };
        outputs.push(s.to_string());
    }
    Ok(outputs)
}

fn check_taint_list(value: &Value, field_name: &str, rule: &UserRulePtr) -> Result<Vec<String>, EvalError> {
    let list = value.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "{} has to be a list of strings, but found {}",
            field_name, value
        ))
    })?;
    let mut entries = Vec::with_capacity(list.len());
    for entry in list {
        let Some(taint) = entry.as_str() else {
            return Err(EvalError::new(format!(
                "{} has to be a list of strings, but found {}",
                field_name, value
            )));
        };
        if !rule.tainted().contains(taint) {
            return Err(EvalError::new(format!(
                "{} contains entry {:?} the rule is not tainted with",
                field_name, taint
            )));
        }
        entries.push(taint.to_string());
    }
    Ok(entries)
}

fn action_builtin(
    eval: girder_expr::SubEval,
    expr: &Value,
    env: &Configuration,
    rule: &UserRulePtr,
    actions: &Arc<Mutex<Vec<Arc<girder_core::ActionDescription>>>>,
    trees: &Arc<Mutex<Vec<Arc<Tree>>>>,
) -> Result<Value, EvalError> {
    let inputs_exp = eval(&expr.get_or("inputs", Value::empty_map_expr()), env)?;
    let Some(inputs_map) = inputs_exp.as_map() else {
        return Err(EvalError::new(format!(
            "inputs has to be a map of artifacts, but found {}",
            inputs_exp
        )));
    };
    for (input_path, artifact) in inputs_map.items() {
        if !artifact.is_artifact() {
            return Err(EvalError::new(format!(
                "inputs has to be a map of Artifacts, but found {} for {}",
                artifact, input_path
            )));
        }
    }
    let inputs_exp = utils::artifacts_tree(&inputs_exp)
        .map_err(|conflict| EvalError::new(format!("inputs conflict on path {}", conflict)))?;
    if let Some(conflict) = utils::tree_conflict(&inputs_exp) {
        return Err(EvalError::new(format!(
            "inputs conflicts on subtree {}",
            conflict
        )));
    }

    let outputs = read_output_list(&eval(&expr.get_or("outs", Value::empty_list()), env)?, "outs")?;
    let output_dirs = read_output_list(
        &eval(&expr.get_or("out_dirs", Value::empty_list()), env)?,
        "out_dirs",
    )?;
    if outputs.is_empty() && output_dirs.is_empty() {
        return Err(EvalError::new(
            "either outs or out_dirs must be specified for ACTION",
        ));
    }
    let mut outputs_norm: Vec<String> = outputs.iter().map(|p| path::normalize(p)).collect();
    let mut output_dirs_norm: Vec<String> =
        output_dirs.iter().map(|p| path::normalize(p)).collect();
    outputs_norm.sort();
    outputs_norm.dedup();
    output_dirs_norm.sort();
    output_dirs_norm.dedup();
    let dirs_set: HashSet<&String> = output_dirs_norm.iter().collect();
    let duplicates: Vec<&String> = outputs_norm.iter().filter(|o| dirs_set.contains(o)).collect();
    if !duplicates.is_empty() {
        return Err(EvalError::new(format!(
            "outs and out_dirs for ACTION must be disjoint. Found repeated entries:\n{:?}",
            duplicates
        )));
    }
    // a file output under a declared output directory is a tree conflict
    let mut all_outputs: Vec<String> = outputs_norm.clone();
    all_outputs.extend(output_dirs_norm.iter().cloned());
    all_outputs.sort();
    for window in all_outputs.windows(2) {
        if window[1].starts_with(&format!("{}/", window[0])) {
            return Err(EvalError::new(format!(
                "outputs of ACTION conflict on path {}",
                window[0]
            )));
        }
    }

    let cmd_exp = eval(&expr.get_or("cmd", Value::empty_list()), env)?;
    let Some(cmd_list) = cmd_exp.as_list() else {
        return Err(EvalError::new(format!(
            "cmd has to be a list of strings, but found {}",
            cmd_exp
        )));
    };
    if cmd_list.is_empty() {
        return Err(EvalError::new("cmd must not be an empty list"));
    }
    let mut command = Vec::with_capacity(cmd_list.len());
    for arg in cmd_list {
        let Some(s) = arg.as_str() else {
            return Err(EvalError::new(format!(
                "cmd has to be a list of strings, but found {}",
                cmd_exp
            )));
        };
        command.push(s.to_string());
    }
    let cwd_exp = eval(&expr.get_or("cwd", Value::string("")), env)?;
    let Some(cwd) = cwd_exp.as_str() else {
        return Err(EvalError::new(format!(
            "cwd has to be a string, but found {}",
            cwd_exp
        )));
    };
    if !path::is_non_upwards(cwd) {
        return Err(EvalError::new(format!(
            "cwd has to be a non-upwards relative path, but found {}",
            cwd_exp
        )));
    }
    let final_inputs = {
        let mut collected = trees.lock().expect("trees poisoned");
        let mut staged = Vec::new();
        let result = utils::add_dir_for(cwd, inputs_exp, &mut staged)?;
        collected.extend(staged);
        result
    };
    let env_exp = eval(&expr.get_or("env", Value::empty_map_expr()), env)?;
    let Some(env_map) = env_exp.as_map() else {
        return Err(EvalError::new(format!(
            "env has to be a map of string, but found {}",
            env_exp
        )));
    };
    for (_, env_value) in env_map.items() {
        if !env_value.is_string() {
            return Err(EvalError::new(format!(
                "env has to be a map of string, but found {}",
                env_exp
            )));
        }
    }
    let may_fail_exp = expr.get_or("may_fail", Value::empty_list());
    let may_fail_entries = check_taint_list(&may_fail_exp, "may_fail", rule)?;
    let may_fail = if may_fail_entries.is_empty() {
        None
    } else {
        let fail_msg = eval(&expr.get_or("fail_message", Value::string("action failed")), env)?;
        let Some(msg) = fail_msg.as_str() else {
            return Err(EvalError::new(format!(
                "fail_message has to evaluate to a string, but got {}",
                fail_msg
            )));
        };
        Some(msg.to_string())
    };
    let no_cache_exp = expr.get_or("no_cache", Value::empty_list());
    let no_cache = !check_taint_list(&no_cache_exp, "no_cache", rule)?.is_empty();
    let timeout_scale_exp = eval(&expr.get_or("timeout scaling", Value::number(1.0)), env)?;
    if !(timeout_scale_exp.is_number() || timeout_scale_exp.is_none()) {
        return Err(EvalError::new(format!(
            "timeout scaling has to be number (or null for default), but found {}",
            timeout_scale_exp
        )));
    }
    let mut execution_properties =
        eval(&expr.get_or("execution properties", Value::empty_map_expr()), env)?;
    if execution_properties.is_none() {
        execution_properties = Value::empty_map();
    }
    let Some(properties_map) = execution_properties.as_map() else {
        return Err(EvalError::new(format!(
            "execution properties has to be a map of strings (or null for empty), but found {}",
            execution_properties
        )));
    };
    for (_, property) in properties_map.items() {
        if !property.is_string() {
            return Err(EvalError::new(format!(
                "execution properties has to be a map of strings (or null for empty), but found {}",
                execution_properties
            )));
        }
    }

    let action = utils::create_action(
        outputs_norm.clone(),
        output_dirs_norm.clone(),
        command,
        cwd.to_string(),
        &env_exp,
        may_fail,
        no_cache,
        timeout_scale_exp.as_number().unwrap_or(1.0),
        &execution_properties,
        &final_inputs,
    )?;
    let action_id = action.id();
    actions.lock().expect("actions poisoned").push(action);
    let mut outputs_stage = BTreeMap::new();
    for out in outputs_norm.into_iter().chain(output_dirs_norm) {
        outputs_stage.insert(
            out.clone(),
            Value::artifact(ArtifactDescription::action(action_id.clone(), out)),
        );
    }
    Ok(Value::map_from(outputs_stage))
}

fn abstract_node_builtin(
    eval: girder_expr::SubEval,
    expr: &Value,
    env: &Configuration,
) -> Result<Value, EvalError> {
    let node_type = eval(&expr.get_or("node_type", Value::none()), env)?;
    let Some(node_type_str) = node_type.as_str() else {
        return Err(EvalError::new(
            "argument 'node_type' for ABSTRACT_NODE not a string.",
        ));
    };
    let string_fields = eval(&expr.get_or("string_fields", Value::empty_map_expr()), env)?;
    let Some(string_map) = string_fields.as_map() else {
        return Err(EvalError::new(
            "argument 'string_fields' for ABSTRACT_NODE not a map.",
        ));
    };
    let target_fields = eval(&expr.get_or("target_fields", Value::empty_map_expr()), env)?;
    let Some(target_map) = target_fields.as_map() else {
        return Err(EvalError::new(
            "argument 'target_fields' for ABSTRACT_NODE not a map.",
        ));
    };
    for (field, list) in string_map.items() {
        let Some(entries) = list.as_list() else {
            return Err(EvalError::new(format!(
                "value for key {} in argument 'string_fields' for ABSTRACT_NODE is not a list.",
                field
            )));
        };
        for entry in entries {
            if !entry.is_string() {
                return Err(EvalError::new(format!(
                    "list entry for {} in argument 'string_fields' for ABSTRACT_NODE is not a string:\n{}",
                    field, entry
                )));
            }
        }
        if target_map.contains(field) {
            return Err(EvalError::new(format!(
                "string_fields and target_fields are not disjoint maps, found duplicate key: {}.",
                field
            )));
        }
    }
    for (field, list) in target_map.items() {
        let Some(entries) = list.as_list() else {
            return Err(EvalError::new(format!(
                "value for key {} in argument 'target_fields' for ABSTRACT_NODE is not a list.",
                field
            )));
        };
        for entry in entries {
            if !entry.is_node() {
                return Err(EvalError::new(format!(
                    "list entry for {} in argument 'target_fields' for ABSTRACT_NODE is not a target node:\n{}",
                    field, entry
                )));
            }
        }
    }
    Ok(Value::node(TargetNode::Abstract(AbstractNode {
        node_type: node_type_str.to_string(),
        string_fields,
        target_fields,
    })))
}

fn result_builtin(
    eval: girder_expr::SubEval,
    expr: &Value,
    env: &Configuration,
) -> Result<Value, EvalError> {
    let artifacts = eval(&expr.get_or("artifacts", Value::empty_map_expr()), env)?;
    let runfiles = eval(&expr.get_or("runfiles", Value::empty_map_expr()), env)?;
    let provides = eval(&expr.get_or("provides", Value::empty_map_expr()), env)?;
    let check_stage = |stage: &Value, what: &str| -> Result<Value, EvalError> {
        let Some(map) = stage.as_map() else {
            return Err(EvalError::new(format!(
                "{} has to be a map of artifacts, but found {}",
                what, stage
            )));
        };
        for (stage_path, entry) in map.items() {
            if !entry.is_artifact() {
                return Err(EvalError::new(format!(
                    "{} has to be a map of artifacts, but found {} for {}",
                    what, entry, stage_path
                )));
            }
        }
        let normalized = utils::artifacts_tree(stage)
            .map_err(|conflict| EvalError::new(format!("{} conflict on path {}", what, conflict)))?;
        if let Some(conflict) = utils::tree_conflict(&normalized) {
            return Err(EvalError::new(format!(
                "{} conflicts on subtree {}",
                what, conflict
            )));
        }
        Ok(normalized)
    };
    let artifacts = check_stage(&artifacts, "artifacts")?;
    let runfiles = check_stage(&runfiles, "runfiles")?;
    if !provides.is_map() {
        return Err(EvalError::new(format!(
            "provides has to be a map, but found {}",
            provides
        )));
    }
    Ok(Value::result(TargetResult::new(artifacts, runfiles, provides)))
}
