//! Built-in rules
//!
//! Target types handled directly by the analyzer, before user-rule
//! lookup: `export`, `configure`, `file_gen`, `generic`, `install`,
//! `tree`, `tree_overlay`, and `disjoint_tree_overlay`.

use crate::analysed_target::{AnalysedTarget, AnalysedTargetPtr};
use crate::configured_target::ConfiguredTarget;
use crate::graph_info::TargetGraphInformation;
use crate::rules::parse_entity_name;
use crate::target_map::{Analysis, TargetCtx};
use crate::utils;
use girder_async::Failure;
use girder_core::{compute_hash, ArtifactDescription, ObjectType, Tree};
use girder_expr::{
    Configuration, EntityName, FunctionMap, NamedTarget, TargetResult, Value,
};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

const BUILT_IN_RULES: [&str; 8] = [
    "export",
    "configure",
    "file_gen",
    "generic",
    "install",
    "tree",
    "tree_overlay",
    "disjoint_tree_overlay",
];

/// Dispatch a built-in target type; `None` means the type is not a
/// built-in and user-rule lookup should proceed.
pub async fn handle_builtin(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    named: &NamedTarget,
    rule_type: &Json,
    desc: &Json,
) -> Option<Result<AnalysedTargetPtr, Failure>> {
    let type_name = rule_type.as_str()?;
    if !BUILT_IN_RULES.contains(&type_name) {
        return None;
    }
    let result = match type_name {
        "export" => export_target(analysis, ctx, key, named, desc).await,
        "configure" => configure_target(analysis, ctx, key, named, desc).await,
        "file_gen" => file_gen_target(analysis, key, named, desc),
        "generic" => generic_target(analysis, ctx, key, named, desc).await,
        "install" => install_target(analysis, ctx, key, named, desc).await,
        "tree" => tree_rule_target(analysis, ctx, key, named, desc).await,
        "tree_overlay" => overlay_target(analysis, ctx, key, named, desc, false).await,
        _ => overlay_target(analysis, ctx, key, named, desc, true).await,
    };
    Some(result.map_err(|failure| Failure {
        msg: format!(
            "While analysing {} target {}:\n{}",
            type_name,
            key.to_short_string(girder_expr::Evaluator::DEFAULT_LOG_LIMIT),
            failure.msg
        ),
        fatal: failure.fatal,
    }))
}

fn fatal(msg: impl Into<String>) -> Failure {
    Failure::fatal(msg)
}

fn desc_string_list(desc: &Json, field: &str) -> Result<Vec<String>, Failure> {
    match desc.get(field) {
        None => Ok(Vec::new()),
        Some(Json::String(entry)) => Ok(vec![entry.clone()]),
        Some(value) => value
            .as_array()
            .and_then(|list| {
                list.iter()
                    .map(|entry| entry.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| fatal(format!("{} has to be a list of strings", field))),
    }
}

fn eval_field(
    analysis: &Analysis,
    desc: &Json,
    field: &str,
    env: &Configuration,
    default: Value,
) -> Result<Value, Failure> {
    let Some(expr) = desc.get(field) else {
        return Ok(default);
    };
    let buffer = Mutex::new(String::new());
    analysis
        .context
        .evaluator
        .evaluate_expression(
            &Value::from_json(expr),
            env,
            &FunctionMap::empty(),
            &|msg| {
                if let Ok(mut b) = buffer.lock() {
                    b.push_str(msg);
                }
            },
            None,
            None,
        )
        .ok_or_else(|| {
            fatal(format!(
                "While evaluating field {}:\n{}",
                field,
                buffer.lock().map(|b| b.clone()).unwrap_or_default()
            ))
        })
}

fn parse_dep_list(desc: &Json, field: &str, current: &NamedTarget) -> Result<Vec<EntityName>, Failure> {
    match desc.get(field) {
        None => Ok(Vec::new()),
        Some(value) => {
            let list = value.as_array().ok_or_else(|| {
                fatal(format!("{} has to be a list of target names", field))
            })?;
            list.iter()
                .map(|entry| {
                    parse_entity_name(entry, current).map_err(|err| {
                        fatal(format!(
                            "Parsing entry {} in field {} failed with:\n{}",
                            entry, field, err
                        ))
                    })
                })
                .collect()
        }
    }
}

/// Taints of the target itself, which must cover every taint of its
/// dependencies.
fn check_taints(
    analysis: &Analysis,
    desc: &Json,
    param_config: &Configuration,
    deps: &[AnalysedTargetPtr],
) -> Result<BTreeSet<String>, Failure> {
    let tainted_expr = desc
        .get("tainted")
        .map(Value::from_json)
        .unwrap_or_else(Value::empty_list);
    let tainted = utils::get_tainted(&analysis.context.evaluator, param_config, &tainted_expr)
        .map_err(fatal)?;
    for dep in deps {
        if !dep.tainted().is_subset(&tainted) {
            return Err(fatal(
                "Not tainted with all strings the dependencies are tainted with",
            ));
        }
    }
    Ok(tainted)
}

fn graph_info_for(
    key: &ConfiguredTarget,
    effective_conf: &Configuration,
    deps: &[AnalysedTargetPtr],
) -> TargetGraphInformation {
    TargetGraphInformation::new(
        Arc::new(ConfiguredTarget::new(
            key.target.clone(),
            effective_conf.clone(),
        )),
        deps.iter()
            .filter_map(|dep| dep.graph_information().node().cloned())
            .collect(),
        Vec::new(),
        Vec::new(),
    )
}

// ---------------------------------------------------------------------------
// export
// ---------------------------------------------------------------------------

async fn export_target(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    named: &NamedTarget,
    desc: &Json,
) -> Result<AnalysedTargetPtr, Failure> {
    let flexible = desc_string_list(desc, "flexible_config")?;
    let fixed = desc.get("fixed_config").cloned().unwrap_or(Json::Object(
        serde_json::Map::new(),
    ));
    if !fixed.is_object() {
        return Err(fatal(format!(
            "fixed_config has to be a map, but found {}",
            fixed
        )));
    }
    let target_json = desc
        .get("target")
        .ok_or_else(|| fatal("export target is missing the 'target' field"))?;
    let exported = parse_entity_name(target_json, named)
        .map_err(|err| fatal(format!("Parsing exported target failed with:\n{}", err)))?;

    let effective_conf = key.config.prune(&flexible);
    let fixed_value = Value::from_json(&fixed);
    let target_conf = effective_conf.update_from(&fixed_value);

    let repo = analysis
        .context
        .repo_config
        .repository(&named.repository)
        .ok_or_else(|| fatal(format!("Unknown repository {:?}", named.repository)))?;

    let target_triple = serde_json::json!([named.repository, named.module, named.name]);
    // cached analysis of export targets can be reused wholesale
    if let (Some(fingerprint), Some(hook)) = (&repo.fingerprint, &analysis.context.export_cache) {
        if let Some(result) = hook
            .lookup(fingerprint, &target_triple, &effective_conf.to_json())
            .await
        {
            analysis.context.statistics.increment_exports_cached();
            let analysed = Arc::new(AnalysedTarget::new(
                result,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                flexible.iter().cloned().collect(),
                BTreeSet::new(),
                BTreeSet::from([target_triple.to_string()]),
                TargetGraphInformation::source(),
            ));
            return Ok(analysis
                .result_map
                .add(key.target.clone(), effective_conf, analysed));
        }
    }

    let values = ctx
        .deps(vec![ConfiguredTarget::new(exported, target_conf)])
        .await?;
    let dep = &values[0];
    for var in dep.vars() {
        if !flexible.contains(var) && fixed.get(var).is_none() {
            ctx.log(&format!(
                "Export target {} does not list configuration variable {:?} in flexible_config; result is not cache eligible",
                key.target, var
            ));
        }
    }
    let mut implied: BTreeSet<String> = dep.implied_export().clone();
    implied.insert(target_triple.to_string());
    let analysed = Arc::new(AnalysedTarget::new(
        dep.result().clone(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        flexible.into_iter().collect(),
        dep.tainted().clone(),
        implied,
        graph_info_for(key, &effective_conf, &values),
    ));
    Ok(analysis
        .result_map
        .add(key.target.clone(), effective_conf, analysed))
}

// ---------------------------------------------------------------------------
// configure
// ---------------------------------------------------------------------------

async fn configure_target(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    named: &NamedTarget,
    desc: &Json,
) -> Result<AnalysedTargetPtr, Failure> {
    let target_vars = desc_string_list(desc, "arguments_config")?;
    let param_config = key.config.prune(&target_vars);
    let target_json = desc
        .get("target")
        .ok_or_else(|| fatal("configure target is missing the 'target' field"))?;
    let configured = parse_entity_name(target_json, named)
        .map_err(|err| fatal(format!("Parsing configured target failed with:\n{}", err)))?;
    let overlay = eval_field(analysis, desc, "config", &param_config, Value::empty_map())?;
    let Some(overlay_map) = overlay.as_map() else {
        return Err(fatal(format!(
            "config has to evaluate to a map, but found {}",
            overlay
        )));
    };
    let new_config = key.config.update_from(&overlay);
    let values = ctx
        .deps(vec![ConfiguredTarget::new(configured, new_config)])
        .await?;
    let dep = &values[0];

    let fixed: BTreeSet<String> = overlay_map.keys().into_iter().collect();
    let mut vars: BTreeSet<String> = target_vars.iter().cloned().collect();
    for var in dep.vars() {
        if !fixed.contains(var) {
            vars.insert(var.clone());
        }
    }
    let effective_conf = key.config.prune(&vars);
    let analysed = Arc::new(AnalysedTarget::new(
        dep.result().clone(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        vars,
        dep.tainted().clone(),
        dep.implied_export().clone(),
        graph_info_for(key, &effective_conf, &values),
    ));
    Ok(analysis
        .result_map
        .add(key.target.clone(), effective_conf, analysed))
}

// ---------------------------------------------------------------------------
// file_gen
// ---------------------------------------------------------------------------

fn file_gen_target(
    analysis: &Analysis,
    key: &ConfiguredTarget,
    _named: &NamedTarget,
    desc: &Json,
) -> Result<AnalysedTargetPtr, Failure> {
    let target_vars = desc_string_list(desc, "arguments_config")?;
    let param_config = key.config.prune(&target_vars);
    let name_value = eval_field(analysis, desc, "name", &param_config, Value::string("out"))?;
    let Some(file_name) = name_value.as_str() else {
        return Err(fatal(format!(
            "name has to evaluate to a string, but found {}",
            name_value
        )));
    };
    let data_value = eval_field(analysis, desc, "data", &param_config, Value::string(""))?;
    let Some(data) = data_value.as_str() else {
        return Err(fatal(format!(
            "data has to evaluate to a string, but found {}",
            data_value
        )));
    };
    let artifact = Value::artifact(ArtifactDescription::known(
        compute_hash(data.as_bytes()),
        ObjectType::File,
    ));
    let stage = Value::map_from(BTreeMap::from([(file_name.to_string(), artifact)]));
    let effective_conf = key.config.prune(&target_vars);
    let analysed = Arc::new(AnalysedTarget::new(
        TargetResult::new(stage.clone(), stage, Value::empty_map()),
        Vec::new(),
        vec![data.to_string()],
        Vec::new(),
        target_vars.into_iter().collect(),
        BTreeSet::new(),
        BTreeSet::new(),
        graph_info_for(key, &effective_conf, &[]),
    ));
    Ok(analysis
        .result_map
        .add(key.target.clone(), effective_conf, analysed))
}

// ---------------------------------------------------------------------------
// generic
// ---------------------------------------------------------------------------

async fn generic_target(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    named: &NamedTarget,
    desc: &Json,
) -> Result<AnalysedTargetPtr, Failure> {
    let target_vars = desc_string_list(desc, "arguments_config")?;
    let param_config = key.config.prune(&target_vars);
    let dep_names = parse_dep_list(desc, "deps", named)?;
    let dep_keys: Vec<ConfiguredTarget> = dep_names
        .iter()
        .map(|dep| ConfiguredTarget::new(dep.clone(), key.config.clone()))
        .collect();
    let values = ctx.deps(dep_keys).await?;
    let tainted = check_taints(analysis, desc, &param_config, &values)?;

    let mut inputs: BTreeMap<String, Value> = BTreeMap::new();
    for dep in &values {
        if let Some(map) = dep.artifacts().as_map() {
            for (input_path, artifact) in map.items() {
                inputs.insert(input_path.clone(), artifact.clone());
            }
        }
    }
    let inputs_value = Value::map_from(inputs);
    if let Some(conflict) = utils::tree_conflict(&inputs_value) {
        return Err(fatal(format!("inputs conflicts on subtree {}", conflict)));
    }

    let cmds_value = eval_field(analysis, desc, "cmds", &param_config, Value::empty_list())?;
    let cmds = cmds_value
        .as_list()
        .and_then(|list| {
            list.iter()
                .map(|entry| entry.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| {
            fatal(format!(
                "cmds has to evaluate to a list of strings, but found {}",
                cmds_value
            ))
        })?;
    if cmds.is_empty() {
        return Err(fatal("cmds must not be empty for generic"));
    }
    let outs_value = eval_field(analysis, desc, "outs", &param_config, Value::empty_list())?;
    let outs = outs_value
        .as_list()
        .and_then(|list| {
            list.iter()
                .map(|entry| entry.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| fatal("outs has to evaluate to a list of strings"))?;
    let out_dirs_value = eval_field(analysis, desc, "out_dirs", &param_config, Value::empty_list())?;
    let out_dirs = out_dirs_value
        .as_list()
        .and_then(|list| {
            list.iter()
                .map(|entry| entry.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| fatal("out_dirs has to evaluate to a list of strings"))?;
    if outs.is_empty() && out_dirs.is_empty() {
        return Err(fatal("either outs or out_dirs must be specified for generic"));
    }
    let cwd_value = eval_field(analysis, desc, "cwd", &param_config, Value::string(""))?;
    let cwd = cwd_value
        .as_str()
        .ok_or_else(|| fatal("cwd has to evaluate to a string"))?;
    let env_value = eval_field(analysis, desc, "env", &param_config, Value::empty_map())?;
    if !env_value.is_map() {
        return Err(fatal(format!(
            "env has to evaluate to a map of strings, but found {}",
            env_value
        )));
    }

    let command = vec!["sh".to_string(), "-c".to_string(), cmds.join("\n")];
    let action = utils::create_action(
        outs.iter().map(|p| girder_core::path::normalize(p)).collect(),
        out_dirs.iter().map(|p| girder_core::path::normalize(p)).collect(),
        command,
        cwd.to_string(),
        &env_value,
        None,
        false,
        1.0,
        &Value::empty_map(),
        &inputs_value,
    )
    .map_err(|err| fatal(err.message()))?;
    let action_id = action.id();

    let mut stage_entries = BTreeMap::new();
    for out in outs.iter().chain(out_dirs.iter()) {
        let normal = girder_core::path::normalize(out);
        stage_entries.insert(
            normal.clone(),
            Value::artifact(ArtifactDescription::action(action_id.clone(), normal)),
        );
    }
    let stage = Value::map_from(stage_entries);

    let mut vars: BTreeSet<String> = target_vars.into_iter().collect();
    for dep in &values {
        vars.extend(dep.vars().iter().cloned());
    }
    let effective_conf = key.config.prune(&vars);
    let mut implied = BTreeSet::new();
    for dep in &values {
        implied.extend(dep.implied_export().iter().cloned());
    }
    let analysed = Arc::new(AnalysedTarget::new(
        TargetResult::new(stage.clone(), stage, Value::empty_map()),
        vec![action],
        Vec::new(),
        Vec::new(),
        vars,
        tainted,
        implied,
        graph_info_for(key, &effective_conf, &values),
    ));
    Ok(analysis
        .result_map
        .add(key.target.clone(), effective_conf, analysed))
}

// ---------------------------------------------------------------------------
// install
// ---------------------------------------------------------------------------

fn merge_disjoint(
    stage: &mut BTreeMap<String, Value>,
    additions: Vec<(String, Value)>,
    what: &str,
) -> Result<(), Failure> {
    for (stage_path, artifact) in additions {
        if let Some(existing) = stage.get(&stage_path) {
            if existing != &artifact {
                return Err(fatal(format!(
                    "{} conflict on path {}",
                    what, stage_path
                )));
            }
        }
        stage.insert(stage_path, artifact);
    }
    Ok(())
}

async fn install_target(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    named: &NamedTarget,
    desc: &Json,
) -> Result<AnalysedTargetPtr, Failure> {
    let target_vars = desc_string_list(desc, "arguments_config")?;
    let param_config = key.config.prune(&target_vars);

    let dep_names = parse_dep_list(desc, "deps", named)?;
    let mut file_entries: Vec<(String, EntityName)> = Vec::new();
    if let Some(files) = desc.get("files") {
        let map = files
            .as_object()
            .ok_or_else(|| fatal("files has to be a map from path to target"))?;
        for (stage_path, target_json) in map {
            let target = parse_entity_name(target_json, named).map_err(|err| {
                fatal(format!(
                    "Parsing files entry {} failed with:\n{}",
                    target_json, err
                ))
            })?;
            file_entries.push((stage_path.clone(), target));
        }
    }
    let mut dir_entries: Vec<(EntityName, String)> = Vec::new();
    if let Some(dirs) = desc.get("dirs") {
        let list = dirs
            .as_array()
            .ok_or_else(|| fatal("dirs has to be a list of [target, dir] pairs"))?;
        for entry in list {
            let pair = entry
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| fatal("dirs has to be a list of [target, dir] pairs"))?;
            let target = parse_entity_name(&pair[0], named).map_err(|err| {
                fatal(format!("Parsing dirs entry {} failed with:\n{}", pair[0], err))
            })?;
            let dir = pair[1]
                .as_str()
                .ok_or_else(|| fatal("dirs entries need a string directory"))?;
            dir_entries.push((target, dir.to_string()));
        }
    }

    let mut dep_keys: Vec<ConfiguredTarget> = dep_names
        .iter()
        .map(|dep| ConfiguredTarget::new(dep.clone(), key.config.clone()))
        .collect();
    let files_offset = dep_keys.len();
    dep_keys.extend(
        file_entries
            .iter()
            .map(|(_, target)| ConfiguredTarget::new(target.clone(), key.config.clone())),
    );
    let dirs_offset = dep_keys.len();
    dep_keys.extend(
        dir_entries
            .iter()
            .map(|(target, _)| ConfiguredTarget::new(target.clone(), key.config.clone())),
    );
    let values = ctx.deps(dep_keys).await?;
    let tainted = check_taints(analysis, desc, &param_config, &values)?;

    let mut stage: BTreeMap<String, Value> = BTreeMap::new();
    // within one dep, artifacts override runfiles; across deps the
    // staging has to be disjoint
    for dep in &values[..files_offset] {
        let mut combined: BTreeMap<String, Value> = BTreeMap::new();
        if let Some(map) = dep.runfiles().as_map() {
            combined.extend(map.items().iter().cloned());
        }
        if let Some(map) = dep.artifacts().as_map() {
            combined.extend(map.items().iter().cloned());
        }
        merge_disjoint(&mut stage, combined.into_iter().collect(), "install deps")?;
    }
    for ((stage_path, _), dep) in file_entries.iter().zip(&values[files_offset..dirs_offset]) {
        let artifacts = dep
            .artifacts()
            .as_map()
            .map(|m| m.items().to_vec())
            .unwrap_or_default();
        if artifacts.len() != 1 {
            return Err(fatal(format!(
                "files entry {:?} requires a target with exactly one artifact, but found {}",
                stage_path,
                artifacts.len()
            )));
        }
        merge_disjoint(
            &mut stage,
            vec![(stage_path.clone(), artifacts[0].1.clone())],
            "install files",
        )?;
    }
    for ((_, dir), dep) in dir_entries.iter().zip(&values[dirs_offset..]) {
        let mut combined: BTreeMap<String, Value> = BTreeMap::new();
        if let Some(map) = dep.runfiles().as_map() {
            combined.extend(map.items().iter().cloned());
        }
        if let Some(map) = dep.artifacts().as_map() {
            combined.extend(map.items().iter().cloned());
        }
        let staged: Vec<(String, Value)> = combined
            .into_iter()
            .map(|(stage_path, artifact)| {
                (girder_core::path::join(dir, &stage_path), artifact)
            })
            .collect();
        merge_disjoint(&mut stage, staged, "install dirs")?;
    }

    let stage = Value::map_from(stage);
    if let Some(conflict) = utils::tree_conflict(&stage) {
        return Err(fatal(format!(
            "install stage conflicts on subtree {}",
            conflict
        )));
    }
    let mut vars: BTreeSet<String> = target_vars.into_iter().collect();
    let mut implied = BTreeSet::new();
    for dep in &values {
        vars.extend(dep.vars().iter().cloned());
        implied.extend(dep.implied_export().iter().cloned());
    }
    let effective_conf = key.config.prune(&vars);
    let analysed = Arc::new(AnalysedTarget::new(
        TargetResult::new(stage.clone(), stage, Value::empty_map()),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        vars,
        tainted,
        implied,
        graph_info_for(key, &effective_conf, &values),
    ));
    Ok(analysis
        .result_map
        .add(key.target.clone(), effective_conf, analysed))
}

// ---------------------------------------------------------------------------
// tree and overlays
// ---------------------------------------------------------------------------

async fn tree_rule_target(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    named: &NamedTarget,
    desc: &Json,
) -> Result<AnalysedTargetPtr, Failure> {
    let target_vars = desc_string_list(desc, "arguments_config")?;
    let param_config = key.config.prune(&target_vars);
    let dep_names = parse_dep_list(desc, "deps", named)?;
    let dep_keys: Vec<ConfiguredTarget> = dep_names
        .iter()
        .map(|dep| ConfiguredTarget::new(dep.clone(), key.config.clone()))
        .collect();
    let values = ctx.deps(dep_keys).await?;
    let tainted = check_taints(analysis, desc, &param_config, &values)?;

    let mut stage: BTreeMap<String, Value> = BTreeMap::new();
    for dep in &values {
        let additions = dep
            .artifacts()
            .as_map()
            .map(|m| m.items().to_vec())
            .unwrap_or_default();
        merge_disjoint(&mut stage, additions, "tree")?;
    }
    let stage_value = Value::map_from(stage.clone());
    if let Some(conflict) = utils::tree_conflict(&stage_value) {
        return Err(fatal(format!("tree conflicts on subtree {}", conflict)));
    }
    let artifacts = stage
        .into_iter()
        .filter_map(|(stage_path, value)| {
            value
                .as_artifact()
                .cloned()
                .map(|artifact| (stage_path, artifact))
        })
        .collect();
    let tree = Arc::new(Tree::new(artifacts));
    let tree_id = tree.id();
    let tree_stage = Value::map_from(BTreeMap::from([(
        named.name.clone(),
        Value::artifact(ArtifactDescription::tree(tree_id)),
    )]));
    finish_tree_target(analysis, key, target_vars, values, tainted, tree, tree_stage)
}

async fn overlay_target(
    analysis: &Analysis,
    ctx: &TargetCtx,
    key: &ConfiguredTarget,
    named: &NamedTarget,
    desc: &Json,
    disjoint: bool,
) -> Result<AnalysedTargetPtr, Failure> {
    let target_vars = desc_string_list(desc, "arguments_config")?;
    let param_config = key.config.prune(&target_vars);
    let dep_names = parse_dep_list(desc, "deps", named)?;
    let dep_keys: Vec<ConfiguredTarget> = dep_names
        .iter()
        .map(|dep| ConfiguredTarget::new(dep.clone(), key.config.clone()))
        .collect();
    let values = ctx.deps(dep_keys).await?;
    let tainted = check_taints(analysis, desc, &param_config, &values)?;

    let mut stage: BTreeMap<String, Value> = BTreeMap::new();
    for dep in &values {
        let additions = dep
            .artifacts()
            .as_map()
            .map(|m| m.items().to_vec())
            .unwrap_or_default();
        if disjoint {
            merge_disjoint(&mut stage, additions, "disjoint_tree_overlay")?;
        } else {
            // left-to-right overlay, later deps win
            for (stage_path, artifact) in additions {
                stage.insert(stage_path, artifact);
            }
        }
    }
    let artifacts = stage
        .iter()
        .filter_map(|(stage_path, value)| {
            value
                .as_artifact()
                .cloned()
                .map(|artifact| (stage_path.clone(), artifact))
        })
        .collect();
    let tree = Arc::new(Tree::new(artifacts));
    let tree_id = tree.id();
    let tree_stage = Value::map_from(BTreeMap::from([(
        named.name.clone(),
        Value::artifact(ArtifactDescription::tree(tree_id)),
    )]));
    finish_tree_target(analysis, key, target_vars, values, tainted, tree, tree_stage)
}

fn finish_tree_target(
    analysis: &Analysis,
    key: &ConfiguredTarget,
    target_vars: Vec<String>,
    values: Vec<AnalysedTargetPtr>,
    tainted: BTreeSet<String>,
    tree: Arc<Tree>,
    tree_stage: Value,
) -> Result<AnalysedTargetPtr, Failure> {
    let mut vars: BTreeSet<String> = target_vars.into_iter().collect();
    let mut implied = BTreeSet::new();
    for dep in &values {
        vars.extend(dep.vars().iter().cloned());
        implied.extend(dep.implied_export().iter().cloned());
    }
    let effective_conf = key.config.prune(&vars);
    let analysed = Arc::new(AnalysedTarget::new(
        TargetResult::new(tree_stage.clone(), tree_stage, Value::empty_map()),
        Vec::new(),
        Vec::new(),
        vec![tree],
        vars,
        tainted,
        implied,
        graph_info_for(key, &effective_conf, &values),
    ));
    Ok(analysis
        .result_map
        .add(key.target.clone(), effective_conf, analysed))
}
