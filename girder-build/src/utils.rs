//! Analyzer helpers: stage normalization, conflict detection, glob
//! matching, taint collection, and action assembly.

use girder_core::{path, ActionDescription, ArtifactDescription, Tree};
use girder_expr::{Configuration, EvalError, Evaluator, FunctionMap, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `fnmatch`-style matching of a file name against a POSIX glob
/// pattern: `*`, `?`, and `[...]` classes (`!` negates).
pub fn fnmatch(pattern: &str, name: &str) -> bool {
    let mut translated = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                if chars.peek() == Some(&']') {
                    chars.next();
                    class.push(']');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' {
                        class.push_str("\\\\");
                    } else {
                        class.push(inner);
                    }
                }
                if closed {
                    translated.push('[');
                    translated.push_str(&class);
                    translated.push(']');
                } else {
                    // unmatched bracket matches literally
                    translated.push_str(&regex::escape("["));
                    translated.push_str(&regex::escape(&class.replace('^', "!")));
                }
            }
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    regex::Regex::new(&translated)
        .map(|r| r.is_match(name))
        .unwrap_or(false)
}

/// Normalize all stage paths; a path that two keys normalize to with
/// unequal values is a conflict, reported by path.
pub fn artifacts_tree(stage: &Value) -> Result<Value, String> {
    let map = stage
        .as_map()
        .ok_or_else(|| format!("expected artifact map, got {}", stage.type_string()))?;
    let mut normalized: BTreeMap<String, Value> = BTreeMap::new();
    for (key, value) in map.items() {
        let normal = path::normalize(key);
        if let Some(existing) = normalized.get(&normal) {
            if existing != value {
                return Err(normal);
            }
        }
        normalized.insert(normal, value.clone());
    }
    Ok(Value::map_from(normalized))
}

/// Detect a stage path that is simultaneously used as a file and as a
/// directory prefix (tree conflict); returns the offending prefix.
pub fn tree_conflict(stage: &Value) -> Option<String> {
    let map = stage.as_map()?;
    let items = map.items();
    for window in items.windows(2) {
        let (first, _) = &window[0];
        let (second, _) = &window[1];
        if second.starts_with(&format!("{}/", first)) {
            return Some(first.clone());
        }
    }
    None
}

/// Evaluate a `tainted` expression to a string set.
pub fn get_tainted(
    evaluator: &Evaluator,
    config: &Configuration,
    tainted_expr: &Value,
) -> Result<std::collections::BTreeSet<String>, String> {
    let functions = FunctionMap::chain(girder_expr::builtins(), &FunctionMap::empty());
    let value = evaluator
        .evaluate(tainted_expr, config, &functions)
        .map_err(|err| err.message().to_string())?;
    let list = value
        .as_list()
        .ok_or_else(|| format!("tainted should evaluate to a list of strings, but found {}", value))?;
    let mut tainted = std::collections::BTreeSet::new();
    for entry in list {
        let taint = entry.as_str().ok_or_else(|| {
            format!(
                "tainted should evaluate to a list of strings, but found entry {}",
                entry
            )
        })?;
        tainted.insert(taint.to_string());
    }
    Ok(tainted)
}

/// Ensure the working directory of an action exists among its inputs;
/// when nothing is staged at or below `cwd`, an empty tree is added.
pub fn add_dir_for(
    cwd: &str,
    inputs: Value,
    trees: &mut Vec<Arc<Tree>>,
) -> Result<Value, EvalError> {
    if cwd == "." || cwd.is_empty() {
        return Ok(inputs);
    }
    let map = inputs.try_map()?;
    let prefix = format!("{}/", cwd);
    let covered = map
        .items()
        .iter()
        .any(|(key, _)| key == cwd || key.starts_with(&prefix));
    if covered {
        return Ok(inputs);
    }
    let tree = Arc::new(Tree::new(BTreeMap::new()));
    let tree_artifact = Value::artifact(ArtifactDescription::tree(tree.id()));
    trees.push(tree);
    let mut extended: BTreeMap<String, Value> = map
        .items()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    extended.insert(cwd.to_string(), tree_artifact);
    Ok(Value::map_from(extended))
}

/// Convert an already-validated map of strings into its plain form.
pub fn string_map(value: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(map) = value.as_map() {
        for (key, entry) in map.items() {
            if let Some(s) = entry.as_str() {
                out.insert(key.clone(), s.to_string());
            }
        }
    }
    out
}

/// Assemble an action description from validated pieces.
#[allow(clippy::too_many_arguments)]
pub fn create_action(
    outputs: Vec<String>,
    output_dirs: Vec<String>,
    command: Vec<String>,
    cwd: String,
    env: &Value,
    may_fail: Option<String>,
    no_cache: bool,
    timeout_scale: f64,
    execution_properties: &Value,
    inputs: &Value,
) -> Result<Arc<ActionDescription>, EvalError> {
    let mut input_map = BTreeMap::new();
    if let Some(map) = inputs.as_map() {
        for (input_path, artifact) in map.items() {
            if let Some(description) = artifact.as_artifact() {
                input_map.insert(input_path.clone(), description.clone());
            }
        }
    }
    let action = ActionDescription::new(
        outputs,
        output_dirs,
        command,
        cwd,
        string_map(env),
        may_fail,
        no_cache,
        timeout_scale,
        string_map(execution_properties),
        input_map,
    )
    .map_err(|err| EvalError::new(err.to_string()))?;
    Ok(Arc::new(action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::compute_hash;
    use girder_core::ObjectType;
    use serde_json::json;

    #[test]
    fn test_fnmatch() {
        assert!(fnmatch("*.c", "main.c"));
        assert!(!fnmatch("*.c", "main.h"));
        assert!(fnmatch("lib?.a", "lib1.a"));
        assert!(fnmatch("[ab]*", "b-file"));
        assert!(!fnmatch("[!ab]*", "b-file"));
        assert!(fnmatch("exact", "exact"));
        assert!(!fnmatch("exact", "exact2"));
    }

    #[test]
    fn test_artifacts_tree_normalizes_and_detects_conflicts() {
        let artifact = Value::artifact(ArtifactDescription::known(
            compute_hash(b"x"),
            ObjectType::File,
        ));
        let other = Value::artifact(ArtifactDescription::known(
            compute_hash(b"y"),
            ObjectType::File,
        ));
        let stage = Value::map_from(
            [("a/./b".to_string(), artifact.clone())].into_iter().collect(),
        );
        let normalized = artifacts_tree(&stage).expect("no conflict");
        assert!(normalized.get("a/b").is_some());

        let conflicting = Value::map_from(
            [
                ("a/./b".to_string(), artifact),
                ("a/b".to_string(), other),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(artifacts_tree(&conflicting), Err("a/b".to_string()));
    }

    #[test]
    fn test_tree_conflict() {
        let leaf = Value::from_json(&json!(1.0));
        let stage = Value::map_from(
            [
                ("a/b".to_string(), leaf.clone()),
                ("a/b/c".to_string(), leaf.clone()),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(tree_conflict(&stage), Some("a/b".to_string()));
        let clean = Value::map_from(
            [
                ("a/b".to_string(), leaf.clone()),
                ("a/bc".to_string(), leaf),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(tree_conflict(&clean), None);
    }

    #[test]
    fn test_get_tainted() {
        let tainted = get_tainted(
            &Evaluator::default(),
            &Configuration::default(),
            &Value::from_json(&json!(["test", "secret"])),
        )
        .expect("valid taint list");
        assert!(tainted.contains("test"));
        assert!(tainted.contains("secret"));
        assert!(get_tainted(
            &Evaluator::default(),
            &Configuration::default(),
            &Value::from_json(&json!([1.0]))
        )
        .is_err());
    }
}
