//! User rules
//!
//! Schema of a named rule: the disjoint field vocabularies, free
//! configuration variables, taints, per-field configuration
//! transitions, and the defining expression. Construction validates
//! the schema; a rule that passes is immutable and shared.

use girder_expr::{
    EntityName, ExpressionFunction, ExpressionFunctionPtr, NamedTarget, ReferenceKind, Value,
};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Keywords every target description may carry; user-defined fields
/// must avoid them.
pub const RESERVED_KEYWORDS: [&str; 3] = ["arguments_config", "tainted", "type"];

/// Declaration of an anonymous field: harvest the providers of the
/// named target field and instantiate the nodes via the rule map.
#[derive(Debug, Clone)]
pub struct AnonymousDefinition {
    pub target: String,
    pub provider: String,
    /// map from node type to rule name (a name value)
    pub rule_map: Value,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleError {
    #[error("User-defined fields cannot be any of the reserved fields [{reserved}]")]
    ReservedField { reserved: String },

    #[error("A field can have only one type, but the following have more: [{fields}]")]
    AmbiguousFields { fields: String },

    #[error(
        "Config transitions has to be a map from target fields to transition expressions, but found [{fields}]"
    )]
    TransitionOnNonTarget { fields: String },

    #[error("Malformed rule description: {reason}")]
    Malformed { reason: String },
}

pub type UserRulePtr = Arc<UserRule>;

pub struct UserRule {
    target_fields: Vec<String>,
    string_fields: Vec<String>,
    config_fields: Vec<String>,
    implicit_targets: BTreeMap<String, Vec<EntityName>>,
    implicit_target_exprs: HashMap<String, Value>,
    anonymous_definitions: BTreeMap<String, AnonymousDefinition>,
    config_vars: Vec<String>,
    tainted: BTreeSet<String>,
    config_transitions: HashMap<String, ExpressionFunctionPtr>,
    expression: ExpressionFunctionPtr,
    expected_fields: HashSet<String>,
}

impl UserRule {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        mut target_fields: Vec<String>,
        mut string_fields: Vec<String>,
        mut config_fields: Vec<String>,
        implicit_targets: BTreeMap<String, Vec<EntityName>>,
        anonymous_definitions: BTreeMap<String, AnonymousDefinition>,
        config_vars: Vec<String>,
        tainted: Vec<String>,
        mut config_transitions: HashMap<String, ExpressionFunctionPtr>,
        expression: ExpressionFunctionPtr,
    ) -> Result<UserRulePtr, RuleError> {
        target_fields.sort();
        string_fields.sort();
        config_fields.sort();
        let implicit_fields: Vec<String> = implicit_targets.keys().cloned().collect();
        let anonymous_fields: Vec<String> = anonymous_definitions.keys().cloned().collect();

        let all_fields: Vec<&[String]> = vec![
            &target_fields,
            &string_fields,
            &config_fields,
            &implicit_fields,
            &anonymous_fields,
        ];
        for fields in &all_fields {
            if fields
                .iter()
                .any(|f| RESERVED_KEYWORDS.contains(&f.as_str()))
            {
                return Err(RuleError::ReservedField {
                    reserved: RESERVED_KEYWORDS.join(","),
                });
            }
        }
        let mut seen: HashSet<&String> = HashSet::new();
        let mut duplicates: BTreeSet<String> = BTreeSet::new();
        for fields in &all_fields {
            for field in fields.iter() {
                if !seen.insert(field) {
                    duplicates.insert(field.clone());
                }
            }
        }
        if !duplicates.is_empty() {
            return Err(RuleError::AmbiguousFields {
                fields: duplicates.into_iter().collect::<Vec<_>>().join(","),
            });
        }

        let transition_targets: Vec<&String> = config_transitions.keys().collect();
        let allowed: HashSet<&String> = target_fields
            .iter()
            .chain(implicit_fields.iter())
            .chain(anonymous_fields.iter())
            .collect();
        let stray: Vec<String> = transition_targets
            .iter()
            .filter(|t| !allowed.contains(*t))
            .map(|t| (*t).clone())
            .collect();
        if !stray.is_empty() {
            let mut all: Vec<String> = config_transitions.keys().cloned().collect();
            all.sort();
            return Err(RuleError::TransitionOnNonTarget {
                fields: all.join(","),
            });
        }
        // missing transitions default to the identity transition
        for field in target_fields
            .iter()
            .chain(implicit_fields.iter())
            .chain(anonymous_fields.iter())
        {
            config_transitions
                .entry(field.clone())
                .or_insert_with(ExpressionFunction::empty_transition);
        }

        let implicit_target_exprs = implicit_targets
            .iter()
            .map(|(field, names)| {
                (
                    field.clone(),
                    Value::list(names.iter().cloned().map(Value::name).collect()),
                )
            })
            .collect();

        let mut expected_fields: HashSet<String> = RESERVED_KEYWORDS
            .iter()
            .map(|s| s.to_string())
            .collect();
        expected_fields.extend(target_fields.iter().cloned());
        expected_fields.extend(string_fields.iter().cloned());
        expected_fields.extend(config_fields.iter().cloned());

        Ok(Arc::new(UserRule {
            target_fields,
            string_fields,
            config_fields,
            implicit_targets,
            implicit_target_exprs,
            anonymous_definitions,
            config_vars,
            tainted: tainted.into_iter().collect(),
            config_transitions,
            expression,
            expected_fields,
        }))
    }

    pub fn target_fields(&self) -> &[String] {
        &self.target_fields
    }

    pub fn string_fields(&self) -> &[String] {
        &self.string_fields
    }

    pub fn config_fields(&self) -> &[String] {
        &self.config_fields
    }

    pub fn implicit_targets(&self) -> &BTreeMap<String, Vec<EntityName>> {
        &self.implicit_targets
    }

    pub fn implicit_target_exprs(&self) -> &HashMap<String, Value> {
        &self.implicit_target_exprs
    }

    pub fn anonymous_definitions(&self) -> &BTreeMap<String, AnonymousDefinition> {
        &self.anonymous_definitions
    }

    pub fn config_vars(&self) -> &[String] {
        &self.config_vars
    }

    pub fn tainted(&self) -> &BTreeSet<String> {
        &self.tainted
    }

    pub fn config_transitions(&self) -> &HashMap<String, ExpressionFunctionPtr> {
        &self.config_transitions
    }

    pub fn expression(&self) -> &ExpressionFunctionPtr {
        &self.expression
    }

    /// The closed vocabulary accepted on a target description.
    pub fn expected_fields(&self) -> &HashSet<String> {
        &self.expected_fields
    }
}

// ---------------------------------------------------------------------------
// Entity-name parsing
// ---------------------------------------------------------------------------

/// Parse a target reference as written in target or rule files,
/// relative to `current`:
/// - `"name"` — target in the current module
/// - `["@", repo, module, name]` — absolute reference
/// - `["./", subdir, name]` — target in a submodule
/// - `["FILE"|"SYMLINK"|"TREE"|"GLOB", null, name]` — source reference
///   in the current module
/// - `[module, name]` — target in another module of the same repository
pub fn parse_entity_name(json: &Json, current: &NamedTarget) -> Result<EntityName, String> {
    if let Some(name) = json.as_str() {
        return Ok(EntityName::named(
            current.repository.clone(),
            current.module.clone(),
            name,
            ReferenceKind::Target,
        ));
    }
    let Some(list) = json.as_array() else {
        return Err(format!(
            "expected string or list as target name, got {}",
            json
        ));
    };
    let string_at = |index: usize| -> Result<&str, String> {
        list.get(index)
            .and_then(Json::as_str)
            .ok_or_else(|| format!("expected string at position {} in {}", index, json))
    };
    match list.first().and_then(Json::as_str) {
        Some("@") if list.len() == 4 => Ok(EntityName::named(
            string_at(1)?,
            string_at(2)?,
            string_at(3)?,
            ReferenceKind::Target,
        )),
        Some("./") if list.len() == 3 => {
            let module = girder_core::path::join(&current.module, string_at(1)?);
            Ok(EntityName::named(
                current.repository.clone(),
                module,
                string_at(2)?,
                ReferenceKind::Target,
            ))
        }
        Some(kind @ ("FILE" | "SYMLINK" | "TREE" | "GLOB")) if list.len() == 3 => {
            let reference = match kind {
                "FILE" => ReferenceKind::File,
                "SYMLINK" => ReferenceKind::Symlink,
                "TREE" => ReferenceKind::Tree,
                _ => ReferenceKind::Glob,
            };
            Ok(EntityName::named(
                current.repository.clone(),
                current.module.clone(),
                string_at(2)?,
                reference,
            ))
        }
        Some(module) if list.len() == 2 => Ok(EntityName::named(
            current.repository.clone(),
            module,
            string_at(1)?,
            ReferenceKind::Target,
        )),
        _ => Err(format!("unsupported target name {}", json)),
    }
}

/// Parse a target reference from an evaluated expression value; name
/// values pass through unchanged.
pub fn parse_entity_name_from_expression(
    value: &Value,
    current: &NamedTarget,
) -> Result<EntityName, String> {
    if let Some(name) = value.as_name() {
        return Ok(name.clone());
    }
    parse_entity_name(&value.to_json_all(), current)
}

// ---------------------------------------------------------------------------
// Rule-file parsing
// ---------------------------------------------------------------------------

fn string_list(json: &Json, field: &str) -> Result<Vec<String>, RuleError> {
    match json.get(field) {
        None => Ok(Vec::new()),
        Some(value) => value
            .as_array()
            .and_then(|list| {
                list.iter()
                    .map(|entry| entry.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| RuleError::Malformed {
                reason: format!("{} has to be a list of strings", field),
            }),
    }
}

/// Parse an expression-function definition: either a bare expression
/// or `{"vars": [...], "imports": {...}, "expression": ...}`.
fn parse_expression_function(
    json: &Json,
    default_vars: &[String],
) -> Result<ExpressionFunctionPtr, RuleError> {
    if let Some(object) = json.as_object() {
        if object.contains_key("expression") {
            let vars = string_list(json, "vars")?;
            let vars = if vars.is_empty() {
                default_vars.to_vec()
            } else {
                vars
            };
            let mut imports = HashMap::new();
            if let Some(import_map) = json.get("imports") {
                let entries = import_map.as_object().ok_or_else(|| RuleError::Malformed {
                    reason: "imports has to be a map".to_string(),
                })?;
                for (name, def) in entries {
                    imports.insert(name.clone(), parse_expression_function(def, &[])?);
                }
            }
            let body = json.get("expression").ok_or_else(|| RuleError::Malformed {
                reason: "missing expression".to_string(),
            })?;
            return Ok(ExpressionFunction::new(
                vars,
                imports,
                Value::from_json(body),
            ));
        }
    }
    Ok(ExpressionFunction::new(
        default_vars.to_vec(),
        HashMap::new(),
        Value::from_json(json),
    ))
}

/// Parse a rule description (the value of one entry in a rule file).
pub fn parse_rule(json: &Json, rule_name: &NamedTarget) -> Result<UserRulePtr, RuleError> {
    let target_fields = string_list(json, "target_fields")?;
    let string_fields = string_list(json, "string_fields")?;
    let config_fields = string_list(json, "config_fields")?;
    let config_vars = string_list(json, "config_vars")?;
    let tainted = string_list(json, "tainted")?;

    let mut implicit_targets = BTreeMap::new();
    if let Some(implicit) = json.get("implicit") {
        let entries = implicit.as_object().ok_or_else(|| RuleError::Malformed {
            reason: "implicit has to be a map of target lists".to_string(),
        })?;
        for (field, names) in entries {
            let list = names.as_array().ok_or_else(|| RuleError::Malformed {
                reason: format!("implicit field {} has to be a list", field),
            })?;
            let mut parsed = Vec::with_capacity(list.len());
            for name in list {
                parsed.push(parse_entity_name(name, rule_name).map_err(|reason| {
                    RuleError::Malformed { reason }
                })?);
            }
            implicit_targets.insert(field.clone(), parsed);
        }
    }

    let mut anonymous_definitions = BTreeMap::new();
    if let Some(anonymous) = json.get("anonymous") {
        let entries = anonymous.as_object().ok_or_else(|| RuleError::Malformed {
            reason: "anonymous has to be a map of definitions".to_string(),
        })?;
        for (field, def) in entries {
            let target = def
                .get("target")
                .and_then(Json::as_str)
                .ok_or_else(|| RuleError::Malformed {
                    reason: format!("anonymous field {} is missing 'target'", field),
                })?;
            let provider = def
                .get("provider")
                .and_then(Json::as_str)
                .ok_or_else(|| RuleError::Malformed {
                    reason: format!("anonymous field {} is missing 'provider'", field),
                })?;
            let rule_map_json = def
                .get("rule_map")
                .and_then(Json::as_object)
                .ok_or_else(|| RuleError::Malformed {
                    reason: format!("anonymous field {} is missing 'rule_map'", field),
                })?;
            let mut rule_map = BTreeMap::new();
            for (node_type, name) in rule_map_json {
                let entity = parse_entity_name(name, rule_name)
                    .map_err(|reason| RuleError::Malformed { reason })?;
                rule_map.insert(node_type.clone(), Value::name(entity));
            }
            anonymous_definitions.insert(
                field.clone(),
                AnonymousDefinition {
                    target: target.to_string(),
                    provider: provider.to_string(),
                    rule_map: Value::map_from(rule_map),
                },
            );
        }
    }

    let mut config_transitions = HashMap::new();
    if let Some(transitions) = json.get("config_transitions") {
        let entries = transitions.as_object().ok_or_else(|| RuleError::Malformed {
            reason: "config_transitions has to be a map".to_string(),
        })?;
        for (field, expr) in entries {
            config_transitions.insert(
                field.clone(),
                parse_expression_function(expr, &config_vars)?,
            );
        }
    }

    let expression_json = json.get("expression").ok_or_else(|| RuleError::Malformed {
        reason: "rule is missing its defining expression".to_string(),
    })?;
    let expression = parse_expression_function(expression_json, &config_vars)?;

    UserRule::create(
        target_fields,
        string_fields,
        config_fields,
        implicit_targets,
        anonymous_definitions,
        config_vars,
        tainted,
        config_transitions,
        expression,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn current() -> NamedTarget {
        NamedTarget::new("base", "src", "tool", ReferenceKind::Target)
    }

    #[test]
    fn test_parse_entity_name_forms() {
        let current = current();
        assert_eq!(
            parse_entity_name(&json!("dep"), &current).expect("parses"),
            EntityName::named("base", "src", "dep", ReferenceKind::Target)
        );
        assert_eq!(
            parse_entity_name(&json!(["@", "other", "mod", "t"]), &current).expect("parses"),
            EntityName::named("other", "mod", "t", ReferenceKind::Target)
        );
        assert_eq!(
            parse_entity_name(&json!(["./", "sub", "t"]), &current).expect("parses"),
            EntityName::named("base", "src/sub", "t", ReferenceKind::Target)
        );
        assert_eq!(
            parse_entity_name(&json!(["FILE", null, "main.c"]), &current).expect("parses"),
            EntityName::named("base", "src", "main.c", ReferenceKind::File)
        );
        assert_eq!(
            parse_entity_name(&json!(["GLOB", null, "*.c"]), &current).expect("parses"),
            EntityName::named("base", "src", "*.c", ReferenceKind::Glob)
        );
        assert_eq!(
            parse_entity_name(&json!(["lib", "util"]), &current).expect("parses"),
            EntityName::named("base", "lib", "util", ReferenceKind::Target)
        );
        assert!(parse_entity_name(&json!(42), &current).is_err());
    }

    #[test]
    fn test_reserved_field_rejected() {
        let result = UserRule::create(
            vec!["type".to_string()],
            vec![],
            vec![],
            BTreeMap::new(),
            BTreeMap::new(),
            vec![],
            vec![],
            HashMap::new(),
            ExpressionFunction::empty_transition(),
        );
        assert!(matches!(result, Err(RuleError::ReservedField { .. })));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let result = UserRule::create(
            vec!["srcs".to_string()],
            vec!["srcs".to_string()],
            vec![],
            BTreeMap::new(),
            BTreeMap::new(),
            vec![],
            vec![],
            HashMap::new(),
            ExpressionFunction::empty_transition(),
        );
        assert!(matches!(result, Err(RuleError::AmbiguousFields { .. })));
    }

    #[test]
    fn test_transition_must_name_target_field() {
        let mut transitions = HashMap::new();
        transitions.insert(
            "not_a_field".to_string(),
            ExpressionFunction::empty_transition(),
        );
        let result = UserRule::create(
            vec!["deps".to_string()],
            vec![],
            vec![],
            BTreeMap::new(),
            BTreeMap::new(),
            vec![],
            vec![],
            transitions,
            ExpressionFunction::empty_transition(),
        );
        assert!(matches!(result, Err(RuleError::TransitionOnNonTarget { .. })));
    }

    #[test]
    fn test_missing_transitions_default_to_identity() {
        let rule = UserRule::create(
            vec!["deps".to_string()],
            vec![],
            vec![],
            BTreeMap::new(),
            BTreeMap::new(),
            vec![],
            vec![],
            HashMap::new(),
            ExpressionFunction::empty_transition(),
        )
        .expect("valid rule");
        assert!(rule.config_transitions().contains_key("deps"));
    }

    #[test]
    fn test_expected_fields_vocabulary() {
        let rule = UserRule::create(
            vec!["deps".to_string()],
            vec!["flags".to_string()],
            vec!["mode".to_string()],
            BTreeMap::new(),
            BTreeMap::new(),
            vec![],
            vec![],
            HashMap::new(),
            ExpressionFunction::empty_transition(),
        )
        .expect("valid rule");
        for field in ["deps", "flags", "mode", "type", "arguments_config", "tainted"] {
            assert!(rule.expected_fields().contains(field), "{}", field);
        }
        assert!(!rule.expected_fields().contains("other"));
    }

    #[test]
    fn test_parse_rule_round_trip() {
        let rule_json = json!({
            "target_fields": ["deps"],
            "string_fields": ["flags"],
            "config_vars": ["OS"],
            "tainted": ["test"],
            "implicit": {"toolchain": [["@", "base", "cc", "defaults"]]},
            "expression": {"type": "RESULT"},
        });
        let rule = parse_rule(&rule_json, &current()).expect("parses");
        assert_eq!(rule.target_fields(), ["deps"]);
        assert_eq!(rule.string_fields(), ["flags"]);
        assert_eq!(rule.config_vars(), ["OS"]);
        assert!(rule.tainted().contains("test"));
        assert!(rule.implicit_targets().contains_key("toolchain"));
        assert!(rule.config_transitions().contains_key("toolchain"));
    }
}
