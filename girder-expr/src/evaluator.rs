//! Expression evaluator
//!
//! Recursive interpreter for the JSON-embedded expression language.
//! Lists evaluate element-wise, scalars evaluate to themselves, and a
//! map dispatches on its `"type"` key through the function map. Errors
//! carry the structured context the CLI needs: a traceback flag, a
//! user-context flag for `fail`-style errors, and the objects involved.

use crate::configuration::Configuration;
use crate::function_map::{EvalFunction, FunctionMap, SubEval};
use crate::linked_map::LinkedMap;
use crate::value::{JsonMode, Kind, Value};
use girder_core::path;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Structured evaluation error.
#[derive(Debug, Clone)]
pub struct EvalError {
    msg: String,
    while_eval: bool,
    user_context: bool,
    involved_objects: Vec<Value>,
}

impl EvalError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            while_eval: false,
            user_context: false,
            involved_objects: Vec::new(),
        }
    }

    /// An error raised by `fail` or a user assertion; presented without
    /// the frame-by-frame traceback.
    pub fn user(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            while_eval: false,
            user_context: true,
            involved_objects: Vec::new(),
        }
    }

    pub fn with_flags(
        msg: impl Into<String>,
        while_eval: bool,
        user_context: bool,
        involved_objects: Vec<Value>,
    ) -> Self {
        Self {
            msg: msg.into(),
            while_eval,
            user_context,
            involved_objects,
        }
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn while_evaluation(&self) -> bool {
        self.while_eval
    }

    pub fn user_context(&self) -> bool {
        self.user_context
    }

    pub fn involved_objects(&self) -> &[Value] {
        &self.involved_objects
    }

    /// Wrap with additional context; transparent when the inner error
    /// already carries user context.
    pub fn while_eval(context: impl fmt::Display, err: EvalError) -> Self {
        if err.user_context {
            return err;
        }
        Self {
            msg: format!("{}\n{}", context, err.msg),
            while_eval: true,
            user_context: false,
            involved_objects: err.involved_objects,
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for EvalError {}

impl From<crate::value::TypeError> for EvalError {
    fn from(err: crate::value::TypeError) -> Self {
        EvalError::new(err.to_string())
    }
}

/// The evaluator; its only state is error-formatting configuration.
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    log_limit: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self {
            log_limit: Self::DEFAULT_LOG_LIMIT,
        }
    }
}

impl Evaluator {
    pub const DEFAULT_LOG_LIMIT: usize = 320;

    pub fn new(log_limit: usize) -> Self {
        Self { log_limit }
    }

    pub fn log_limit(&self) -> usize {
        self.log_limit
    }

    /// Evaluate under the built-in catalog extended by
    /// `provider_functions`. Never propagates an error: failures are
    /// serialized (expression, environment snapshot, message) to
    /// `logger` and `None` is returned.
    pub fn evaluate_expression(
        &self,
        expr: &Value,
        env: &Configuration,
        provider_functions: &FunctionMap,
        logger: &dyn Fn(&str),
        annotate_object: Option<&dyn Fn(&Value) -> String>,
        note_user_context: Option<&dyn Fn()>,
    ) -> Option<Value> {
        let functions = FunctionMap::chain(builtins(), provider_functions);
        match self.evaluate(expr, env, &functions) {
            Ok(value) => Some(value),
            Err(err) => {
                let mut out = String::new();
                if err.user_context() {
                    if let Some(note) = note_user_context {
                        note();
                    }
                } else if err.while_evaluation() {
                    out.push_str("Expression evaluation traceback (most recent call last):\n");
                }
                out.push_str(err.message());
                if let Some(annotate) = annotate_object {
                    for object in err.involved_objects() {
                        out.push_str(&annotate(object));
                    }
                }
                logger(&out);
                None
            }
        }
    }

    /// Recursive evaluation; each frame wraps errors with the
    /// expression and an environment snapshot.
    pub fn evaluate(
        &self,
        expr: &Value,
        env: &Configuration,
        functions: &FunctionMap,
    ) -> Result<Value, EvalError> {
        self.eval_frame(expr, env, functions)
            .map_err(|err| self.frame_error(expr, env, err))
    }

    fn eval_frame(
        &self,
        expr: &Value,
        env: &Configuration,
        functions: &FunctionMap,
    ) -> Result<Value, EvalError> {
        match expr.kind() {
            Kind::List(items) => {
                if items.is_empty() {
                    return Ok(expr.clone());
                }
                let mut evaluated = Vec::with_capacity(items.len());
                for item in items {
                    evaluated.push(self.evaluate(item, env, functions)?);
                }
                Ok(Value::list(evaluated))
            }
            Kind::Map(map) => {
                let Some(type_token) = map.find("type") else {
                    return Err(EvalError::new(format!(
                        "Object without keyword 'type': {}",
                        expr.to_string_json()
                    )));
                };
                let operator = type_token.try_str()?;
                let Some(function) = functions.find(operator) else {
                    return Err(EvalError::new(format!(
                        "Unknown syntactical construct {}",
                        operator
                    )));
                };
                let function = function.clone();
                let sub_eval =
                    |sub: &Value, sub_env: &Configuration| self.evaluate(sub, sub_env, functions);
                function(&sub_eval, expr, env)
            }
            _ => Ok(expr.clone()),
        }
    }

    fn frame_error(&self, expr: &Value, env: &Configuration, err: EvalError) -> EvalError {
        if err.user_context() {
            return err;
        }
        let mut frame = String::from("* ");
        if let Some(op) = expr.get("type").and_then(Value::as_str) {
            frame.push_str(&format!("{:?}-expression ", op));
        }
        frame.push_str(&expr.to_abbrev_string(self.log_limit));
        frame.push_str("\n  environment\n");
        frame.push_str(&env.enumerate("  - ", self.log_limit));
        EvalError::while_eval(frame, err)
    }
}

/// Value truthiness: none and the canonical empties are false, all
/// other values (including every artifact, result, node, and name) are
/// true.
pub fn value_is_true(value: &Value) -> bool {
    match value.kind() {
        Kind::None => false,
        Kind::Bool(b) => *b,
        Kind::Number(n) => *n != 0.0,
        Kind::String(s) => !s.is_empty(),
        Kind::List(items) => !items.is_empty(),
        Kind::Map(map) => !map.is_empty(),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Argument plumbing
// ---------------------------------------------------------------------------

fn expr_at<'a>(expr: &'a Value, key: &str) -> Result<&'a Value, EvalError> {
    expr.get(key)
        .ok_or_else(|| EvalError::new(format!("Map does not contain key '{}'.", key)))
}

fn eval_argument(
    expr: &Value,
    argument: &str,
    eval: SubEval,
    env: &Configuration,
) -> Result<Value, EvalError> {
    eval(expr_at(expr, argument)?, env)
        .map_err(|err| EvalError::while_eval(format!("Evaluating argument {}:", argument), err))
}

/// Lift an operator over its evaluated `$1` argument.
fn unary(f: fn(&Value) -> Result<Value, EvalError>) -> EvalFunction {
    Arc::new(move |eval: SubEval, expr: &Value, env: &Configuration| {
        let argument = eval_argument(expr, "$1", eval, env)?;
        f(&argument).map_err(|err| {
            EvalError::while_eval(
                format!(
                    "Having evaluated the argument to {}:",
                    argument.to_abbrev_string(Evaluator::DEFAULT_LOG_LIMIT)
                ),
                err,
            )
        })
    })
}

/// Evaluate the optional `msg` argument for a user-facing error,
/// falling back to the unevaluated term when it fails to evaluate.
fn eval_msg(expr: &Value, eval: SubEval, env: &Configuration) -> Option<String> {
    let msg_expr = expr.get("msg")?.clone();
    Some(
        eval(&msg_expr, env)
            .map(|v| v.to_string_json())
            .unwrap_or_else(|_| format!("[non evaluating term] {}", msg_expr.to_string_json())),
    )
}

// ---------------------------------------------------------------------------
// Plain operators over already-evaluated values
// ---------------------------------------------------------------------------

fn flatten(expr: &Value) -> Result<Value, EvalError> {
    let list = expr.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "Flatten expects list but instead got: {}.",
            expr.to_string_json()
        ))
    })?;
    if list.is_empty() {
        return Ok(expr.clone());
    }
    let mut result = Vec::new();
    for entry in list {
        let inner = entry.as_list().ok_or_else(|| {
            EvalError::new(format!(
                "Non-list entry found for argument in flatten: {}.",
                entry.to_string_json()
            ))
        })?;
        result.extend(inner.iter().cloned());
    }
    Ok(Value::list(result))
}

fn addition(expr: &Value) -> Result<Value, EvalError> {
    let list = expr.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "Addition expects a list, but found: {}",
            expr.to_string_json()
        ))
    })?;
    let mut sum = 0.0;
    for entry in list {
        sum += entry.as_number().ok_or_else(|| {
            EvalError::new(format!(
                "Non-number entry found for argument to addition: {}",
                entry.to_string_json()
            ))
        })?;
    }
    Ok(Value::number(sum))
}

fn multiplication(expr: &Value) -> Result<Value, EvalError> {
    let list = expr.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "Multiplication expects a list, but found: {}",
            expr.to_string_json()
        ))
    })?;
    let mut product = 1.0;
    for entry in list {
        product *= entry.as_number().ok_or_else(|| {
            EvalError::new(format!(
                "Non-number entry found for argument to multiplication: {}",
                entry.to_string_json()
            ))
        })?;
    }
    Ok(Value::number(product))
}

fn all_true(expr: &Value) -> Result<Value, EvalError> {
    for entry in expr.try_list()? {
        if !value_is_true(entry) {
            return Ok(Value::bool(false));
        }
    }
    Ok(Value::bool(true))
}

fn any_true(expr: &Value) -> Result<Value, EvalError> {
    for entry in expr.try_list()? {
        if value_is_true(entry) {
            return Ok(Value::bool(true));
        }
    }
    Ok(Value::bool(false))
}

fn negate(expr: &Value) -> Result<Value, EvalError> {
    Ok(Value::bool(!value_is_true(expr)))
}

fn keys_of(expr: &Value) -> Result<Value, EvalError> {
    let map = expr.try_map()?;
    Ok(Value::list(
        map.items()
            .iter()
            .map(|(key, _)| Value::string(key.clone()))
            .collect(),
    ))
}

fn values_of(expr: &Value) -> Result<Value, EvalError> {
    Ok(Value::list(expr.try_map()?.values()))
}

fn enumerate_list(expr: &Value) -> Result<Value, EvalError> {
    let list = expr.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "enumerate expects list but instead got: {}.",
            expr.to_string_json()
        ))
    })?;
    let mut result = BTreeMap::new();
    for (index, entry) in list.iter().enumerate() {
        result.insert(format!("{:010}", index), entry.clone());
    }
    Ok(Value::map_from(result))
}

fn set_of(expr: &Value) -> Result<Value, EvalError> {
    let list = expr.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "set expects list of strings but instead got: {}.",
            expr.to_string_json()
        ))
    })?;
    let mut result = BTreeMap::new();
    for entry in list {
        let key = entry.as_str().ok_or_else(|| {
            EvalError::new(format!(
                "set expects list of strings found entry: {}.",
                entry.to_string_json()
            ))
        })?;
        result.insert(key.to_string(), Value::bool(true));
    }
    Ok(Value::map_from(result))
}

fn reverse_list(expr: &Value) -> Result<Value, EvalError> {
    let list = expr.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "reverse expects list but instead got: {}.",
            expr.to_string_json()
        ))
    })?;
    let mut reversed: Vec<Value> = list.to_vec();
    reversed.reverse();
    Ok(Value::list(reversed))
}

fn length_of(expr: &Value) -> Result<Value, EvalError> {
    let list = expr.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "length expects list but instead got: {}.",
            expr.to_string_json()
        ))
    })?;
    Ok(Value::number(list.len() as f64))
}

fn nub_right(expr: &Value) -> Result<Value, EvalError> {
    let list = expr.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "nub_right expects list but instead got: {}.",
            expr.to_string_json()
        ))
    })?;
    if !expr.is_cacheable() {
        return Err(EvalError::new(format!(
            "Implicit comparison by passing name-containing value to nub_right: {}",
            expr.to_string_json()
        )));
    }
    if list.is_empty() {
        return Ok(expr.clone());
    }
    let mut seen = std::collections::HashSet::new();
    let mut reversed = Vec::with_capacity(list.len());
    for entry in list.iter().rev() {
        if seen.insert(entry.to_hash()) {
            reversed.push(entry.clone());
        }
    }
    reversed.reverse();
    Ok(Value::list(reversed))
}

fn parse_index(value: &Value) -> i64 {
    if let Some(n) = value.as_number() {
        return n.round() as i64;
    }
    if let Some(s) = value.as_str() {
        return leading_integer(s);
    }
    0
}

/// `atol` semantics: parse the leading optionally-signed digit run,
/// ignoring leading whitespace and trailing junk; 0 when absent.
fn leading_integer(s: &str) -> i64 {
    let trimmed = s.trim_start();
    let mut chars = trimmed.chars();
    let mut digits = String::new();
    let mut rest = trimmed;
    if let Some(c) = chars.next() {
        if c == '-' || c == '+' {
            digits.push(c);
            rest = chars.as_str();
        }
    }
    for c in rest.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            break;
        }
    }
    digits.parse().unwrap_or(0)
}

fn range_of(expr: &Value) -> Result<Value, EvalError> {
    let mut len: i64 = 0;
    if let Some(n) = expr.as_number() {
        if n > 0.0 {
            len = n.round() as i64;
        }
    }
    if let Some(s) = expr.as_str() {
        len = leading_integer(s);
    }
    let mut result = Vec::new();
    for i in 0..len.max(0) {
        result.push(Value::string(i.to_string()));
    }
    Ok(Value::list(result))
}

fn change_ending_to(name: &Value, ending: &Value) -> Result<Value, EvalError> {
    Ok(Value::string(path::change_ending(
        name.try_str()?,
        ending.try_str()?,
    )))
}

fn base_name(name: &Value) -> Result<Value, EvalError> {
    Ok(Value::string(path::basename(name.try_str()?)))
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

fn join(expr: &Value, separator: &str, quote: bool) -> Result<Value, EvalError> {
    if let Some(s) = expr.as_str() {
        let piece = if quote {
            shell_quote(s)
        } else {
            s.to_string()
        };
        return Ok(Value::string(piece));
    }
    if let Some(list) = expr.as_list() {
        let mut out = String::new();
        for (i, entry) in list.iter().enumerate() {
            if i > 0 {
                out.push_str(separator);
            }
            let piece = entry.try_str()?;
            if quote {
                out.push_str(&shell_quote(piece));
            } else {
                out.push_str(piece);
            }
        }
        return Ok(Value::string(out));
    }
    Err(EvalError::new(format!(
        "Join expects string or list but got: {}.",
        expr.to_string_json()
    )))
}

fn concat_target_name(expr: &Value, append: &Value) -> Result<Value, EvalError> {
    if let Some(s) = expr.as_str() {
        return Ok(Value::string(format!("{}{}", s, append.try_str()?)));
    }
    if let Some(list) = expr.as_list() {
        if list.iter().all(Value::is_string) {
            let last = list.len().saturating_sub(1);
            let mut result = Vec::with_capacity(list.len());
            for (i, entry) in list.iter().enumerate() {
                let piece = entry.try_str()?;
                if i == last {
                    result.push(Value::string(format!("{}{}", piece, append.try_str()?)));
                } else {
                    result.push(Value::string(piece));
                }
            }
            return Ok(Value::list(result));
        }
    }
    Err(EvalError::new(format!(
        "Unsupported expression for concat: {}.",
        expr.to_string_json()
    )))
}

/// Balanced binary union of a list of maps; rightmost binding wins.
/// With `disjoint`, a key bound to unequal values on both sides is
/// fatal (carrying both values as involved objects).
fn union(dicts: &[Value], from: usize, to: usize, disjoint: bool) -> Result<Value, EvalError> {
    if to <= from {
        return Ok(Value::empty_map());
    }
    if to == from + 1 {
        let entry = &dicts[from];
        if !entry.is_map() {
            return Err(EvalError::new(format!(
                "Map union list element is not a map: {}",
                entry.to_string_json()
            )));
        }
        return Ok(entry.clone());
    }
    let mid = from + (to - from) / 2;
    let left = union(dicts, from, mid, disjoint)?;
    let right = union(dicts, mid, to, disjoint)?;
    let left_map = left.try_map()?;
    let right_map = right.try_map()?;
    if left_map.is_empty() {
        return Ok(right);
    }
    if right_map.is_empty() {
        return Ok(left);
    }
    if disjoint {
        if let Some(key) = left_map.find_conflicting_duplicate(right_map) {
            let left_val = left.get_or(&key, Value::none());
            let right_val = right.get_or(&key, Value::none());
            return Err(EvalError::with_flags(
                format!(
                    "Map union not essentially disjoint as claimed, duplicate key {:?}; conflicting values:\n- {}\n- {}",
                    key,
                    left_val.to_abbrev_string(Evaluator::DEFAULT_LOG_LIMIT),
                    right_val.to_abbrev_string(Evaluator::DEFAULT_LOG_LIMIT)
                ),
                false,
                false,
                vec![left_val, right_val],
            ));
        }
    }
    Ok(Value::map(LinkedMap::link(
        left_map.clone(),
        right_map.clone(),
    )))
}

fn union_all(expr: &Value, disjoint: bool) -> Result<Value, EvalError> {
    let list = expr.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "Union expects list of maps but got: {}.",
            expr.to_string_json()
        ))
    })?;
    if list.is_empty() {
        return Ok(Value::empty_map());
    }
    union(list, 0, list.len(), disjoint)
}

// ---------------------------------------------------------------------------
// Operators that control evaluation
// ---------------------------------------------------------------------------

fn var_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let name = expr_at(expr, "name")?;
    let result = env.get(name.try_str()?);
    if result.is_none() {
        return eval(&expr.get_or("default", Value::none()), env);
    }
    Ok(result)
}

fn quote_expr(_eval: SubEval, expr: &Value, _env: &Configuration) -> Result<Value, EvalError> {
    Ok(expr.get_or("$1", Value::none()))
}

fn only_in_quasi_quote(
    _eval: SubEval,
    _expr: &Value,
    _env: &Configuration,
) -> Result<Value, EvalError> {
    Err(EvalError::new(
        r#""," and ",@" are only evaluated within quasi-quote ("`") environments."#,
    ))
}

/// Expand an entry of a quasi-quoted list; the result is the list of
/// values to splice in.
fn expand_quasi_quote_list_entry(
    eval: SubEval,
    expr: &Value,
    env: &Configuration,
) -> Result<Value, EvalError> {
    if let Some(list) = expr.as_list() {
        let mut result = Vec::new();
        for entry in list {
            let expanded = expand_quasi_quote_list_entry(eval, entry, env)?;
            result.extend(expanded.try_list()?.iter().cloned());
        }
        return Ok(Value::list(vec![Value::list(result)]));
    }
    if let Some(map) = expr.as_map() {
        if let Some(token) = map.find("type").and_then(Value::as_str) {
            if token == "," {
                let Some(arg) = map.find("$1") else {
                    return Ok(Value::list(vec![Value::none()]));
                };
                let result = eval(arg, env)?;
                return Ok(Value::list(vec![result]));
            }
            if token == ",@" {
                let Some(arg) = map.find("$1") else {
                    return Ok(Value::empty_list());
                };
                let result = eval(arg, env)?;
                if !result.is_list() {
                    return Err(EvalError::new(format!(
                        "Argument of \",@\"-expresion {} should evaluate to a list, but obtained {}",
                        expr.to_string_json(),
                        result.to_string_json()
                    )));
                }
                return Ok(result);
            }
        }
        let mut result = BTreeMap::new();
        for (key, value) in map.items() {
            result.insert(key.clone(), expand_quasi_quote(eval, value, env)?);
        }
        return Ok(Value::list(vec![Value::map_from(result)]));
    }
    Ok(Value::list(vec![expr.clone()]))
}

fn expand_quasi_quote(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    if let Some(list) = expr.as_list() {
        let mut result = Vec::new();
        for entry in list {
            let expanded = expand_quasi_quote_list_entry(eval, entry, env)?;
            result.extend(expanded.try_list()?.iter().cloned());
        }
        return Ok(Value::list(result));
    }
    if let Some(map) = expr.as_map() {
        if let Some(token) = map.find("type").and_then(Value::as_str) {
            if token == "," {
                let Some(arg) = map.find("$1") else {
                    return Ok(Value::none());
                };
                return eval(arg, env);
            }
            if token == ",@" {
                return Err(EvalError::new(format!(
                    "\",@\"-expression found in non-list context: {}",
                    expr.to_string_json()
                )));
            }
        }
        let mut result = BTreeMap::new();
        for (key, value) in map.items() {
            result.insert(key.clone(), expand_quasi_quote(eval, value, env)?);
        }
        return Ok(Value::map_from(result));
    }
    Ok(expr.clone())
}

fn quasi_quote_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    match expr.get("$1") {
        Some(to_expand) => expand_quasi_quote(eval, to_expand, env),
        None => Ok(Value::none()),
    }
}

fn if_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    if value_is_true(&eval_argument(expr, "cond", eval, env)?) {
        eval(&expr.get_or("then", Value::empty_list()), env)
    } else {
        eval(&expr.get_or("else", Value::empty_list()), env)
    }
}

fn cond_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    if let Some(cond) = expr.get("cond") {
        let pairs = cond.as_list().ok_or_else(|| {
            EvalError::new(format!(
                "cond in cond has to be a list of pairs, but found {}",
                cond.to_string_json()
            ))
        })?;
        for pair in pairs {
            let entry = pair.as_list().filter(|l| l.len() == 2).ok_or_else(|| {
                EvalError::new(format!(
                    "cond in cond has to be a list of pairs, but found entry {}",
                    pair.to_string_json()
                ))
            })?;
            if value_is_true(&eval(&entry[0], env)?) {
                return eval(&entry[1], env);
            }
        }
    }
    eval(&expr.get_or("default", Value::empty_list()), env)
}

fn case_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    if let Some(cases) = expr.get("case") {
        let case_map = cases.as_map().ok_or_else(|| {
            EvalError::new(format!(
                "case in case has to be a map of expressions, but found {}",
                cases.to_string_json()
            ))
        })?;
        let selector = expr
            .get("expr")
            .ok_or_else(|| EvalError::new("missing expr in case"))?;
        let key = eval(selector, env)?;
        let key_str = key.as_str().ok_or_else(|| {
            EvalError::new(format!(
                "expr in case must evaluate to string, but found {}",
                key.to_string_json()
            ))
        })?;
        if let Some(val) = case_map.find(key_str) {
            return eval(val, env);
        }
    }
    eval(&expr.get_or("default", Value::empty_list()), env)
}

fn seq_case_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    if let Some(cases) = expr.get("case") {
        let pairs = cases.as_list().ok_or_else(|| {
            EvalError::new(format!(
                "case in case* has to be a list of pairs, but found {}",
                cases.to_string_json()
            ))
        })?;
        let selector = expr
            .get("expr")
            .ok_or_else(|| EvalError::new("missing expr in case"))?;
        let cmp = eval(selector, env)?;
        if !cmp.is_cacheable() {
            return Err(EvalError::new(format!(
                "Comparison of name-containing values: {}",
                cmp.to_string_json()
            )));
        }
        for pair in pairs {
            let entry = pair.as_list().filter(|l| l.len() == 2).ok_or_else(|| {
                EvalError::new(format!(
                    "case in case* has to be a list of pairs, but found entry {}",
                    pair.to_string_json()
                ))
            })?;
            if cmp == eval(&entry[0], env)? {
                return eval(&entry[1], env);
            }
        }
    }
    eval(&expr.get_or("default", Value::empty_list()), env)
}

fn equal_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let a = eval_argument(expr, "$1", eval, env)?;
    if !a.is_cacheable() {
        return Err(EvalError::new(format!(
            "Comparison of name-containing values; first argument is {}",
            a.to_string_json()
        )));
    }
    let b = eval_argument(expr, "$2", eval, env)?;
    if !b.is_cacheable() {
        return Err(EvalError::new(format!(
            "Comparison of name-containing values; second argument is {}",
            b.to_string_json()
        )));
    }
    Ok(Value::bool(a == b))
}

fn and_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    // short-circuit only applies to a literal list argument
    if let Some(conds) = expr.get("$1") {
        if let Some(list) = conds.as_list() {
            for entry in list {
                if !value_is_true(&eval(entry, env)?) {
                    return Ok(Value::bool(false));
                }
            }
            return Ok(Value::bool(true));
        }
        let evaluated = eval_argument(expr, "$1", eval, env)?;
        return all_true(&evaluated).map_err(|err| {
            EvalError::while_eval(
                format!(
                    "Having evaluated the argument to {}:",
                    evaluated.to_abbrev_string(Evaluator::DEFAULT_LOG_LIMIT)
                ),
                err,
            )
        });
    }
    Ok(Value::bool(true))
}

fn or_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    if let Some(conds) = expr.get("$1") {
        if let Some(list) = conds.as_list() {
            for entry in list {
                if value_is_true(&eval(entry, env)?) {
                    return Ok(Value::bool(true));
                }
            }
            return Ok(Value::bool(false));
        }
        let evaluated = eval_argument(expr, "$1", eval, env)?;
        return any_true(&evaluated).map_err(|err| {
            EvalError::while_eval(
                format!(
                    "Having evaluated the argument to {}:",
                    evaluated.to_abbrev_string(Evaluator::DEFAULT_LOG_LIMIT)
                ),
                err,
            )
        });
    }
    Ok(Value::bool(false))
}

fn fail_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let msg = eval(&expr.get_or("msg", Value::none()), env)?;
    Err(EvalError::user(msg.to_string_json()))
}

fn assert_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let val = eval(expr_at(expr, "$1")?, env)?;
    let var = expr.get_or("var", Value::string("_"));
    let inner_env = env.update(var.try_str()?, val.clone());
    let predicate = eval(expr_at(expr, "predicate")?, &inner_env)?;
    if value_is_true(&predicate) {
        return Ok(val);
    }
    let msg_expr = expr.get_or("msg", Value::none());
    let msg = eval(&msg_expr, &inner_env)
        .map(|v| v.to_string_json())
        .unwrap_or_else(|_| format!("[non evaluating term] {}", msg_expr.to_string_json()));
    Err(EvalError::user(msg))
}

fn assert_non_empty_expr(
    eval: SubEval,
    expr: &Value,
    env: &Configuration,
) -> Result<Value, EvalError> {
    let val = eval(expr_at(expr, "$1")?, env)?;
    let non_empty = val.as_str().map(|s| !s.is_empty()).unwrap_or(false)
        || val.as_list().map(|l| !l.is_empty()).unwrap_or(false)
        || val.as_map().map(|m| !m.is_empty()).unwrap_or(false);
    if non_empty {
        return Ok(val);
    }
    let msg_expr = expr.get_or("msg", Value::none());
    let msg = eval(&msg_expr, env)
        .map(|v| v.to_string_json())
        .unwrap_or_else(|_| format!("[non evaluating term] {}", msg_expr.to_string_json()));
    Err(EvalError::user(format!(
        "{}\nExpected non-empty value but found: {}",
        msg,
        val.to_string_json()
    )))
}

fn context_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    match eval(&expr.get_or("$1", Value::none()), env) {
        Ok(value) => Ok(value),
        Err(err) => {
            let msg_expr = expr.get_or("msg", Value::empty_map());
            let context = eval(&msg_expr, env)
                .map(|v| v.to_string_json())
                .unwrap_or_else(|_| {
                    format!("[non evaluating term] {}", msg_expr.to_string_json())
                });
            let objects = err.involved_objects().to_vec();
            Err(EvalError::with_flags(
                format!("In Context {}\n{}", context, err.message()),
                true,
                true,
                objects,
            ))
        }
    }
}

fn change_ending_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let name = eval(&expr.get_or("$1", Value::string("")), env)?;
    let ending = eval(&expr.get_or("ending", Value::string("")), env)?;
    change_ending_to(&name, &ending)
}

fn join_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let list = eval(&expr.get_or("$1", Value::empty_list()), env)?;
    let separator = eval(&expr.get_or("separator", Value::string("")), env)?;
    join(&list, separator.try_str()?, false)
}

fn join_cmd_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let list = eval(&expr.get_or("$1", Value::empty_list()), env)?;
    join(&list, " ", true)
}

fn json_encode_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let value = eval(&expr.get_or("$1", Value::empty_list()), env)?;
    Ok(Value::string(
        value.to_json(JsonMode::NullForNonJson).to_string(),
    ))
}

fn escape_chars_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let string = eval(&expr.get_or("$1", Value::string("")), env)?;
    let chars = eval(&expr.get_or("chars", Value::string("")), env)?;
    let escape_prefix = eval(&expr.get_or("escape_prefix", Value::string("\\")), env)?;
    let mut out = String::new();
    for c in string.try_str()?.chars() {
        if chars.try_str()?.contains(c) {
            out.push_str(escape_prefix.try_str()?);
        }
        out.push(c);
    }
    Ok(Value::string(out))
}

fn lookup_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let key = eval(expr_at(expr, "key")?, env)?;
    let map = eval(expr_at(expr, "map")?, env)?;
    let key_str = key.as_str().ok_or_else(|| {
        EvalError::new(format!(
            "Key expected to be string but found {}.",
            key.to_string_json()
        ))
    })?;
    if !map.is_map() {
        return Err(EvalError::new(format!(
            "Map expected to be mapping but found {}.",
            map.to_string_json()
        )));
    }
    let mut lookup = map.get_or(key_str, Value::none());
    if lookup.is_none() {
        lookup = eval(&expr.get_or("default", Value::none()), env)?;
    }
    Ok(lookup)
}

fn array_access_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let index_val = eval(expr_at(expr, "index")?, env)?;
    let list_val = eval(expr_at(expr, "list")?, env)?;
    let list = list_val.as_list().ok_or_else(|| {
        EvalError::new(format!(
            "List expected to be list, but found {}.",
            list_val.to_string_json()
        ))
    })?;
    let len = list.len() as i64;
    let index = parse_index(&index_val);
    if 0 <= index && index < len {
        return Ok(list[index as usize].clone());
    }
    if index < 0 && len + index >= 0 {
        return Ok(list[(len + index) as usize].clone());
    }
    eval(&expr.get_or("default", Value::none()), env)
}

fn empty_map_expr(_eval: SubEval, _expr: &Value, _env: &Configuration) -> Result<Value, EvalError> {
    Ok(Value::empty_map())
}

fn singleton_map_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let key = eval_argument(expr, "key", eval, env)?;
    let value = eval_argument(expr, "value", eval, env)?;
    Ok(Value::map(LinkedMap::singleton(key.try_str()?, value)))
}

fn disjoint_union_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let argument = eval_argument(expr, "$1", eval, env)?;
    if !argument.is_cacheable() {
        return Err(EvalError::new(format!(
            "Argument to disjoint_map_union is name-containing: {}",
            argument.to_string_json()
        )));
    }
    match union_all(&argument, true) {
        Ok(value) => Ok(value),
        Err(err) => match eval_msg(expr, eval, env) {
            None => Err(EvalError::while_eval(
                format!(
                    "Having evaluated the argument to {}:",
                    argument.to_abbrev_string(Evaluator::DEFAULT_LOG_LIMIT)
                ),
                err,
            )),
            Some(msg) => {
                let objects = err.involved_objects().to_vec();
                Err(EvalError::with_flags(
                    format!(
                        "{}\nUnderlying {}\nThe argument of the union was {}",
                        msg,
                        err.message(),
                        argument.to_abbrev_string(Evaluator::DEFAULT_LOG_LIMIT)
                    ),
                    false,
                    true,
                    objects,
                ))
            }
        },
    }
}

fn to_subdir_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let map_val = eval(expr_at(expr, "$1")?, env)?;
    let subdir_val = eval(&expr.get_or("subdir", Value::string(".")), env)?;
    let flat = value_is_true(&eval(&expr.get_or("flat", Value::bool(false)), env)?);
    let subdir = subdir_val.try_str()?;
    let map = map_val.try_map()?;
    let mut result: BTreeMap<String, Value> = BTreeMap::new();
    for (key, value) in map.items() {
        let new_key = if flat {
            path::normalize(&format!("{}/{}", subdir, path::basename(key)))
        } else {
            path::normalize(&format!("{}/{}", subdir, key))
        };
        if let Some(existing) = result.get(&new_key) {
            if !(existing == value && value.is_cacheable()) {
                let reason = if flat {
                    format!(
                        "flat staging to subdir {} conflicts on path {}",
                        subdir, new_key
                    )
                } else {
                    format!("staging to subdir {} conflicts on new path {}", subdir, new_key)
                };
                return match eval_msg(expr, eval, env) {
                    None => Err(EvalError::new(format!(
                        "{} of {} to subdir {} conflicts on path {}",
                        if flat { "Flat staging" } else { "Staging" },
                        map_val.to_string_json(),
                        subdir,
                        new_key
                    ))),
                    Some(msg) => Err(EvalError::with_flags(
                        format!(
                            "{}\nReason: {}\nMap to {}stage was {}",
                            msg,
                            reason,
                            if flat { "flatly " } else { "" },
                            map_val.to_string_json()
                        ),
                        false,
                        true,
                        Vec::new(),
                    )),
                };
            }
        }
        result.insert(new_key, value.clone());
    }
    Ok(Value::map_from(result))
}

fn from_subdir_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let map_val = eval(expr_at(expr, "$1")?, env)?;
    let subdir_val = eval(&expr.get_or("subdir", Value::string(".")), env)?;
    let subdir = subdir_val.try_str()?;
    let map = map_val.try_map()?;
    let mut result: BTreeMap<String, Value> = BTreeMap::new();
    for (key, value) in map.items() {
        let new_path = path::normalize(&path::relative_to(key, subdir));
        if path::is_non_upwards(&new_path) {
            if let Some(existing) = result.get(&new_path) {
                if !(existing == value && value.is_cacheable()) {
                    return Err(EvalError::new(format!(
                        "Staging conflict for path {:?}",
                        new_path
                    )));
                }
            }
            result.insert(new_path, value.clone());
        }
    }
    Ok(Value::map_from(result))
}

fn foreach_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let range = eval(&expr.get_or("range", Value::empty_list()), env)?;
    let range_list = range.try_list()?;
    if range_list.is_empty() {
        return Ok(Value::empty_list());
    }
    let var = expr.get_or("var", Value::string("_"));
    let body = expr.get_or("body", Value::empty_list());
    let mut result = Vec::with_capacity(range_list.len());
    for item in range_list {
        result.push(eval(&body, &env.update(var.try_str()?, item.clone()))?);
    }
    Ok(Value::list(result))
}

fn foreach_map_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let range = eval(&expr.get_or("range", Value::empty_map_expr()), env)?;
    let range_map = range.try_map()?;
    if range_map.is_empty() {
        return Ok(Value::empty_list());
    }
    let var_key = expr.get_or("var_key", Value::string("_"));
    let var_val = expr.get_or("var_val", Value::string("$_"));
    let body = expr.get_or("body", Value::empty_list());
    let mut result = Vec::with_capacity(range_map.size());
    for (key, value) in range_map.items() {
        let inner_env = env
            .update(var_key.try_str()?, Value::string(key.clone()))
            .update(var_val.try_str()?, value.clone());
        result.push(eval(&body, &inner_env)?);
    }
    Ok(Value::list(result))
}

fn foldl_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let var = expr.get_or("var", Value::string("_"));
    let accum_var = expr.get_or("accum_var", Value::string("$1"));
    let range = eval(expr_at(expr, "range")?, env)?;
    let mut val = eval(&expr.get_or("start", Value::empty_list()), env)?;
    let body = expr.get_or("body", Value::empty_list());
    for item in range.try_list()? {
        let inner_env = env
            .update(var.try_str()?, item.clone())
            .update(accum_var.try_str()?, val);
        val = eval(&body, &inner_env)?;
    }
    Ok(val)
}

fn let_expr(eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    let mut new_env = env.clone();
    if let Some(bindings) = expr.get("bindings") {
        let binding_list = bindings.as_list().ok_or_else(|| {
            EvalError::new(format!(
                "bindings in let* has to be a list of pairs, but found {}",
                bindings.to_string_json()
            ))
        })?;
        for (pos, binding) in binding_list.iter().enumerate() {
            let pair = binding.as_list().filter(|l| l.len() == 2).ok_or_else(|| {
                EvalError::new(format!(
                    "bindings in let* has to be a list of pairs, but found entry {}",
                    binding.to_string_json()
                ))
            })?;
            let name = pair[0].as_str().ok_or_else(|| {
                EvalError::new(format!(
                    "variable names in let* have to be strings, but found binding entry {}",
                    binding.to_string_json()
                ))
            })?;
            let val = eval(&pair[1], &new_env).map_err(|err| {
                EvalError::while_eval(
                    format!(
                        "Evaluating entry {} in bindings, binding {:?}:",
                        pos, name
                    ),
                    err,
                )
            })?;
            new_env = new_env.update(name, val);
        }
    }
    let body = expr.get_or("body", Value::empty_map());
    eval(&body, &new_env)
        .map_err(|err| EvalError::while_eval("Evaluating the body:", err))
}

fn env_expr(_eval: SubEval, expr: &Value, env: &Configuration) -> Result<Value, EvalError> {
    if let Some(vars) = expr.get("vars") {
        let var_list = vars.as_list().ok_or_else(|| {
            EvalError::new(format!(
                "vars in env has to be a list of strings, but found {}",
                vars.to_string_json()
            ))
        })?;
        let mut names = Vec::with_capacity(var_list.len());
        for var in var_list {
            names.push(var.as_str().ok_or_else(|| {
                EvalError::new(format!(
                    "vars in env has to be a list of strings, but found entry {}",
                    var.to_string_json()
                ))
            })?);
        }
        return Ok(env.prune(names).expr().clone());
    }
    Ok(Value::empty_map())
}

fn concat_target_name_expr(
    eval: SubEval,
    expr: &Value,
    env: &Configuration,
) -> Result<Value, EvalError> {
    let p1 = eval(&expr.get_or("$1", Value::string("")), env)?;
    let p2 = eval(&expr.get_or("$2", Value::string("")), env)?;
    concat_target_name(&p1, &join(&p2, "", false)?)
}

static BUILTINS: Lazy<FunctionMap> = Lazy::new(|| {
    FunctionMap::from_entries(vec![
        ("var", Arc::new(var_expr) as EvalFunction),
        ("'", Arc::new(quote_expr)),
        ("`", Arc::new(quasi_quote_expr)),
        (",", Arc::new(only_in_quasi_quote)),
        (",@", Arc::new(only_in_quasi_quote)),
        ("if", Arc::new(if_expr)),
        ("cond", Arc::new(cond_expr)),
        ("case", Arc::new(case_expr)),
        ("case*", Arc::new(seq_case_expr)),
        ("fail", Arc::new(fail_expr)),
        ("assert", Arc::new(assert_expr)),
        ("assert_non_empty", Arc::new(assert_non_empty_expr)),
        ("context", Arc::new(context_expr)),
        ("==", Arc::new(equal_expr)),
        ("and", Arc::new(and_expr)),
        ("or", Arc::new(or_expr)),
        ("not", unary(negate)),
        ("++", unary(flatten)),
        ("+", unary(addition)),
        ("*", unary(multiplication)),
        ("nub_right", unary(nub_right)),
        ("range", unary(range_of)),
        ("change_ending", Arc::new(change_ending_expr)),
        ("basename", unary(base_name)),
        ("join", Arc::new(join_expr)),
        ("join_cmd", Arc::new(join_cmd_expr)),
        ("json_encode", Arc::new(json_encode_expr)),
        ("escape_chars", Arc::new(escape_chars_expr)),
        ("keys", unary(keys_of)),
        ("enumerate", unary(enumerate_list)),
        ("set", unary(set_of)),
        ("reverse", unary(reverse_list)),
        ("length", unary(length_of)),
        ("values", unary(values_of)),
        ("lookup", Arc::new(lookup_expr)),
        ("[]", Arc::new(array_access_expr)),
        ("empty_map", Arc::new(empty_map_expr)),
        ("singleton_map", Arc::new(singleton_map_expr)),
        ("disjoint_map_union", Arc::new(disjoint_union_expr)),
        ("map_union", unary(|expr| union_all(expr, false))),
        ("to_subdir", Arc::new(to_subdir_expr)),
        ("from_subdir", Arc::new(from_subdir_expr)),
        ("foreach", Arc::new(foreach_expr)),
        ("foreach_map", Arc::new(foreach_map_expr)),
        ("foldl", Arc::new(foldl_expr)),
        ("let*", Arc::new(let_expr)),
        ("env", Arc::new(env_expr)),
        ("concat_target_name", Arc::new(concat_target_name_expr)),
    ])
});

/// The built-in operator catalog.
pub fn builtins() -> &'static FunctionMap {
    &BUILTINS
}
