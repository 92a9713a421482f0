//! User-defined expression functions
//!
//! A callable from a rule or expression file: a free-variable list, an
//! import map to other callables, and a body. Invocation prunes the
//! caller's environment to the free variables and overlays a
//! `CALL_EXPRESSION` dispatcher resolving the imports.

use crate::configuration::Configuration;
use crate::evaluator::{EvalError, Evaluator};
use crate::function_map::{EvalFunction, FunctionMap};
use crate::value::Value;
use once_cell::sync::Lazy;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub type ExpressionFunctionPtr = Arc<ExpressionFunction>;

pub struct ExpressionFunction {
    vars: Vec<String>,
    imports: HashMap<String, ExpressionFunctionPtr>,
    expr: Value,
}

static EMPTY_TRANSITION: Lazy<ExpressionFunctionPtr> = Lazy::new(|| {
    ExpressionFunction::new(
        Vec::new(),
        HashMap::new(),
        Value::from_json(&json!([{"type": "empty_map"}])),
    )
});

impl ExpressionFunction {
    pub fn new(
        vars: Vec<String>,
        imports: HashMap<String, ExpressionFunctionPtr>,
        expr: Value,
    ) -> ExpressionFunctionPtr {
        Arc::new(Self {
            vars,
            imports,
            expr,
        })
    }

    /// The identity transition: evaluates to the singleton list of the
    /// empty map.
    pub fn empty_transition() -> ExpressionFunctionPtr {
        EMPTY_TRANSITION.clone()
    }

    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    /// Evaluate the body under the pruned environment with the imports
    /// reachable via `CALL_EXPRESSION`. Failures go to `logger`; the
    /// return is `None` on failure.
    pub fn evaluate(
        &self,
        evaluator: &Evaluator,
        env: &Configuration,
        functions: &FunctionMap,
        logger: &dyn Fn(&str),
        annotate_object: Option<&dyn Fn(&Value) -> String>,
        note_user_context: Option<&dyn Fn()>,
    ) -> Option<Value> {
        let imports = self.imports.clone();
        let callee_functions = functions.clone();
        let callee_evaluator = *evaluator;
        let imports_caller: EvalFunction = Arc::new(move |_eval, expr, env| {
            let name_expr = expr.get("name").ok_or_else(|| {
                EvalError::new("Map does not contain key 'name'.")
            })?;
            let name = name_expr.try_str()?;
            let Some(callee) = imports.get(name) else {
                return Err(EvalError::new(format!("Unknown expression '{}'.", name)));
            };
            let buffer = Mutex::new(String::new());
            let user_context = AtomicBool::new(false);
            let result = callee.evaluate(
                &callee_evaluator,
                env,
                &callee_functions,
                &|msg| {
                    if let Ok(mut b) = buffer.lock() {
                        b.push_str(msg);
                    }
                },
                None,
                Some(&|| user_context.store(true, Ordering::Relaxed)),
            );
            match result {
                Some(value) => Ok(value),
                None => {
                    let msg = buffer.lock().map(|b| b.clone()).unwrap_or_default();
                    if user_context.load(Ordering::Relaxed) {
                        Err(EvalError::with_flags(msg, true, true, Vec::new()))
                    } else {
                        Err(EvalError::with_flags(
                            format!(
                                "This call to {} failed in the following way:\n{}",
                                name_expr.to_string_json(),
                                msg
                            ),
                            true,
                            false,
                            Vec::new(),
                        ))
                    }
                }
            }
        });
        let new_env = env.prune(&self.vars);
        let overlaid = FunctionMap::link(functions, vec![("CALL_EXPRESSION", imports_caller)]);
        evaluator.evaluate_expression(
            &self.expr,
            &new_env,
            &overlaid,
            logger,
            annotate_object,
            note_user_context,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_fn(function: &ExpressionFunction, env: &Configuration) -> Option<Value> {
        let errors = Mutex::new(Vec::new());
        let result = function.evaluate(
            &Evaluator::default(),
            env,
            &FunctionMap::empty(),
            &|msg| {
                if let Ok(mut e) = errors.lock() {
                    e.push(msg.to_string());
                }
            },
            None,
            None,
        );
        result
    }

    #[test]
    fn test_empty_transition() {
        let transition = ExpressionFunction::empty_transition();
        let result = eval_fn(&transition, &Configuration::default()).expect("evaluates");
        assert_eq!(result, Value::from_json(&json!([{}])));
    }

    #[test]
    fn test_environment_pruned_to_vars() {
        let function = ExpressionFunction::new(
            vec!["KEPT".to_string()],
            HashMap::new(),
            Value::from_json(&json!({
                "type": "env",
                "vars": ["KEPT", "DROPPED"],
            })),
        );
        let env = Configuration::from_json(&json!({"KEPT": "yes", "DROPPED": "gone"}));
        let result = eval_fn(&function, &env).expect("evaluates");
        assert_eq!(result, Value::from_json(&json!({"KEPT": "yes", "DROPPED": null})));
    }

    #[test]
    fn test_imports_called_by_name() {
        let callee = ExpressionFunction::new(
            Vec::new(),
            HashMap::new(),
            Value::from_json(&json!("forty-two")),
        );
        let caller = ExpressionFunction::new(
            Vec::new(),
            HashMap::from([("answer".to_string(), callee)]),
            Value::from_json(&json!({"type": "CALL_EXPRESSION", "name": "answer"})),
        );
        let result = eval_fn(&caller, &Configuration::default()).expect("evaluates");
        assert_eq!(result, Value::string("forty-two"));
    }

    #[test]
    fn test_unknown_import_fails() {
        let caller = ExpressionFunction::new(
            Vec::new(),
            HashMap::new(),
            Value::from_json(&json!({"type": "CALL_EXPRESSION", "name": "missing"})),
        );
        assert!(eval_fn(&caller, &Configuration::default()).is_none());
    }
}
