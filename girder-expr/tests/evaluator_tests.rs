//! Evaluator scenario tests covering the operator catalog.

use girder_expr::{Configuration, EvalError, Evaluator, FunctionMap, Value};
use serde_json::{json, Value as Json};
use std::sync::Mutex;

fn eval_in(env: &Json, expr: &Json) -> Result<Value, EvalError> {
    let evaluator = Evaluator::default();
    let functions = FunctionMap::chain(girder_expr::builtins(), &FunctionMap::empty());
    evaluator.evaluate(
        &Value::from_json(expr),
        &Configuration::from_json(env),
        &functions,
    )
}

fn eval(expr: &Json) -> Result<Value, EvalError> {
    eval_in(&json!({}), expr)
}

fn expect(expr: &Json, expected: &Json) {
    let result = eval(expr).expect("evaluation should succeed");
    assert_eq!(result.to_json_all(), *expected, "for {}", expr);
}

fn expect_in(env: &Json, expr: &Json, expected: &Json) {
    let result = eval_in(env, expr).expect("evaluation should succeed");
    assert_eq!(result.to_json_all(), *expected, "for {}", expr);
}

#[test]
fn test_self_evaluating() {
    expect(&json!(null), &json!(null));
    expect(&json!(true), &json!(true));
    expect(&json!(6.5), &json!(6.5));
    expect(&json!("str"), &json!("str"));
    expect(&json!([1.0, "two"]), &json!([1.0, "two"]));
}

#[test]
fn test_map_requires_type() {
    assert!(eval(&json!({"key": "value"})).is_err());
    assert!(eval(&json!({"type": "no_such_operator"})).is_err());
}

#[test]
fn test_var_and_default() {
    expect_in(&json!({"x": "bound"}), &json!({"type": "var", "name": "x"}), &json!("bound"));
    expect(
        &json!({"type": "var", "name": "x", "default": "fallback"}),
        &json!("fallback"),
    );
    expect(&json!({"type": "var", "name": "x"}), &json!(null));
}

#[test]
fn test_quote_identity() {
    expect(
        &json!({"type": "'", "$1": {"type": "if", "cond": true}}),
        &json!({"type": "if", "cond": true}),
    );
    expect(&json!({"type": "'"}), &json!(null));
}

#[test]
fn test_quasi_quote_without_splices_equals_quote() {
    let literal = json!([1.0, {"a": ["b"]}, "c"]);
    expect(&json!({"type": "`", "$1": literal}), &literal);
}

#[test]
fn test_quasi_quote_single_splice() {
    expect_in(
        &json!({"x": "val"}),
        &json!({"type": "`", "$1": [1.0, {"type": ",", "$1": {"type": "var", "name": "x"}}]}),
        &json!([1.0, "val"]),
    );
}

#[test]
fn test_quasi_quote_list_splice() {
    // `[1, 2, ,@xs] with xs bound to [3, 4]
    expect_in(
        &json!({"xs": [3.0, 4.0]}),
        &json!({"type": "`", "$1": [1.0, 2.0, {"type": ",@", "$1": {"type": "var", "name": "xs"}}]}),
        &json!([1.0, 2.0, 3.0, 4.0]),
    );
}

#[test]
fn test_splice_outside_quasi_quote_is_fatal() {
    assert!(eval(&json!({"type": ",", "$1": 1.0})).is_err());
    assert!(eval(&json!({"type": ",@", "$1": []})).is_err());
}

#[test]
fn test_list_splice_outside_list_context_is_fatal() {
    let expr = json!({"type": "`", "$1": {"a": {"type": ",@", "$1": []}}});
    assert!(eval(&expr).is_err());
}

#[test]
fn test_if_branches() {
    expect(
        &json!({"type": "if", "cond": true, "then": "t", "else": "e"}),
        &json!("t"),
    );
    expect(
        &json!({"type": "if", "cond": [], "then": "t", "else": "e"}),
        &json!("e"),
    );
    // defaults are empty lists
    expect(&json!({"type": "if", "cond": false}), &json!([]));
}

#[test]
fn test_cond_first_truthy() {
    expect(
        &json!({"type": "cond", "cond": [[false, "a"], [true, "b"], [true, "c"]], "default": "d"}),
        &json!("b"),
    );
    expect(
        &json!({"type": "cond", "cond": [[false, "a"]], "default": "d"}),
        &json!("d"),
    );
}

#[test]
fn test_case_lookup_and_default() {
    expect(
        &json!({"type": "case", "expr": "b", "case": {"a": 1.0, "b": 2.0}, "default": 9.0}),
        &json!(2.0),
    );
    expect(
        &json!({"type": "case", "expr": "z", "case": {"a": 1.0}, "default": 9.0}),
        &json!(9.0),
    );
}

#[test]
fn test_seq_case_value_equality() {
    expect(
        &json!({"type": "case*", "expr": [1.0, 2.0], "case": [[[], "no"], [[1.0, 2.0], "yes"]]}),
        &json!("yes"),
    );
}

#[test]
fn test_equality_and_truth() {
    expect(&json!({"type": "==", "$1": [1.0], "$2": [1.0]}), &json!(true));
    expect(&json!({"type": "==", "$1": "a", "$2": "b"}), &json!(false));
    expect(&json!({"type": "not", "$1": []}), &json!(true));
    expect(&json!({"type": "not", "$1": "x"}), &json!(false));
}

#[test]
fn test_and_or_short_circuit_on_literal_list() {
    // the failing entry after the decisive one is never evaluated
    expect(
        &json!({"type": "and", "$1": [false, {"type": "fail", "msg": "boom"}]}),
        &json!(false),
    );
    expect(
        &json!({"type": "or", "$1": [true, {"type": "fail", "msg": "boom"}]}),
        &json!(true),
    );
    expect(&json!({"type": "and"}), &json!(true));
    expect(&json!({"type": "or"}), &json!(false));
}

#[test]
fn test_and_computed_argument_loses_short_circuit() {
    // a computed argument is evaluated to a list and inspected whole
    expect_in(
        &json!({"xs": [true, false]}),
        &json!({"type": "and", "$1": {"type": "var", "name": "xs"}}),
        &json!(false),
    );
    expect_in(
        &json!({"xs": [false, true]}),
        &json!({"type": "or", "$1": {"type": "var", "name": "xs"}}),
        &json!(true),
    );
}

#[test]
fn test_arithmetic() {
    expect(&json!({"type": "+", "$1": [1.0, 2.0, 3.0]}), &json!(6.0));
    expect(&json!({"type": "+", "$1": []}), &json!(0.0));
    expect(&json!({"type": "*", "$1": [2.0, 3.0]}), &json!(6.0));
    expect(&json!({"type": "*", "$1": []}), &json!(1.0));
    assert!(eval(&json!({"type": "+", "$1": ["nan"]})).is_err());
}

#[test]
fn test_flatten_one_level() {
    expect(
        &json!({"type": "++", "$1": [["a", "b"], ["c"]]}),
        &json!(["a", "b", "c"]),
    );
    assert!(eval(&json!({"type": "++", "$1": ["flat"]})).is_err());
}

#[test]
fn test_list_operators() {
    expect(&json!({"type": "length", "$1": ["a", "b"]}), &json!(2.0));
    expect(&json!({"type": "reverse", "$1": [1.0, 2.0]}), &json!([2.0, 1.0]));
    expect(&json!({"type": "range", "$1": 3.0}), &json!(["0", "1", "2"]));
    expect(&json!({"type": "range", "$1": "2"}), &json!(["0", "1"]));
    expect(
        &json!({"type": "enumerate", "$1": ["x", "y"]}),
        &json!({"0000000000": "x", "0000000001": "y"}),
    );
    expect(
        &json!({"type": "set", "$1": ["a", "b"]}),
        &json!({"a": true, "b": true}),
    );
}

#[test]
fn test_nub_right_keeps_rightmost() {
    expect(
        &json!({"type": "nub_right", "$1": ["a", "b", "a"]}),
        &json!(["b", "a"]),
    );
}

#[test]
fn test_keys_values_lookup() {
    expect(
        &json!({"type": "keys", "$1": {"type": "'", "$1": {"b": 1.0, "a": 2.0}}}),
        &json!(["a", "b"]),
    );
    expect(
        &json!({"type": "values", "$1": {"type": "'", "$1": {"b": 1.0, "a": 2.0}}}),
        &json!([2.0, 1.0]),
    );
    expect(
        &json!({"type": "lookup", "key": "a", "map": {"type": "'", "$1": {"a": 1.0}}}),
        &json!(1.0),
    );
    expect(
        &json!({"type": "lookup", "key": "z", "map": {"type": "empty_map"}, "default": 7.0}),
        &json!(7.0),
    );
}

#[test]
fn test_array_access() {
    let list = json!({"type": "'", "$1": ["a", "b", "c"]});
    expect(&json!({"type": "[]", "index": 1.0, "list": list}), &json!("b"));
    expect(&json!({"type": "[]", "index": "-1", "list": list}), &json!("c"));
    expect(
        &json!({"type": "[]", "index": 9.0, "list": list, "default": "out"}),
        &json!("out"),
    );
}

#[test]
fn test_map_union_and_disjoint() {
    expect(
        &json!({"type": "map_union", "$1": {"type": "'", "$1": [{"a": 1.0, "b": 2.0}, {"b": 3.0}]}}),
        &json!({"a": 1.0, "b": 3.0}),
    );
    expect(
        &json!({"type": "disjoint_map_union", "$1": {"type": "'", "$1": [{"a": 1.0}, {"b": 2.0}]}}),
        &json!({"a": 1.0, "b": 2.0}),
    );
    assert!(eval(
        &json!({"type": "disjoint_map_union", "$1": {"type": "'", "$1": [{"a": 1.0}, {"a": 2.0}]}})
    )
    .is_err());
    // identical values are not conflicts
    expect(
        &json!({"type": "disjoint_map_union", "$1": {"type": "'", "$1": [{"a": 1.0}, {"a": 1.0}]}}),
        &json!({"a": 1.0}),
    );
}

#[test]
fn test_empty_and_singleton_map() {
    expect(&json!({"type": "empty_map"}), &json!({}));
    expect(
        &json!({"type": "singleton_map", "key": "k", "value": 1.0}),
        &json!({"k": 1.0}),
    );
}

#[test]
fn test_to_subdir() {
    expect(
        &json!({"type": "to_subdir", "subdir": "sub", "$1": {"type": "'", "$1": {"a": 1.0, "d/b": 2.0}}}),
        &json!({"sub/a": 1.0, "sub/d/b": 2.0}),
    );
    expect(
        &json!({"type": "to_subdir", "subdir": "sub", "flat": true, "$1": {"type": "'", "$1": {"d/b": 2.0}}}),
        &json!({"sub/b": 2.0}),
    );
    // flat staging collision on distinct values is fatal
    assert!(eval(
        &json!({"type": "to_subdir", "subdir": "s", "flat": true,
                "$1": {"type": "'", "$1": {"x/f": 1.0, "y/f": 2.0}}})
    )
    .is_err());
}

#[test]
fn test_from_subdir() {
    expect(
        &json!({"type": "from_subdir", "subdir": "sub", "$1": {"type": "'", "$1": {"sub/a/b": 1.0, "other/c": 2.0}}}),
        &json!({"a/b": 1.0}),
    );
}

#[test]
fn test_strings() {
    expect(
        &json!({"type": "join", "separator": ",", "$1": {"type": "'", "$1": ["a", "b"]}}),
        &json!("a,b"),
    );
    expect(
        &json!({"type": "join_cmd", "$1": {"type": "'", "$1": ["echo", "a b"]}}),
        &json!("'echo' 'a b'"),
    );
    expect(
        &json!({"type": "json_encode", "$1": {"type": "'", "$1": {"a": [1.0]}}}),
        &json!("{\"a\":[1.0]}"),
    );
    expect(
        &json!({"type": "escape_chars", "$1": "a\"b", "chars": "\"", "escape_prefix": "\\"}),
        &json!("a\\\"b"),
    );
    expect(
        &json!({"type": "change_ending", "$1": "dir/file.c", "ending": ".o"}),
        &json!("dir/file.o"),
    );
    expect(&json!({"type": "basename", "$1": "dir/file.c"}), &json!("file.c"));
    expect(
        &json!({"type": "concat_target_name", "$1": "lib", "$2": "-static"}),
        &json!("lib-static"),
    );
}

#[test]
fn test_foreach() {
    expect(
        &json!({"type": "foreach", "var": "x", "range": {"type": "'", "$1": [1.0, 2.0]},
                "body": {"type": "var", "name": "x"}}),
        &json!([1.0, 2.0]),
    );
}

#[test]
fn test_foreach_map_sorted() {
    expect(
        &json!({"type": "foreach_map", "var_key": "k", "var_val": "v",
                "range": {"type": "'", "$1": {"b": 2.0, "a": 1.0}},
                "body": {"type": "var", "name": "k"}}),
        &json!(["a", "b"]),
    );
}

#[test]
fn test_foldl_concatenation() {
    // foldl with list concat: start ++ range
    expect(
        &json!({"type": "foldl", "var": "x", "accum_var": "acc",
                "range": {"type": "'", "$1": ["c", "d"]},
                "start": {"type": "'", "$1": ["a", "b"]},
                "body": {"type": "++", "$1": [{"type": "var", "name": "acc"},
                                               [{"type": "var", "name": "x"}]]}}),
        &json!(["a", "b", "c", "d"]),
    );
}

#[test]
fn test_let_star_sequential_bindings() {
    expect(
        &json!({"type": "let*",
                "bindings": [["x", 1.0], ["y", {"type": "var", "name": "x"}]],
                "body": {"type": "var", "name": "y"}}),
        &json!(1.0),
    );
}

#[test]
fn test_env_restriction() {
    expect_in(
        &json!({"A": "a", "B": "b"}),
        &json!({"type": "env", "vars": ["A", "C"]}),
        &json!({"A": "a", "C": null}),
    );
}

#[test]
fn test_assert_family() {
    expect(
        &json!({"type": "assert", "var": "v", "$1": "value",
                "predicate": {"type": "var", "name": "v"}, "msg": "must hold"}),
        &json!("value"),
    );
    let err = eval(&json!({"type": "assert", "$1": [], "predicate": {"type": "var", "name": "_"},
                            "msg": "was empty"}))
        .expect_err("assert must fail");
    assert!(err.user_context());
    let err = eval(&json!({"type": "assert_non_empty", "$1": [], "msg": "empty input"}))
        .expect_err("assert_non_empty must fail");
    assert!(err.user_context());
    expect(&json!({"type": "assert_non_empty", "$1": "x"}), &json!("x"));
}

#[test]
fn test_fail_is_user_context() {
    let err = eval(&json!({"type": "fail", "msg": "user says no"})).expect_err("must fail");
    assert!(err.user_context());
    assert!(err.message().contains("user says no"));
}

#[test]
fn test_context_prepends_and_keeps_user_flag() {
    let err = eval(&json!({"type": "context", "msg": "while linking",
                            "$1": {"type": "fail", "msg": "inner"}}))
        .expect_err("must fail");
    assert!(err.user_context());
    assert!(err.message().contains("In Context"));
    assert!(err.message().contains("while linking"));
    assert!(err.message().contains("inner"));
}

#[test]
fn test_comparison_of_names_is_fatal() {
    use girder_expr::{EntityName, ReferenceKind};
    use std::collections::BTreeMap;
    // names enter expressions only through the analyzer, so assemble
    // the nub_right expression over a quoted name-containing list
    let name = Value::name(EntityName::named("r", "m", "n", ReferenceKind::Target));
    let quoted = Value::map_from(BTreeMap::from([
        ("type".to_string(), Value::string("'")),
        ("$1".to_string(), Value::list(vec![name])),
    ]));
    let expr = Value::map_from(BTreeMap::from([
        ("type".to_string(), Value::string("nub_right")),
        ("$1".to_string(), quoted),
    ]));
    let evaluator = Evaluator::default();
    let functions = FunctionMap::chain(girder_expr::builtins(), &FunctionMap::empty());
    let err = evaluator.evaluate(&expr, &Configuration::default(), &functions);
    assert!(err.is_err());
    assert!(err
        .expect_err("is error")
        .message()
        .contains("nub_right"));
}

#[test]
fn test_top_level_entry_catches_everything() {
    let evaluator = Evaluator::default();
    let logged = Mutex::new(Vec::<String>::new());
    let result = evaluator.evaluate_expression(
        &Value::from_json(&json!({"type": "fail", "msg": "boom"})),
        &Configuration::default(),
        &FunctionMap::empty(),
        &|msg| logged.lock().expect("lock").push(msg.to_string()),
        None,
        None,
    );
    assert!(result.is_none());
    let logs = logged.lock().expect("lock");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("boom"));
    // user-context errors do not carry the traceback banner
    assert!(!logs[0].contains("traceback"));
}

#[test]
fn test_traceback_banner_for_evaluation_errors() {
    let evaluator = Evaluator::default();
    let logged = Mutex::new(Vec::<String>::new());
    let result = evaluator.evaluate_expression(
        &Value::from_json(&json!({"type": "let*", "bindings": [["x", {"type": "unknown_op"}]],
                                   "body": 1.0})),
        &Configuration::default(),
        &FunctionMap::empty(),
        &|msg| logged.lock().expect("lock").push(msg.to_string()),
        None,
        None,
    );
    assert!(result.is_none());
    let logs = logged.lock().expect("lock");
    assert!(logs[0].contains("Expression evaluation traceback"));
    assert!(logs[0].contains("Unknown syntactical construct unknown_op"));
}
