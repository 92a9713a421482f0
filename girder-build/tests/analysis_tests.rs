//! End-to-end analysis scenarios over in-memory roots.

use async_trait::async_trait;
use girder_build::{
    create_target_map, AnalyseContext, Analysis, ConfiguredTarget, ExportCacheHook,
    InMemoryFileRoot, Repository, RepositoryConfig, ResultMap,
};
use girder_core::{compute_hash, Digest, ObjectType};
use girder_expr::{Configuration, EntityName, ReferenceKind, TargetResult, Value};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

fn setup(files: &[(&str, Json)]) -> (Arc<Analysis>, Arc<girder_build::TargetMap>) {
    setup_with_hook(files, None)
}

fn setup_with_hook(
    files: &[(&str, Json)],
    export_cache: Option<Arc<dyn ExportCacheHook>>,
) -> (Arc<Analysis>, Arc<girder_build::TargetMap>) {
    let mut root = InMemoryFileRoot::new();
    for (path, content) in files {
        root = root.with_file(*path, content.to_string());
    }
    let repository = Repository::new(root.into_root()).with_fingerprint(compute_hash(b"repo"));
    let repo_config = RepositoryConfig::new().add("base", repository);
    let context = AnalyseContext::with_hooks(repo_config, None, export_cache);
    let analysis = Analysis::new(context, ResultMap::new());
    let map = create_target_map(analysis.clone(), girder_async::null_logger());
    (analysis, map)
}

fn target(name: &str) -> ConfiguredTarget {
    ConfiguredTarget::new(
        EntityName::named("base", "", name, ReferenceKind::Target),
        Configuration::default(),
    )
}

fn target_in(config: &Json, name: &str) -> ConfiguredTarget {
    ConfiguredTarget::new(
        EntityName::named("base", "", name, ReferenceKind::Target),
        Configuration::from_json(config),
    )
}

#[tokio::test]
async fn test_file_gen_target() {
    let (_, map) = setup(&[(
        "TARGETS",
        json!({"hello": {"type": "file_gen", "name": "hello.txt", "data": "hi"}}),
    )]);
    let values = map.consume(vec![target("hello")]).await.expect("analyses");
    let artifact = values[0]
        .artifacts()
        .get("hello.txt")
        .expect("staged at its name")
        .as_artifact()
        .cloned()
        .expect("is artifact");
    assert_eq!(
        artifact.to_known_info().expect("known").digest,
        compute_hash(b"hi")
    );
    assert_eq!(values[0].blobs(), ["hi"]);
}

#[tokio::test]
async fn test_user_rule_with_action() {
    let rule_body = json!({
        "type": "let*",
        "bindings": [
            ["src", {"type": "[]", "index": 0, "list": {"type": "FIELD", "name": "srcs"}}],
            ["inputs", {"type": "DEP_ARTIFACTS", "dep": {"type": "var", "name": "src"}}],
            ["out", {"type": "ACTION",
                     "inputs": {"type": "var", "name": "inputs"},
                     "outs": ["main.o"],
                     "cmd": [{"type": "var", "name": "CC", "default": "cc"}, "-c", "main.c"]}]
        ],
        "body": {"type": "RESULT", "artifacts": {"type": "var", "name": "out"}},
    });
    let (analysis, map) = setup(&[
        ("main.c", json!("int main() { return 0; }")),
        (
            "RULES",
            json!({"compile": {
                "target_fields": ["srcs"],
                "config_vars": ["CC"],
                "expression": rule_body,
            }}),
        ),
        (
            "TARGETS",
            json!({"lib": {"type": "compile", "srcs": [["FILE", null, "main.c"]]}}),
        ),
    ]);
    let values = map
        .consume(vec![target_in(&json!({"CC": "gcc"}), "lib")])
        .await
        .expect("analyses");
    let analysed = &values[0];
    // one action, using the configured compiler
    assert_eq!(analysed.actions().len(), 1);
    assert_eq!(analysed.actions()[0].command[0], "gcc");
    // the output is an action artifact at the declared path
    let out = analysed
        .artifacts()
        .get("main.o")
        .expect("staged output")
        .as_artifact()
        .cloned()
        .expect("artifact");
    assert!(matches!(
        out,
        girder_core::ArtifactDescription::Action { .. }
    ));
    // the target demonstrably depends on CC only
    assert!(analysed.vars().contains("CC"));
    assert_eq!(analysis.result_map.actions().len(), 1);
}

#[tokio::test]
async fn test_taint_superset_enforced() {
    let (_, map) = setup(&[
        (
            "RULES",
            json!({
                "plain": {
                    "target_fields": ["deps"],
                    "expression": {"type": "RESULT"},
                },
                "secretive": {
                    "tainted": ["secret"],
                    "expression": {"type": "RESULT"},
                },
            }),
        ),
        (
            "TARGETS",
            json!({
                "U": {"type": "secretive"},
                "T": {"type": "plain", "deps": ["U"]},
            }),
        ),
    ]);
    let failure = map
        .consume(vec![target("T")])
        .await
        .expect_err("taint violation must be fatal");
    assert!(failure.fatal);
    assert!(failure
        .msg
        .contains("Not tainted with all strings the dependencies are tainted with"));
    // the tainted target itself is fine when the taint is declared
    let (_, map) = setup(&[
        (
            "RULES",
            json!({
                "plain": {
                    "target_fields": ["deps"],
                    "tainted": ["secret"],
                    "expression": {"type": "RESULT"},
                },
                "secretive": {
                    "tainted": ["secret"],
                    "expression": {"type": "RESULT"},
                },
            }),
        ),
        (
            "TARGETS",
            json!({
                "U": {"type": "secretive"},
                "T": {"type": "plain", "deps": ["U"]},
            }),
        ),
    ]);
    let values = map.consume(vec![target("T")]).await.expect("analyses");
    assert!(values[0].tainted().contains("secret"));
}

#[tokio::test]
async fn test_action_output_tree_conflict() {
    let (_, map) = setup(&[
        (
            "RULES",
            json!({"bad": {"expression": {
                "type": "RESULT",
                "artifacts": {"type": "ACTION", "outs": ["a/b", "a/b/c"], "cmd": ["true"]},
            }}}),
        ),
        ("TARGETS", json!({"T": {"type": "bad"}})),
    ]);
    let failure = map
        .consume(vec![target("T")])
        .await
        .expect_err("conflicting outputs must be fatal");
    assert!(failure.msg.contains("conflict"));
    assert!(failure.msg.contains("a/b"));
}

#[tokio::test]
async fn test_unknown_field_rejected() {
    let (_, map) = setup(&[
        ("RULES", json!({"r": {"expression": {"type": "RESULT"}}})),
        ("TARGETS", json!({"T": {"type": "r", "unexpected": []}})),
    ]);
    let failure = map.consume(vec![target("T")]).await.expect_err("must fail");
    assert!(failure.msg.contains("unexpected"));
}

#[tokio::test]
async fn test_glob_target() {
    let (_, map) = setup(&[
        ("a.c", json!("")),
        ("b.c", json!("")),
        ("c.h", json!("")),
        ("TARGETS", json!({})),
    ]);
    let glob = ConfiguredTarget::new(
        EntityName::named("base", "", "*.c", ReferenceKind::Glob),
        Configuration::default(),
    );
    let values = map.consume(vec![glob]).await.expect("globs");
    let stage = values[0].artifacts().as_map().expect("map").keys();
    assert_eq!(stage, vec!["a.c", "b.c"]);
}

#[tokio::test]
async fn test_tree_reference() {
    let (analysis, map) = setup(&[
        ("sub/x", json!("")),
        ("sub/inner/y", json!("")),
        ("TARGETS", json!({})),
    ]);
    let tree = ConfiguredTarget::new(
        EntityName::named("base", "", "sub", ReferenceKind::Tree),
        Configuration::default(),
    );
    let values = map.consume(vec![tree]).await.expect("tree analyses");
    let artifact = values[0]
        .artifacts()
        .get("sub")
        .expect("staged at dir name")
        .as_artifact()
        .cloned()
        .expect("artifact");
    assert!(artifact.is_tree());
    assert!(analysis.context.statistics.trees_analysed() >= 2);
}

#[tokio::test]
async fn test_implicit_source_target() {
    let (_, map) = setup(&[("data.txt", json!("payload")), ("TARGETS", json!({}))]);
    let values = map
        .consume(vec![target("data.txt")])
        .await
        .expect("falls back to source");
    let artifact = values[0]
        .artifacts()
        .get("data.txt")
        .expect("staged")
        .as_artifact()
        .cloned()
        .expect("artifact");
    assert!(matches!(
        artifact,
        girder_core::ArtifactDescription::Local { .. }
    ));
}

#[tokio::test]
async fn test_configure_overlays_configuration() {
    let (_, map) = setup(&[
        (
            "RULES",
            json!({"echo_os": {
                "config_vars": ["OS"],
                "expression": {
                    "type": "RESULT",
                    "provides": {"type": "singleton_map", "key": "os",
                                 "value": {"type": "var", "name": "OS"}},
                },
            }}),
        ),
        (
            "TARGETS",
            json!({
                "probe": {"type": "echo_os"},
                "linuxed": {"type": "configure", "target": "probe",
                             "config": {"type": "'", "$1": {"OS": "linux"}}},
            }),
        ),
    ]);
    let values = map
        .consume(vec![target_in(&json!({"OS": "darwin"}), "linuxed")])
        .await
        .expect("analyses");
    assert_eq!(
        values[0].provides().get("os").cloned(),
        Some(Value::string("linux"))
    );
    // OS is fixed by the overlay, so it is not an effective variable
    assert!(!values[0].vars().contains("OS"));
}

#[tokio::test]
async fn test_export_records_implied_and_effective_config() {
    let (_, map) = setup(&[
        (
            "TARGETS",
            json!({
                "hello": {"type": "file_gen", "name": "f", "data": "x"},
                "exp": {"type": "export", "target": "hello", "flexible_config": ["OS"]},
            }),
        ),
    ]);
    let values = map
        .consume(vec![target_in(&json!({"OS": "linux", "NOISE": "1"}), "exp")])
        .await
        .expect("analyses");
    assert!(!values[0].implied_export().is_empty());
    assert!(values[0].vars().contains("OS"));
    assert!(!values[0].vars().contains("NOISE"));
}

struct FixedCacheHook {
    result: TargetResult,
    lookups: Mutex<Vec<Json>>,
}

#[async_trait]
impl ExportCacheHook for FixedCacheHook {
    async fn lookup(
        &self,
        _repo_fingerprint: &Digest,
        target: &Json,
        _effective_config: &Json,
    ) -> Option<TargetResult> {
        self.lookups.lock().expect("lock").push(target.clone());
        Some(self.result.clone())
    }
}

#[tokio::test]
async fn test_export_uses_cache_hook() {
    let cached_stage = Value::map_from(BTreeMap::from([(
        "cached.bin".to_string(),
        Value::artifact(girder_core::ArtifactDescription::known(
            compute_hash(b"cached"),
            ObjectType::File,
        )),
    )]));
    let hook = Arc::new(FixedCacheHook {
        result: TargetResult::new(cached_stage, Value::empty_map(), Value::empty_map()),
        lookups: Mutex::new(Vec::new()),
    });
    let (analysis, map) = setup_with_hook(
        &[(
            "TARGETS",
            json!({
                "hello": {"type": "file_gen", "name": "f", "data": "x"},
                "exp": {"type": "export", "target": "hello", "flexible_config": []},
            }),
        )],
        Some(hook.clone()),
    );
    let values = map.consume(vec![target("exp")]).await.expect("analyses");
    assert!(values[0].artifacts().get("cached.bin").is_some());
    assert_eq!(hook.lookups.lock().expect("lock").len(), 1);
    assert_eq!(analysis.context.statistics.exports_cached(), 1);
}

#[tokio::test]
async fn test_anonymous_targets_from_providers() {
    let (_, map) = setup(&[
        (
            "RULES",
            json!({
                "leafrule": {
                    "string_fields": ["data"],
                    "expression": {"type": "RESULT",
                        "artifacts": {"type": "singleton_map", "key": "out",
                            "value": {"type": "BLOB",
                                      "data": {"type": "join",
                                               "$1": {"type": "FIELD", "name": "data"}}}}},
                },
                "emitter": {
                    "expression": {"type": "RESULT",
                        "provides": {"type": "singleton_map", "key": "nodes",
                            "value": [{"type": "ABSTRACT_NODE", "node_type": "leaf",
                                       "string_fields": {"type": "singleton_map",
                                                          "key": "data",
                                                          "value": ["content"]}}]}},
                },
                "collector": {
                    "target_fields": ["deps"],
                    "anonymous": {"anons": {"target": "deps", "provider": "nodes",
                                             "rule_map": {"leaf": "leafrule"}}},
                    "expression": {"type": "RESULT",
                        "artifacts": {"type": "disjoint_map_union",
                            "$1": {"type": "foreach", "var": "a",
                                   "range": {"type": "FIELD", "name": "anons"},
                                   "body": {"type": "DEP_ARTIFACTS",
                                            "dep": {"type": "var", "name": "a"}}}}},
                },
            }),
        ),
        (
            "TARGETS",
            json!({
                "emit": {"type": "emitter"},
                "collect": {"type": "collector", "deps": ["emit"]},
            }),
        ),
    ]);
    let values = map.consume(vec![target("collect")]).await.expect("analyses");
    let artifact = values[0]
        .artifacts()
        .get("out")
        .expect("anonymous target produced its artifact")
        .as_artifact()
        .cloned()
        .expect("artifact");
    assert_eq!(
        artifact.to_known_info().expect("known blob").digest,
        compute_hash(b"content")
    );
}

#[tokio::test]
async fn test_memoization_shares_analysis() {
    let (analysis, map) = setup(&[(
        "TARGETS",
        json!({
            "base-file": {"type": "file_gen", "name": "f", "data": "x"},
            "a": {"type": "install", "deps": ["base-file"]},
            "b": {"type": "install", "deps": ["base-file"]},
        }),
    )]);
    let values = map
        .consume(vec![target("a"), target("b")])
        .await
        .expect("analyses");
    assert_eq!(values.len(), 2);
    // base-file, a, b (each once)
    assert_eq!(analysis.result_map.size(), 3);
}
