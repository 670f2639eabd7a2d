//! Unit tests for the janitor module.

use super::*;
use crate::test_support::ScriptedRunner;
use rstest::rstest;

fn config() -> JanitorConfig {
    JanitorConfig::new("corral", "corral-1a2b3c4d", DEFAULT_KUBECTL_BIN).expect("config")
}

/// Queues an empty listing for every swept kind.
fn push_empty_listings(runner: &ScriptedRunner) {
    for _ in SWEPT_KINDS {
        runner.push_output(Some(0), "", "");
    }
}

#[rstest]
fn janitor_config_builds_scope_selector() {
    assert_eq!(config().selector(), "corral.dev/scope=corral-1a2b3c4d");
}

#[rstest]
#[case("namespace", " ", "scope-1", DEFAULT_KUBECTL_BIN)]
#[case("scope", "corral", " ", DEFAULT_KUBECTL_BIN)]
#[case("kubectl_bin", "corral", "scope-1", "  ")]
fn janitor_config_rejects_blank_fields(
    #[case] expected_field: &str,
    #[case] namespace: &str,
    #[case] scope: &str,
    #[case] kubectl_bin: &str,
) {
    let err = JanitorConfig::new(namespace, scope, kubectl_bin).expect_err("expected invalid config");
    assert_eq!(
        err,
        JanitorError::InvalidConfig {
            field: expected_field.to_owned()
        }
    );
}

#[rstest]
fn sweep_deletes_labelled_objects_per_kind() {
    let runner = ScriptedRunner::new();
    // replicasets: one object, then its delete
    runner.push_output(Some(0), "replicaset.apps/web\n", "");
    runner.push_success();
    // services: two objects
    runner.push_output(Some(0), "service/web\nservice/db\n", "");
    runner.push_success();
    runner.push_success();
    for _ in SWEPT_KINDS.iter().skip(2) {
        runner.push_output(Some(0), "", "");
    }
    push_empty_listings(&runner);

    let janitor = Janitor::new(config(), runner.clone());
    let summary = janitor.sweep().expect("sweep should succeed");
    assert_eq!(summary.total(), 3);
    assert_eq!(summary.deleted.get("replicasets"), Some(&1));
    assert_eq!(summary.deleted.get("services"), Some(&2));

    let invocations = runner.invocations();
    let deletes: Vec<String> = invocations
        .iter()
        .filter(|call| call.args.first().is_some_and(|arg| arg == "delete"))
        .map(|call| call.command_string())
        .collect();
    assert_eq!(
        deletes,
        vec![
            "kubectl delete replicaset.apps/web -n corral --ignore-not-found",
            "kubectl delete service/web -n corral --ignore-not-found",
            "kubectl delete service/db -n corral --ignore-not-found",
        ]
    );
    let first_list = invocations.first().expect("list invocation").command_string();
    assert_eq!(
        first_list,
        "kubectl get replicasets -n corral -l corral.dev/scope=corral-1a2b3c4d -o name"
    );
}

#[rstest]
fn sweep_errors_when_labelled_objects_remain() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "replicaset.apps/web\n", "");
    runner.push_success();
    for _ in SWEPT_KINDS.iter().skip(1) {
        runner.push_output(Some(0), "", "");
    }
    // post-sweep listing still shows the replica set
    runner.push_output(Some(0), "replicaset.apps/web\n", "");
    for _ in SWEPT_KINDS.iter().skip(1) {
        runner.push_output(Some(0), "", "");
    }

    let err = Janitor::new(config(), runner)
        .sweep()
        .expect_err("sweep should fail");
    let JanitorError::NotClean { message } = err else {
        panic!("expected NotClean, got {err:?}");
    };
    assert!(
        message.contains("replicaset.apps/web"),
        "expected remaining object, got: {message}"
    );
}

#[rstest]
fn sweep_surfaces_kubectl_failures() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(1), "", "forbidden");

    let err = Janitor::new(config(), runner)
        .sweep()
        .expect_err("sweep should fail");
    let JanitorError::CommandFailure { status, stderr, .. } = err else {
        panic!("expected CommandFailure, got {err:?}");
    };
    assert_eq!(status, Some(1));
    assert!(stderr.contains("replicasets: forbidden"));
}

#[rstest]
fn sweep_surfaces_runner_failures() {
    let err = Janitor::new(config(), ScriptedRunner::new())
        .sweep()
        .expect_err("sweep should fail");
    assert!(matches!(err, JanitorError::Runner(_)));
}

#[rstest]
fn empty_scope_sweeps_nothing() {
    let runner = ScriptedRunner::new();
    push_empty_listings(&runner);
    push_empty_listings(&runner);

    let summary = Janitor::new(config(), runner)
        .sweep()
        .expect("sweep should succeed");
    assert_eq!(summary, SweepSummary::default());
}
