//! Lifecycle tests: start, stop, destroy and command execution against the
//! in-memory cluster.

#[path = "support/fixtures.rs"]
mod fixtures;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use corral::{
    CallContext, ClusterError, CorralConfig, ErrorKind, ExecOutput, Instance, InstanceState,
    Manifest, ResourceKind, batch_destroy,
};
use corral::test_support::TestHarness;
use fixtures::Env;
use rstest::{fixture, rstest};

#[fixture]
fn env() -> Env {
    Env::new()
}

#[rstest]
#[tokio::test]
async fn start_creates_supporting_resources_before_the_workload(env: Env) {
    let mut web = env.web("web").await;
    web.storage()
        .add_file_bytes(b"ok\n", "/usr/share/nginx/html/health", "")
        .expect("file");
    web.storage().add_volume("/data", "1Gi").expect("volume");

    web.execution().start(&env.ctx).await.expect("start");

    assert_eq!(web.state(), InstanceState::Started);
    let creates = env.harness.cluster.calls_with_verb("create");
    assert_eq!(
        creates,
        vec![
            "create service/web",
            "create persistentvolumeclaim/web-volume",
            "create configmap/web-files",
            "create serviceaccount/web",
            "create replicaset/web",
        ]
    );
    assert!(web.network().service().is_some(), "service is cached");
}

#[rstest]
#[tokio::test]
async fn instances_without_ports_get_no_service(env: Env) {
    let mut worker = env.committed("worker", "busybox:1.36").await;
    worker.execution().start(&env.ctx).await.expect("start");
    assert!(!env.harness.cluster.contains(ResourceKind::Service, "worker"));
    assert!(worker.network().service().is_none());
}

#[rstest]
#[tokio::test]
async fn stop_keeps_supporting_resources(env: Env) {
    let mut web = env.web("web").await;
    web.execution().start(&env.ctx).await.expect("start");
    web.execution().stop(&env.ctx).await.expect("stop");

    assert_eq!(web.state(), InstanceState::Stopped);
    let cluster = &env.harness.cluster;
    assert!(!cluster.contains(ResourceKind::ReplicaSet, "web"));
    assert!(cluster.contains(ResourceKind::Service, "web"));
    assert!(cluster.contains(ResourceKind::ServiceAccount, "web"));
    web.execution()
        .wait_instance_is_stopped(&env.ctx)
        .await
        .expect("no pods remain");

    web.execution().start(&env.ctx).await.expect("restart");
    assert_eq!(web.state(), InstanceState::Started);
    assert!(cluster.contains(ResourceKind::ReplicaSet, "web"));
}

#[rstest]
#[tokio::test]
async fn destroy_removes_everything_and_is_idempotent(env: Env) {
    let mut web = env.web("web").await;
    web.storage().add_volume("/data", "1Gi").expect("volume");
    web.execution().start(&env.ctx).await.expect("start");

    web.execution().destroy(&env.ctx).await.expect("destroy");
    assert_eq!(web.state(), InstanceState::Destroyed);
    assert_eq!(env.harness.cluster.object_count(), 0);
    assert!(web.network().service().is_none());

    env.harness.cluster.clear_calls();
    web.execution()
        .destroy(&env.ctx)
        .await
        .expect("second destroy is a no-op");
    assert!(env.harness.cluster.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn destroy_is_best_effort_and_reports_the_first_failure(env: Env) {
    let mut web = env.web("web").await;
    web.execution().start(&env.ctx).await.expect("start");
    env.harness.cluster.fail_next(
        "delete",
        ResourceKind::Service,
        ClusterError::Api {
            message: String::from("etcd unavailable"),
        },
    );

    let err = web.execution().destroy(&env.ctx).await.expect_err("destroy fails");
    assert_eq!(err.kind(), ErrorKind::DependencyFailure);
    assert!(err.to_string().contains("delete service"), "unexpected: {err}");
    assert_eq!(web.state(), InstanceState::Started, "state unchanged on failure");
    assert!(!env.harness.cluster.contains(ResourceKind::ReplicaSet, "web"));
    assert!(!env.harness.cluster.contains(ResourceKind::ServiceAccount, "web"));

    web.execution().destroy(&env.ctx).await.expect("retry succeeds");
    assert_eq!(web.state(), InstanceState::Destroyed);
}

#[rstest]
#[tokio::test]
async fn start_failure_names_the_step(env: Env) {
    let mut web = env.web("web").await;
    env.harness.cluster.fail_next(
        "create",
        ResourceKind::ReplicaSet,
        ClusterError::Api {
            message: String::from("quota exceeded"),
        },
    );
    let err = web.execution().start(&env.ctx).await.expect_err("start fails");
    assert!(err.to_string().contains("create replica set"), "unexpected: {err}");
    assert_eq!(web.state(), InstanceState::Committed);
}

#[rstest]
#[case::config_map(ResourceKind::ConfigMap, "create configmap web-files")]
#[case::volume_claim(ResourceKind::PersistentVolumeClaim, "create persistentvolumeclaim web-volume")]
#[case::service_account(ResourceKind::ServiceAccount, "create serviceaccount web")]
#[tokio::test]
async fn supporting_resource_failures_name_the_object(
    env: Env,
    #[case] kind: ResourceKind,
    #[case] step: &str,
) {
    let mut web = env.web("web").await;
    web.storage()
        .add_file_bytes(b"ok\n", "/usr/share/nginx/html/health", "")
        .expect("file");
    web.storage().add_volume("/data", "1Gi").expect("volume");
    env.harness.cluster.fail_next(
        "create",
        kind,
        ClusterError::Api {
            message: String::from("quota"),
        },
    );

    let err = web.execution().start(&env.ctx).await.expect_err("start fails");
    assert_eq!(err.kind(), ErrorKind::DependencyFailure);
    assert!(err.to_string().contains(step), "unexpected: {err}");
    assert_eq!(web.state(), InstanceState::Committed);
    assert!(!env.harness.cluster.contains(ResourceKind::ReplicaSet, "web"));
}

#[rstest]
#[tokio::test]
async fn derived_object_names_fit_a_dns_label(env: Env) {
    let long = "n".repeat(60);
    let mut web = env.web(&long).await;
    web.storage()
        .add_file_bytes(b"ok\n", "/usr/share/nginx/html/health", "")
        .expect("file");
    web.storage()
        .add_volume_with_owner("/data", "1Gi", "101:101")
        .expect("volume");
    web.execution().start(&env.ctx).await.expect("start");

    let cluster = &env.harness.cluster;
    assert!(cluster.contains(ResourceKind::ConfigMap, &format!("{}-files", "n".repeat(57))));
    assert!(cluster.contains(
        ResourceKind::PersistentVolumeClaim,
        &format!("{}-volume", "n".repeat(56))
    ));
    let Some(Manifest::ReplicaSet(replica_set)) = cluster.object(ResourceKind::ReplicaSet, &long)
    else {
        panic!("replica set missing");
    };
    let pod = replica_set
        .spec
        .and_then(|spec| spec.template)
        .and_then(|template| template.spec)
        .expect("pod spec");
    let mut names: Vec<String> = pod
        .volumes
        .unwrap_or_default()
        .into_iter()
        .map(|volume| volume.name)
        .collect();
    names.extend(
        pod.init_containers
            .unwrap_or_default()
            .into_iter()
            .map(|init| init.name),
    );
    names.extend(pod.containers.into_iter().map(|container| container.name));
    assert!(names.contains(&format!("{}-volume-init", "n".repeat(51))), "{names:?}");
    assert!(names.iter().all(|name| name.len() <= 63), "{names:?}");
}

#[rstest]
#[tokio::test]
async fn lifecycle_guards_reject_illegal_transitions(env: Env) {
    let mut web = env.web("web").await;
    let err = web.execution().stop(&env.ctx).await.expect_err("stop before start");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    let err = web
        .execution()
        .destroy(&env.ctx)
        .await
        .expect_err("destroy before start");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

    web.execution().start(&env.ctx).await.expect("start");
    let err = web.execution().start(&env.ctx).await.expect_err("double start");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
}

#[rstest]
#[tokio::test]
async fn waiting_for_readiness_honours_the_deadline(env: Env) {
    env.harness.cluster.set_auto_ready(false);
    let mut web = env.web("web").await;
    let ctx = CallContext::with_timeout(Duration::from_millis(50));
    let err = web.execution().start(&ctx).await.expect_err("never ready");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(web.state(), InstanceState::Started);

    env.harness.cluster.mark_ready("web");
    assert!(web.execution().is_running(&env.ctx).await.expect("status query"));
}

#[rstest]
#[tokio::test]
async fn cancelled_contexts_stop_before_touching_the_cluster(env: Env) {
    let mut web = env.web("web").await;
    let ctx = CallContext::new();
    ctx.cancel();
    env.harness.cluster.clear_calls();
    let err = web.execution().start(&ctx).await.expect_err("cancelled");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(env.harness.cluster.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn start_with_callback_fires_once_running(env: Env) {
    env.harness.cluster.set_auto_ready(false);
    let mut web = env.web("web").await;
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let handle = web
        .execution()
        .start_with_callback(&env.ctx, move || flag.store(true, Ordering::SeqCst))
        .await
        .expect("deploys");
    assert!(!fired.load(Ordering::SeqCst));

    env.harness.cluster.mark_ready("web");
    handle.await.expect("background task joins");
    assert!(fired.load(Ordering::SeqCst));
}

#[rstest]
#[tokio::test]
async fn execute_command_returns_stdout_and_surfaces_stderr(env: Env) {
    let mut web = env.web("web").await;
    web.execution().start(&env.ctx).await.expect("start");

    env.harness.cluster.push_exec_output(ExecOutput {
        stdout: String::from("nginx version: nginx/1.27\n"),
        stderr: String::new(),
    });
    let out = web
        .execution()
        .execute_command(&env.ctx, &["nginx", "-v"])
        .await
        .expect("command runs");
    assert_eq!(out, "nginx version: nginx/1.27\n");

    env.harness.cluster.push_exec_output(ExecOutput {
        stdout: String::new(),
        stderr: String::from("permission denied"),
    });
    let err = web
        .execution()
        .execute_command(&env.ctx, &["rm", "/etc/passwd"])
        .await
        .expect_err("stderr fails the command");
    assert!(err.to_string().contains("permission denied"));

    let err = web
        .execution()
        .execute_command(&env.ctx, &[])
        .await
        .expect_err("empty command");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[rstest]
#[tokio::test]
async fn batch_destroy_skips_missing_entries(env: Env) {
    let mut first = env.web("first").await;
    let mut second = env.web("second").await;
    first.execution().start(&env.ctx).await.expect("start first");
    second.execution().start(&env.ctx).await.expect("start second");

    batch_destroy(&env.ctx, [Some(&mut first), None, Some(&mut second)])
        .await
        .expect("batch destroy");
    assert_eq!(first.state(), InstanceState::Destroyed);
    assert_eq!(second.state(), InstanceState::Destroyed);
}

#[tokio::test]
async fn batch_destroy_honours_skip_cleanup() {
    let harness = TestHarness::with_config(CorralConfig {
        skip_cleanup: true,
        ..CorralConfig::default()
    })
    .expect("harness");
    let ctx = CallContext::new();
    let mut web = Instance::new("web", Arc::clone(&harness.deps)).expect("instance");
    web.build().set_image("nginx:1.27").expect("image");
    web.build().commit(&ctx).await.expect("commit");
    web.execution().start(&ctx).await.expect("start");

    batch_destroy(&ctx, [Some(&mut web)]).await.expect("skipped");
    assert_eq!(web.state(), InstanceState::Started);
    assert!(harness.cluster.contains(ResourceKind::ReplicaSet, "web"));
}
