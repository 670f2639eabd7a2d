//! Fault injection tests against the in-memory cluster.

#[path = "support/fixtures.rs"]
mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use corral::{CallContext, CustomResourceRef, ErrorKind, Manifest, ResourceKind};
use fixtures::Env;
use rstest::{fixture, rstest};

const NETWORK_CHAOS: ResourceKind = ResourceKind::Custom(CustomResourceRef {
    group: "chaos-mesh.org",
    version: "v1alpha1",
    resource: "networkchaos",
    kind: "NetworkChaos",
});

#[fixture]
fn env() -> Env {
    Env::new()
}

async fn started_with_chaos(env: &Env) -> corral::Instance {
    let mut web = env.web("web").await;
    web.chaos().enable_chaos_mesh().expect("enable");
    web.execution().start(&env.ctx).await.expect("start");
    web
}

#[rstest]
#[tokio::test]
async fn delay_submits_a_network_chaos_object(env: Env) {
    let mut web = started_with_chaos(&env).await;
    web.chaos()
        .set_delay(&env.ctx, Duration::from_millis(200), Duration::from_millis(20))
        .await
        .expect("delay injected");

    assert_eq!(web.chaos().submitted(), [String::from("web-delay")]);
    let Some(Manifest::Custom(object)) = env.harness.cluster.object(NETWORK_CHAOS, "web-delay")
    else {
        panic!("chaos object missing");
    };
    assert_eq!(object.body["spec"]["action"], "delay");
    assert_eq!(object.body["spec"]["delay"]["latency"], "200ms");
    assert_eq!(object.body["spec"]["delay"]["jitter"], "20ms");
}

#[rstest]
#[tokio::test]
async fn fault_methods_block_until_injection_is_reported(env: Env) {
    env.harness.cluster.set_auto_inject_chaos(false);
    let mut web = started_with_chaos(&env).await;

    let cluster = Arc::clone(&env.harness.cluster);
    let marker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cluster.mark_chaos_injected("web-loss");
    });
    web.chaos()
        .set_loss(&env.ctx, 25.0)
        .await
        .expect("loss injected once reported");
    marker.await.expect("marker task");
}

#[rstest]
#[tokio::test]
async fn injection_wait_honours_the_deadline(env: Env) {
    env.harness.cluster.set_auto_inject_chaos(false);
    let mut web = started_with_chaos(&env).await;

    let ctx = CallContext::with_timeout(Duration::from_millis(40));
    let err = web
        .chaos()
        .set_corrupt(&ctx, 10.0)
        .await
        .expect_err("never injected");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(web.chaos().submitted(), [String::from("web-corrupt")]);
}

#[rstest]
#[tokio::test]
async fn faults_require_the_opt_in(env: Env) {
    let mut web = env.web("web").await;
    web.execution().start(&env.ctx).await.expect("start");
    let err = web
        .chaos()
        .set_delay(&env.ctx, Duration::from_millis(100), Duration::ZERO)
        .await
        .expect_err("chaos not enabled");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(
        env.harness
            .cluster
            .calls_with_verb("create")
            .iter()
            .all(|call| !call.contains("networkchaos"))
    );
}

#[rstest]
#[case::negative(-1.0)]
#[case::above_hundred(100.5)]
#[case::not_a_number(f64::NAN)]
#[tokio::test]
async fn percentages_must_lie_within_bounds(env: Env, #[case] percent: f64) {
    let mut web = started_with_chaos(&env).await;
    let err = web
        .chaos()
        .set_duplicate(&env.ctx, percent)
        .await
        .expect_err("out of range");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(web.chaos().submitted().is_empty());
}

#[rstest]
#[tokio::test]
async fn state_is_checked_before_fault_arguments(env: Env) {
    let mut web = env.web("web").await;
    web.chaos().enable_chaos_mesh().expect("enable");

    let err = web
        .chaos()
        .set_loss(&env.ctx, 150.0)
        .await
        .expect_err("not started");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    let err = web
        .chaos()
        .set_delay(&env.ctx, Duration::ZERO, Duration::ZERO)
        .await
        .expect_err("not started");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    let err = web
        .chaos()
        .set_bandwidth(&env.ctx, "", 0, 0)
        .await
        .expect_err("not started");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
}

#[rstest]
#[tokio::test]
async fn long_names_keep_the_fault_action(env: Env) {
    let long = "c".repeat(63);
    let mut web = env.web(&long).await;
    web.chaos().enable_chaos_mesh().expect("enable");
    web.execution().start(&env.ctx).await.expect("start");
    web.chaos().set_loss(&env.ctx, 5.0).await.expect("loss");
    web.chaos().set_duplicate(&env.ctx, 5.0).await.expect("duplicate");

    let submitted = web.chaos().submitted().to_vec();
    assert_eq!(
        submitted,
        [format!("{}-loss", "c".repeat(58)), format!("{}-duplicate", "c".repeat(53))]
    );
    assert!(submitted.iter().all(|name| name.len() <= 63));
    assert!(submitted.iter().all(|name| env.harness.cluster.contains(NETWORK_CHAOS, name)));
}

#[rstest]
#[tokio::test]
async fn bandwidth_requires_positive_limits(env: Env) {
    let mut web = started_with_chaos(&env).await;
    let err = web
        .chaos()
        .set_bandwidth(&env.ctx, "1mbps", 0, 10_000)
        .await
        .expect_err("zero limit");
    assert_eq!(err.kind(), ErrorKind::Validation);

    web.chaos()
        .set_bandwidth(&env.ctx, "1mbps", 20_971_520, 10_000)
        .await
        .expect("bandwidth injected");
    assert!(env.harness.cluster.contains(NETWORK_CHAOS, "web-bandwidth"));
}

#[rstest]
#[tokio::test]
async fn clear_chaos_deletes_every_fault(env: Env) {
    let mut web = started_with_chaos(&env).await;
    web.chaos()
        .set_delay(&env.ctx, Duration::from_millis(50), Duration::ZERO)
        .await
        .expect("delay");
    web.chaos().set_loss(&env.ctx, 5.0).await.expect("loss");

    web.chaos().clear_chaos(&env.ctx).await.expect("clear");
    assert!(web.chaos().submitted().is_empty());
    assert!(!env.harness.cluster.contains(NETWORK_CHAOS, "web-delay"));
    assert!(!env.harness.cluster.contains(NETWORK_CHAOS, "web-loss"));
}

#[rstest]
#[tokio::test]
async fn destroy_removes_outstanding_faults(env: Env) {
    let mut web = started_with_chaos(&env).await;
    web.chaos().set_loss(&env.ctx, 5.0).await.expect("loss");

    web.execution().destroy(&env.ctx).await.expect("destroy");
    assert!(!env.harness.cluster.contains(NETWORK_CHAOS, "web-loss"));
    assert_eq!(env.harness.cluster.object_count(), 0);
}

#[rstest]
#[tokio::test]
async fn clones_keep_the_opt_in_but_not_the_faults(env: Env) {
    let mut web = env.web("web").await;
    web.chaos().enable_chaos_mesh().expect("enable");
    let mut copy = web.clone_with_name("web-copy").expect("clone");
    assert!(copy.chaos().is_enabled());
    assert!(copy.chaos().submitted().is_empty());
}
