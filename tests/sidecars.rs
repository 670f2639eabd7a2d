//! Sidecar tests: shared pod, lockstep lifecycle and cleanup.

#[path = "support/fixtures.rs"]
mod fixtures;

use corral::{ContainerSidecar, ErrorKind, InstanceState, Manifest, ResourceKind};
use fixtures::Env;
use rstest::{fixture, rstest};

#[fixture]
fn env() -> Env {
    Env::new()
}

fn exporter() -> ContainerSidecar {
    ContainerSidecar::new("metrics", "prom/node-exporter:v1.8.2")
        .with_tcp_port(9100)
        .with_args(["--web.listen-address=:9100"])
}

fn sidecar_state(instance: &mut corral::Instance) -> InstanceState {
    instance
        .sidecars()
        .get(0)
        .and_then(|sidecar| sidecar.instance())
        .map(corral::Instance::state)
        .expect("sidecar instance")
}

#[rstest]
#[tokio::test]
async fn sidecars_share_the_parent_pod_and_service(env: Env) {
    let mut web = env.web("web").await;
    web.sidecars().add(&env.ctx, exporter()).await.expect("attach");
    assert_eq!(web.sidecars().names(), vec!["web-metrics"]);

    web.execution().start(&env.ctx).await.expect("start");

    let cluster = &env.harness.cluster;
    assert!(!cluster.contains(ResourceKind::ReplicaSet, "web-metrics"));
    let Some(Manifest::ReplicaSet(replica_set)) = cluster.object(ResourceKind::ReplicaSet, "web")
    else {
        panic!("replica set missing");
    };
    let containers: Vec<String> = replica_set
        .spec
        .and_then(|spec| spec.template)
        .and_then(|template| template.spec)
        .map(|pod| pod.containers.into_iter().map(|container| container.name).collect())
        .unwrap_or_default();
    assert_eq!(containers, vec!["web", "web-metrics"]);

    let Some(Manifest::Service(service)) = cluster.object(ResourceKind::Service, "web") else {
        panic!("service missing");
    };
    let ports: Vec<i32> = service
        .spec
        .and_then(|spec| spec.ports)
        .map(|ports| ports.into_iter().map(|port| port.port).collect())
        .unwrap_or_default();
    assert_eq!(ports, vec![80, 9100]);
}

#[rstest]
#[tokio::test]
async fn sidecar_state_follows_the_parent(env: Env) {
    let mut web = env.web("web").await;
    web.sidecars().add(&env.ctx, exporter()).await.expect("attach");
    assert_eq!(sidecar_state(&mut web), InstanceState::Committed);

    web.execution().start(&env.ctx).await.expect("start");
    assert_eq!(sidecar_state(&mut web), InstanceState::Started);

    web.execution().stop(&env.ctx).await.expect("stop");
    assert_eq!(sidecar_state(&mut web), InstanceState::Stopped);

    web.execution().destroy(&env.ctx).await.expect("destroy");
    assert_eq!(sidecar_state(&mut web), InstanceState::Destroyed);
}

#[rstest]
#[tokio::test]
async fn sidecar_files_get_their_own_config_map(env: Env) {
    let mut web = env.web("web").await;
    web.sidecars().add(&env.ctx, exporter()).await.expect("attach");
    {
        let mut sidecars = web.sidecars();
        let sidecar = sidecars
            .get_mut(0)
            .and_then(|sidecar| sidecar.instance_mut())
            .expect("sidecar instance");
        sidecar
            .storage()
            .add_file_bytes(b"collector: cpu\n", "/etc/exporter/config.yml", "")
            .expect("sidecar file");
    }

    web.execution().start(&env.ctx).await.expect("start");
    assert!(env.harness.cluster.contains(ResourceKind::ConfigMap, "web-metrics-files"));

    web.execution().destroy(&env.ctx).await.expect("destroy");
    assert!(!env.harness.cluster.contains(ResourceKind::ConfigMap, "web-metrics-files"));
    assert_eq!(env.harness.cluster.object_count(), 0);
}

#[rstest]
#[tokio::test]
async fn sidecars_address_the_parent_service(env: Env) {
    let mut web = env.web("web").await;
    web.sidecars().add(&env.ctx, exporter()).await.expect("attach");
    web.execution().start(&env.ctx).await.expect("start");

    let mut sidecars = web.sidecars();
    let sidecar = sidecars
        .get_mut(0)
        .and_then(|sidecar| sidecar.instance_mut())
        .expect("sidecar instance");
    assert_eq!(sidecar.parent_name(), Some("web"));
    let ip = sidecar.network().get_ip(&env.ctx).await.expect("ip");
    assert_eq!(ip, "10.96.0.1");
    let err = sidecar
        .network()
        .disable_network(&env.ctx)
        .await
        .expect_err("sidecars share the parent network");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[rstest]
#[tokio::test]
async fn clones_carry_their_own_sidecars(env: Env) {
    let mut web = env.web("web").await;
    web.sidecars().add(&env.ctx, exporter()).await.expect("attach");

    let mut copy = web.clone_with_name("web-copy").expect("clone");
    assert_eq!(copy.sidecars().names(), vec!["web-copy-metrics"]);
    assert_eq!(web.sidecars().names(), vec!["web-metrics"]);

    copy.execution().start(&env.ctx).await.expect("start clone");
    assert!(env.harness.cluster.contains(ResourceKind::ReplicaSet, "web-copy"));
    assert!(!env.harness.cluster.contains(ResourceKind::ReplicaSet, "web"));
}

#[rstest]
#[tokio::test]
async fn sidecars_cannot_be_added_after_start(env: Env) {
    let mut web = env.web("web").await;
    web.execution().start(&env.ctx).await.expect("start");
    let err = web
        .sidecars()
        .add(&env.ctx, exporter())
        .await
        .expect_err("too late");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    assert!(web.sidecars().is_empty());
}

#[rstest]
#[tokio::test]
async fn attached_sidecars_cannot_be_reimaged_after_running(env: Env) {
    let mut web = env.web("web").await;
    web.sidecars().add(&env.ctx, exporter()).await.expect("attach");
    web.execution().start(&env.ctx).await.expect("start");
    web.execution().stop(&env.ctx).await.expect("stop");

    let mut sidecars = web.sidecars();
    let sidecar = sidecars
        .get_mut(0)
        .and_then(|sidecar| sidecar.instance_mut())
        .expect("sidecar instance");
    let err = sidecar
        .build()
        .set_image("prom/node-exporter:v1.9.0")
        .expect_err("re-image rejected");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(sidecar.state(), InstanceState::Stopped);
}
