//! Unit tests for instance configuration and state guards.

use super::*;
use crate::error::ErrorKind;
use crate::test_support::TestHarness;
use crate::wait::CallContext;
use container_sidecar::ContainerSidecar;
use rstest::{fixture, rstest};
use sidecars::{Sidecar, SidecarFuture};

#[fixture]
fn harness() -> TestHarness {
    TestHarness::new("/tmp/corral-unit").expect("harness")
}

async fn committed(harness: &TestHarness, name: &str) -> Instance {
    let mut instance = Instance::new(name, Arc::clone(&harness.deps)).expect("instance");
    instance.build().set_image("nginx:1.27").expect("image");
    instance
        .build()
        .commit(&CallContext::new())
        .await
        .expect("commit");
    instance
}

#[rstest]
#[case("web", "web")]
#[case("My_Web.Server", "my-web-server")]
#[case("--edge--", "edge")]
#[case("Ünïcode app", "n-code-app")]
fn sanitize_name_produces_dns_labels(#[case] input: &str, #[case] expected: &str) {
    assert_eq!(sanitize_name(input), expected);
}

#[rstest]
fn sanitize_name_truncates_to_label_length() {
    let long = "a".repeat(80);
    assert_eq!(sanitize_name(&long).len(), MAX_NAME_LEN);
    let dashed = format!("{}-b", "a".repeat(62));
    assert_eq!(sanitize_name(&dashed), "a".repeat(62));
}

#[rstest]
#[case::short("web", "files", "web-files")]
#[case::index_survives(&"a".repeat(63), "0", &format!("{}-0", "a".repeat(61)))]
#[case::long_suffix(&"a".repeat(60), "volume-init", &format!("{}-volume-init", "a".repeat(51)))]
#[case::no_double_dash(&format!("{}-b", "a".repeat(55)), "volume", &format!("{}-volume", "a".repeat(55)))]
fn derived_names_fit_a_dns_label(#[case] base: &str, #[case] suffix: &str, #[case] expected: &str) {
    let name = derived_name(base, suffix);
    assert_eq!(name, expected);
    assert!(name.len() <= MAX_NAME_LEN, "{name}");
}

#[rstest]
fn duplicate_names_conflict(harness: TestHarness) {
    let _first = Instance::new("web", Arc::clone(&harness.deps)).expect("first");
    let err = Instance::new("WEB", Arc::clone(&harness.deps)).expect_err("duplicate");
    assert_eq!(err.kind(), ErrorKind::ResourceConflict);
}

#[rstest]
fn unusable_names_are_rejected(harness: TestHarness) {
    let err = Instance::new("***", harness.deps).expect_err("no usable characters");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[rstest]
fn set_image_moves_to_preparing(harness: TestHarness) {
    let mut instance = Instance::new("web", harness.deps).expect("instance");
    assert_eq!(instance.state(), InstanceState::None);
    instance.build().set_image("nginx:1.27").expect("image");
    assert_eq!(instance.state(), InstanceState::Preparing);
    assert_eq!(instance.build().image_name(), "nginx:1.27");
}

#[rstest]
#[tokio::test]
async fn commit_requires_preparing(harness: TestHarness) {
    let mut instance = Instance::new("web", harness.deps).expect("instance");
    let err = instance
        .build()
        .commit(&CallContext::new())
        .await
        .expect_err("commit before image");
    assert!(matches!(
        err,
        Error::InvalidStateTransition {
            state: InstanceState::None,
            ..
        }
    ));
}

#[rstest]
#[tokio::test]
async fn image_only_commit_keeps_image_without_push(harness: TestHarness) {
    let instance = committed(&harness, "web").await;
    assert_eq!(instance.state(), InstanceState::Committed);
    assert_eq!(harness.builder.pushes(), 0);
}

#[rstest]
#[tokio::test]
async fn build_instructions_push_a_content_addressed_image(harness: TestHarness) {
    let mut instance = Instance::new("web", Arc::clone(&harness.deps)).expect("instance");
    let mut build = instance.build();
    build.set_image("alpine:3.20").expect("image");
    build
        .execute_command(&["apk", "add", "curl"])
        .expect("run instruction");
    build.set_environment_variable("MODE", "test").expect("env");
    build.commit(&CallContext::new()).await.expect("commit");

    assert_eq!(harness.builder.pushes(), 1);
    let image = instance.build().image_name().to_owned();
    assert!(image.contains("/corral-"), "unexpected image {image}");
    assert!(instance.build().env().is_empty(), "baked env stays out of the pod spec");
}

#[rstest]
#[tokio::test]
async fn image_mutators_are_rejected_after_commit(harness: TestHarness) {
    let mut instance = committed(&harness, "web").await;
    let err = instance
        .build()
        .execute_command(&["true"])
        .expect_err("run after commit");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    let err = instance.build().set_user("nobody").expect_err("user after commit");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

    instance
        .build()
        .set_environment_variable("MODE", "runtime")
        .expect("pod env after commit");
    assert_eq!(
        instance.build().env().get("MODE").map(String::as_str),
        Some("runtime")
    );
    assert_eq!(instance.state(), InstanceState::Committed);
}

#[rstest]
#[case(0)]
#[case(65_536)]
fn ports_outside_range_are_rejected(harness: TestHarness, #[case] port: u32) {
    let mut instance = Instance::new("web", harness.deps).expect("instance");
    instance.build().set_image("nginx:1.27").expect("image");
    let err = instance.network().add_port_tcp(port).expect_err("invalid port");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(instance.network().tcp_ports().is_empty());
}

#[rstest]
fn duplicate_ports_are_rejected_per_protocol(harness: TestHarness) {
    let mut instance = Instance::new("dns", harness.deps).expect("instance");
    instance.build().set_image("coredns:1.11").expect("image");
    let mut network = instance.network();
    network.add_port_tcp(53).expect("tcp");
    network.add_port_udp(53).expect("same number on udp");
    let err = network.add_port_tcp(53).expect_err("duplicate tcp");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(network.tcp_ports(), &[53]);
    assert_eq!(network.udp_ports(), &[53]);
}

#[rstest]
fn only_one_volume_is_supported(harness: TestHarness) {
    let mut instance = Instance::new("db", harness.deps).expect("instance");
    instance.build().set_image("postgres:16").expect("image");
    let mut storage = instance.storage();
    storage.add_volume("/var/lib/postgresql", "1Gi").expect("volume");
    let err = storage.add_volume("/backup", "1Gi").expect_err("second volume");
    assert!(matches!(err, Error::Validation { field: "volume", .. }));
    let err = storage.add_volume("relative", "1Gi").expect_err("relative path");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[rstest]
fn files_need_absolute_destinations(harness: TestHarness) {
    let mut instance = Instance::new("web", harness.deps).expect("instance");
    instance.build().set_image("nginx:1.27").expect("image");
    let err = instance
        .storage()
        .add_file_bytes(b"hi", "index.html", "")
        .expect_err("relative destination");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[rstest]
#[tokio::test]
async fn files_added_after_commit_are_mounted(harness: TestHarness) {
    let mut instance = committed(&harness, "web").await;
    instance
        .storage()
        .add_file_bytes(b"hello\n", "/usr/share/nginx/html/index.html", "")
        .expect("file");
    let storage = instance.storage();
    let file = storage.files().first().expect("file recorded");
    assert!(!file.is_baked());
    assert_eq!(file.dest, "/usr/share/nginx/html/index.html");
}

#[rstest]
#[tokio::test]
async fn resources_and_security_accumulate(harness: TestHarness) {
    let mut instance = committed(&harness, "web").await;
    instance.resources().set_cpu("100m", "500m").expect("cpu");
    instance.resources().set_memory("64Mi", "128Mi").expect("memory");
    instance
        .security()
        .add_capabilities(&["NET_ADMIN", "NET_RAW", "NET_ADMIN"])
        .expect("capabilities");
    instance.security().set_privileged(true).expect("privileged");

    assert_eq!(instance.resources().cpu(), (Some("100m"), Some("500m")));
    assert_eq!(instance.resources().memory(), (Some("64Mi"), Some("128Mi")));
    assert_eq!(instance.security().capabilities(), &["NET_ADMIN", "NET_RAW"]);
    assert!(instance.security().privileged());
}

#[rstest]
#[tokio::test]
async fn clone_copies_configuration_without_aliasing(harness: TestHarness) {
    let mut template = committed(&harness, "web").await;
    template.network().add_port_tcp(80).expect("port");
    template
        .build()
        .set_environment_variable("MODE", "a")
        .expect("env");
    template
        .storage()
        .add_file_bytes(b"listen 80;\n", "/etc/nginx/conf.d/site.conf", "")
        .expect("file");

    let mut copy = template.clone_with_name("web-copy").expect("clone");
    assert_eq!(copy.state(), InstanceState::Committed);
    assert_eq!(copy.k8s_name(), "web-copy");
    assert_eq!(copy.network().tcp_ports(), &[80]);
    assert_eq!(copy.storage().files(), template.storage().files());

    copy.storage()
        .add_file_bytes(b"ok\n", "/usr/share/nginx/html/health", "")
        .expect("copy file");
    assert_eq!(copy.storage().files().len(), 2);
    assert_eq!(template.storage().files().len(), 1);
    template
        .storage()
        .add_file_bytes(b"gzip on;\n", "/etc/nginx/conf.d/gzip.conf", "")
        .expect("template file");
    assert_eq!(copy.storage().files().len(), 2);

    copy.network().add_port_tcp(443).expect("copy port");
    copy.build()
        .set_environment_variable("MODE", "b")
        .expect("copy env");
    assert_eq!(template.network().tcp_ports(), &[80]);
    assert_eq!(
        template.build().env().get("MODE").map(String::as_str),
        Some("a")
    );
}

#[rstest]
fn clone_requires_committed(harness: TestHarness) {
    let mut instance = Instance::new("web", harness.deps).expect("instance");
    instance.build().set_image("nginx:1.27").expect("image");
    let err = instance.clone_with_name("web-2").expect_err("clone while preparing");
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
}

#[rstest]
#[tokio::test]
async fn sidecars_share_the_parent_pod(harness: TestHarness) {
    let ctx = CallContext::new();
    let mut host = committed(&harness, "web").await;
    host.sidecars()
        .add(&ctx, ContainerSidecar::new("metrics", "prom/statsd-exporter:v0.27").with_tcp_port(9102))
        .await
        .expect("sidecar attaches");

    assert_eq!(host.sidecars().names(), vec!["web-metrics"]);
    let sidecars = host.sidecars();
    let sidecar = sidecars
        .get(0)
        .and_then(|sidecar| sidecar.instance())
        .expect("sidecar instance");
    assert!(sidecar.is_sidecar());
    assert_eq!(sidecar.parent_name(), Some("web"));
    assert_eq!(sidecar.pod_owner(), "web");
    assert_eq!(sidecar.state(), InstanceState::Committed);
}

#[rstest]
#[tokio::test]
async fn sidecars_cannot_host_sidecars(harness: TestHarness) {
    let ctx = CallContext::new();
    let mut host = committed(&harness, "web").await;
    host.sidecars()
        .add(&ctx, ContainerSidecar::new("proxy", "envoyproxy/envoy:v1.31"))
        .await
        .expect("sidecar attaches");
    let mut sidecars = host.sidecars();
    let nested = sidecars
        .get_mut(0)
        .and_then(|sidecar| sidecar.instance_mut())
        .expect("sidecar instance");
    let err = nested
        .sidecars()
        .add(&ctx, ContainerSidecar::new("log", "busybox:1.36"))
        .await
        .expect_err("nested sidecar");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

/// Sidecar whose instance already hosts a sidecar of its own.
struct NestingSidecar {
    instance: Option<Instance>,
}

impl Sidecar for NestingSidecar {
    fn initialize<'a>(
        &'a mut self,
        ctx: &'a CallContext,
        parent_name: &'a str,
        deps: Arc<SystemDependencies>,
    ) -> SidecarFuture<'a, ()> {
        Box::pin(async move {
            let mut instance = Instance::new(format!("{parent_name}-mesh"), deps)?;
            instance.build().set_image("envoyproxy/envoy:v1.31")?;
            instance.build().commit(ctx).await?;
            instance
                .sidecars()
                .add(ctx, ContainerSidecar::new("log", "busybox:1.36"))
                .await?;
            self.instance = Some(instance);
            Ok(())
        })
    }

    fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    fn instance_mut(&mut self) -> Option<&mut Instance> {
        self.instance.as_mut()
    }

    fn clone_for(&self, _parent_name: &str) -> Result<Box<dyn Sidecar>, Error> {
        Ok(Box::new(Self { instance: None }))
    }
}

#[rstest]
#[tokio::test]
async fn sidecars_hosting_sidecars_are_rejected(harness: TestHarness) {
    let ctx = CallContext::new();
    let mut host = committed(&harness, "web").await;
    let err = host
        .sidecars()
        .add(&ctx, NestingSidecar { instance: None })
        .await
        .expect_err("nested host");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("web-mesh"), "unexpected: {err}");
    assert!(host.sidecars().is_empty());
}

#[rstest]
#[tokio::test]
async fn sidecar_lifecycle_is_driven_by_the_parent(harness: TestHarness) {
    let ctx = CallContext::new();
    let mut host = committed(&harness, "web").await;
    host.sidecars()
        .add(&ctx, ContainerSidecar::new("proxy", "envoyproxy/envoy:v1.31"))
        .await
        .expect("sidecar attaches");
    let mut sidecars = host.sidecars();
    let sidecar = sidecars
        .get_mut(0)
        .and_then(|sidecar| sidecar.instance_mut())
        .expect("sidecar instance");
    let err = sidecar.execution().start(&ctx).await.expect_err("sidecar start");
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = sidecar
        .network()
        .disable_network(&ctx)
        .await
        .expect_err("sidecar isolation");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[rstest]
#[tokio::test]
async fn pools_clone_the_template(harness: TestHarness) {
    let mut template = committed(&harness, "worker").await;
    let pool = template.new_pool(3).expect("pool");
    let names: Vec<&str> = pool.instances().iter().map(Instance::k8s_name).collect();
    assert_eq!(names, vec!["worker-0", "worker-1", "worker-2"]);
    assert_eq!(template.state(), InstanceState::Destroyed);
    assert!(
        pool.instances()
            .iter()
            .all(|member| member.state() == InstanceState::Committed)
    );
}

#[rstest]
#[tokio::test]
async fn pools_of_long_templates_keep_the_index(harness: TestHarness) {
    let long = "w".repeat(MAX_NAME_LEN);
    let mut template = committed(&harness, &long).await;
    let pool = template.new_pool(2).expect("pool");
    let names: Vec<&str> = pool.instances().iter().map(Instance::k8s_name).collect();
    assert_eq!(
        names,
        [format!("{}-0", "w".repeat(61)), format!("{}-1", "w".repeat(61))]
    );
    assert!(names.iter().all(|name| name.len() <= MAX_NAME_LEN));
}

#[rstest]
#[tokio::test]
async fn empty_pools_are_rejected(harness: TestHarness) {
    let mut template = committed(&harness, "worker").await;
    let err = template.new_pool(0).expect_err("zero members");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(template.state(), InstanceState::Committed);
}

#[rstest]
fn instance_type_labels() {
    assert_eq!(InstanceType::Basic.as_str(), "basic");
    assert_eq!(InstanceType::Executor.to_string(), "executor");
    assert_eq!(InstanceType::TimeoutHandler.as_str(), "timeout-handler");
}
