//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeCluster`] keeps cluster objects in memory and simulates just enough
//! behaviour for lifecycle tests: ReplicaSets become ready, pods appear for
//! them, Services receive cluster IPs and chaos objects report injection.
//! Files written through `exec` land on the claim mounted at that path, so
//! they survive a ReplicaSet being deleted and recreated.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetStatus};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use tokio::sync::{Mutex, MutexGuard};

use crate::cluster::{
    ClusterClient, ClusterError, ClusterFuture, ExecOutput, GracePeriod, Manifest, ResourceKind,
};
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::config::CorralConfig;
use crate::deps::{SystemDependencies, TestScope, Timings};
use crate::error::Error;
use crate::image::{BuildError, BuildFuture, BuildPlan, GitRepoSource, ImageBuilder};
use crate::proxy::{ProxyError, ProxyFuture, ProxyRegistrar};

/// A single request received by [`FakeCluster`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterCall {
    /// Verb such as `create`, `delete` or `exec`.
    pub verb: &'static str,
    /// Resource kind, or `pod` for exec and port forwarding.
    pub kind: String,
    /// Object name.
    pub name: String,
}

impl fmt::Display for ClusterCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.verb, self.kind, self.name)
    }
}

type ObjectKey = (String, String);

#[derive(Debug, Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, Manifest>,
    claim_files: BTreeMap<String, BTreeMap<String, String>>,
    pod_files: BTreeMap<String, BTreeMap<String, String>>,
    calls: Vec<ClusterCall>,
    exec_outputs: VecDeque<ExecOutput>,
    failures: Vec<(&'static str, String, ClusterError)>,
    port_forward_failures: u32,
    next_ip: u32,
}

impl FakeState {
    fn record(&mut self, verb: &'static str, kind: &str, name: &str) -> Result<(), ClusterError> {
        self.calls.push(ClusterCall {
            verb,
            kind: kind.to_owned(),
            name: name.to_owned(),
        });
        let position = self
            .failures
            .iter()
            .position(|(failing_verb, failing_kind, _)| *failing_verb == verb && failing_kind == kind);
        match position {
            Some(index) => Err(self.failures.remove(index).2),
            None => Ok(()),
        }
    }
}

fn key(kind: ResourceKind, name: &str) -> ObjectKey {
    (kind.as_str().to_owned(), name.to_owned())
}

/// In-memory [`ClusterClient`].
#[derive(Debug)]
pub struct FakeCluster {
    state: StdMutex<FakeState>,
    auto_ready: AtomicBool,
    auto_inject: AtomicBool,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// Creates an empty cluster whose ReplicaSets become ready and whose
    /// chaos objects report injection immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(FakeState::default()),
            auto_ready: AtomicBool::new(true),
            auto_inject: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Controls whether new ReplicaSets report every replica ready.
    pub fn set_auto_ready(&self, ready: bool) {
        self.auto_ready.store(ready, Ordering::SeqCst);
    }

    /// Controls whether new chaos objects report `AllInjected=True`.
    pub fn set_auto_inject_chaos(&self, inject: bool) {
        self.auto_inject.store(inject, Ordering::SeqCst);
    }

    /// Marks the ReplicaSet `name` ready.
    pub fn mark_ready(&self, name: &str) {
        let mut state = self.lock();
        if let Some(Manifest::ReplicaSet(replica_set)) =
            state.objects.get_mut(&key(ResourceKind::ReplicaSet, name))
        {
            set_ready(replica_set);
        }
    }

    /// Adds the `AllInjected=True` condition to every custom object named
    /// `name`.
    pub fn mark_chaos_injected(&self, name: &str) {
        let mut state = self.lock();
        for ((_, object_name), manifest) in &mut state.objects {
            if object_name == name {
                if let Manifest::Custom(object) = manifest {
                    set_injected(&mut object.body);
                }
            }
        }
    }

    /// Fails the next `verb` on `kind` with `error`.
    pub fn fail_next(&self, verb: &'static str, kind: ResourceKind, error: ClusterError) {
        self.lock()
            .failures
            .push((verb, kind.as_str().to_owned(), error));
    }

    /// Fails the next `count` port-forward attempts.
    pub fn fail_port_forwards(&self, count: u32) {
        self.lock().port_forward_failures = count;
    }

    /// Queues an output returned by the next `exec`, bypassing the file
    /// simulation.
    pub fn push_exec_output(&self, output: ExecOutput) {
        self.lock().exec_outputs.push_back(output);
    }

    /// Returns every request received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.clone()
    }

    /// Returns requests with `verb`, rendered as `verb kind/name`.
    #[must_use]
    pub fn calls_with_verb(&self, verb: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.verb == verb)
            .map(ToString::to_string)
            .collect()
    }

    /// Forgets recorded requests.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Returns the stored object, if any.
    #[must_use]
    pub fn object(&self, kind: ResourceKind, name: &str) -> Option<Manifest> {
        self.lock().objects.get(&key(kind, name)).cloned()
    }

    /// Returns `true` when the object exists.
    #[must_use]
    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.lock().objects.contains_key(&key(kind, name))
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    fn admit(&self, state: &mut FakeState, manifest: &Manifest, live: Option<&Manifest>) -> Manifest {
        let mut stored = manifest.clone();
        match &mut stored {
            Manifest::ReplicaSet(replica_set) if self.auto_ready.load(Ordering::SeqCst) => {
                set_ready(replica_set);
            }
            Manifest::Service(service) => {
                let live_ip = live
                    .and_then(Manifest::as_service)
                    .and_then(|live| live.spec.as_ref())
                    .and_then(|spec| spec.cluster_ip.clone());
                let spec = service.spec.get_or_insert_with(Default::default);
                if spec.cluster_ip.is_none() {
                    spec.cluster_ip = live_ip.or_else(|| {
                        state.next_ip += 1;
                        Some(format!("10.96.0.{}", state.next_ip))
                    });
                }
            }
            Manifest::Custom(object) if self.auto_inject.load(Ordering::SeqCst) => {
                set_injected(&mut object.body);
            }
            _ => {}
        }
        stored
    }
}

fn set_ready(replica_set: &mut ReplicaSet) {
    let replicas = replica_set
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    replica_set.status = Some(ReplicaSetStatus {
        replicas,
        ready_replicas: Some(replicas),
        available_replicas: Some(replicas),
        ..ReplicaSetStatus::default()
    });
}

fn set_injected(body: &mut serde_json::Value) {
    if let Some(object) = body.as_object_mut() {
        object.insert(
            String::from("status"),
            json!({ "conditions": [{ "type": "AllInjected", "status": "True" }] }),
        );
    }
}

fn pod_labels(replica_set: &ReplicaSet) -> BTreeMap<String, String> {
    replica_set
        .spec
        .as_ref()
        .and_then(|spec| spec.template.as_ref())
        .and_then(|template| template.metadata.as_ref())
        .and_then(|metadata| metadata.labels.clone())
        .unwrap_or_default()
}

enum FileLocation {
    Claim(String),
    ConfigMap { name: String, key: String },
    Pod,
}

/// Resolves where `path` lives for `container` of `replica_set`'s pod.
fn locate(replica_set: &ReplicaSet, container: &str, path: &str) -> FileLocation {
    let Some(pod_spec) = replica_set
        .spec
        .as_ref()
        .and_then(|spec| spec.template.as_ref())
        .and_then(|template| template.spec.as_ref())
    else {
        return FileLocation::Pod;
    };
    let volumes = pod_spec.volumes.clone().unwrap_or_default();
    let mounts = pod_spec
        .containers
        .iter()
        .find(|candidate| candidate.name == container)
        .and_then(|found| found.volume_mounts.clone())
        .unwrap_or_default();
    for mount in mounts {
        let Some(volume) = volumes.iter().find(|volume| volume.name == mount.name) else {
            continue;
        };
        if let (Some(config_map), Some(sub_path)) = (&volume.config_map, &mount.sub_path) {
            if mount.mount_path == path {
                return FileLocation::ConfigMap {
                    name: config_map.name.clone(),
                    key: sub_path.clone(),
                };
            }
        }
        if let Some(claim) = &volume.persistent_volume_claim {
            if path.starts_with(&format!("{}/", mount.mount_path.trim_end_matches('/'))) {
                return FileLocation::Claim(claim.claim_name.clone());
            }
        }
    }
    FileLocation::Pod
}

fn run_exec(
    state: &mut FakeState,
    pod: &str,
    container: &str,
    command: &[String],
) -> Result<ExecOutput, ClusterError> {
    let replica_set = pod
        .strip_suffix("-0")
        .and_then(|name| state.objects.get(&key(ResourceKind::ReplicaSet, name)))
        .and_then(Manifest::as_replica_set)
        .cloned()
        .ok_or_else(|| ClusterError::Exec {
            message: format!("pod {pod} not found"),
        })?;
    if let Some(output) = state.exec_outputs.pop_front() {
        return Ok(output);
    }
    let parts: Vec<&str> = command.iter().map(String::as_str).collect();
    match parts.as_slice() {
        ["cat", path] => Ok(read_file(state, &replica_set, pod, container, path)),
        ["sh", "-c", script] => Ok(write_file(state, &replica_set, pod, container, script)),
        _ => Ok(ExecOutput::default()),
    }
}

fn read_file(
    state: &FakeState,
    replica_set: &ReplicaSet,
    pod: &str,
    container: &str,
    path: &str,
) -> ExecOutput {
    let found = match locate(replica_set, container, path) {
        FileLocation::Claim(claim) => state
            .claim_files
            .get(&claim)
            .and_then(|files| files.get(path))
            .cloned(),
        FileLocation::ConfigMap { name, key: data_key } => state
            .objects
            .get(&key(ResourceKind::ConfigMap, &name))
            .and_then(|manifest| match manifest {
                Manifest::ConfigMap(config_map) => config_map.data.as_ref(),
                _ => None,
            })
            .and_then(|data| data.get(&data_key))
            .cloned(),
        FileLocation::Pod => state
            .pod_files
            .get(pod)
            .and_then(|files| files.get(path))
            .cloned(),
    };
    found.map_or_else(
        || ExecOutput {
            stdout: String::new(),
            stderr: format!("cat: {path}: No such file or directory"),
        },
        |stdout| ExecOutput {
            stdout,
            stderr: String::new(),
        },
    )
}

/// Handles `echo <text> > <path>`; any other script succeeds silently.
fn write_file(
    state: &mut FakeState,
    replica_set: &ReplicaSet,
    pod: &str,
    container: &str,
    script: &str,
) -> ExecOutput {
    let Some((text, path)) = script
        .strip_prefix("echo ")
        .and_then(|rest| rest.rsplit_once(" > "))
    else {
        return ExecOutput::default();
    };
    let contents = format!("{}\n", text.trim().trim_matches(['\'', '"']));
    let path = path.trim().to_owned();
    match locate(replica_set, container, &path) {
        FileLocation::Claim(claim) => {
            state.claim_files.entry(claim).or_default().insert(path, contents);
        }
        FileLocation::ConfigMap { .. } => {
            return ExecOutput {
                stdout: String::new(),
                stderr: format!("sh: can't create {path}: Read-only file system"),
            };
        }
        FileLocation::Pod => {
            state
                .pod_files
                .entry(pod.to_owned())
                .or_default()
                .insert(path, contents);
        }
    }
    ExecOutput::default()
}

impl ClusterClient for FakeCluster {
    fn create<'a>(
        &'a self,
        _namespace: &'a str,
        manifest: &'a Manifest,
    ) -> ClusterFuture<'a, Manifest> {
        Box::pin(async move {
            let mut state = self.lock();
            let kind = manifest.kind();
            state.record("create", kind.as_str(), manifest.name())?;
            let object_key = key(kind, manifest.name());
            if state.objects.contains_key(&object_key) {
                return Err(ClusterError::AlreadyExists {
                    kind: kind.to_string(),
                    name: manifest.name().to_owned(),
                });
            }
            let stored = self.admit(&mut state, manifest, None);
            state.objects.insert(object_key, stored.clone());
            Ok(stored)
        })
    }

    fn update<'a>(
        &'a self,
        _namespace: &'a str,
        manifest: &'a Manifest,
    ) -> ClusterFuture<'a, Manifest> {
        Box::pin(async move {
            let mut state = self.lock();
            let kind = manifest.kind();
            state.record("update", kind.as_str(), manifest.name())?;
            let object_key = key(kind, manifest.name());
            let live = state.objects.get(&object_key).cloned().ok_or_else(|| {
                ClusterError::NotFound {
                    kind: kind.to_string(),
                    name: manifest.name().to_owned(),
                }
            })?;
            let stored = self.admit(&mut state, manifest, Some(&live));
            state.objects.insert(object_key, stored.clone());
            Ok(stored)
        })
    }

    fn get<'a>(
        &'a self,
        _namespace: &'a str,
        kind: ResourceKind,
        name: &'a str,
    ) -> ClusterFuture<'a, Option<Manifest>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.record("get", kind.as_str(), name)?;
            Ok(state.objects.get(&key(kind, name)).cloned())
        })
    }

    fn delete<'a>(
        &'a self,
        _namespace: &'a str,
        kind: ResourceKind,
        name: &'a str,
        _grace: GracePeriod,
    ) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state.record("delete", kind.as_str(), name)?;
            state
                .objects
                .remove(&key(kind, name))
                .ok_or_else(|| ClusterError::NotFound {
                    kind: kind.to_string(),
                    name: name.to_owned(),
                })?;
            match kind {
                ResourceKind::ReplicaSet => {
                    state.pod_files.remove(&format!("{name}-0"));
                }
                ResourceKind::PersistentVolumeClaim => {
                    state.claim_files.remove(name);
                }
                _ => {}
            }
            Ok(())
        })
    }

    fn list_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a str,
    ) -> ClusterFuture<'a, Vec<Pod>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.record("list", "pod", selector)?;
            let Some((label, value)) = selector.split_once('=') else {
                return Err(ClusterError::Api {
                    message: format!("unsupported selector {selector}"),
                });
            };
            let pods = state
                .objects
                .values()
                .filter_map(Manifest::as_replica_set)
                .filter(|replica_set| {
                    pod_labels(replica_set).get(label).map(String::as_str) == Some(value)
                })
                .map(|replica_set| Pod {
                    metadata: ObjectMeta {
                        name: Some(format!(
                            "{}-0",
                            replica_set.metadata.name.clone().unwrap_or_default()
                        )),
                        namespace: Some(namespace.to_owned()),
                        labels: Some(pod_labels(replica_set)),
                        ..ObjectMeta::default()
                    },
                    ..Pod::default()
                })
                .collect();
            Ok(pods)
        })
    }

    fn exec<'a>(
        &'a self,
        _namespace: &'a str,
        pod: &'a str,
        container: &'a str,
        command: &'a [String],
    ) -> ClusterFuture<'a, ExecOutput> {
        Box::pin(async move {
            let mut state = self.lock();
            state.record("exec", "pod", pod)?;
            run_exec(&mut state, pod, container, command)
        })
    }

    fn port_forward<'a>(
        &'a self,
        _namespace: &'a str,
        pod: &'a str,
        _local_port: u16,
        _remote_port: u16,
    ) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state.record("port-forward", "pod", pod)?;
            if state.port_forward_failures > 0 {
                state.port_forward_failures -= 1;
                return Err(ClusterError::PortForward {
                    message: String::from("connection refused"),
                });
            }
            Ok(())
        })
    }
}

/// [`ImageBuilder`] that counts pushes and returns the requested name.
#[derive(Debug, Default)]
pub struct CountingBuilder {
    pushes: AtomicUsize,
    git_builds: AtomicUsize,
    fail_pushes: AtomicBool,
    pushed: StdMutex<Vec<String>>,
}

impl CountingBuilder {
    /// Returns the number of plan pushes.
    #[must_use]
    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Returns the number of git builds.
    #[must_use]
    pub fn git_builds(&self) -> usize {
        self.git_builds.load(Ordering::SeqCst)
    }

    /// Returns every pushed image name in order.
    #[must_use]
    pub fn pushed_images(&self) -> Vec<String> {
        self.pushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes every later push fail.
    pub fn fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }

    fn record(&self, image: &str) {
        self.pushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(image.to_owned());
    }
}

impl ImageBuilder for CountingBuilder {
    fn push<'a>(&'a self, _plan: &'a BuildPlan, image: &'a str) -> BuildFuture<'a, String> {
        Box::pin(async move {
            if self.fail_pushes.load(Ordering::SeqCst) {
                return Err(BuildError::Push {
                    image: image.to_owned(),
                    message: String::from("registry unavailable"),
                });
            }
            self.pushes.fetch_add(1, Ordering::SeqCst);
            self.record(image);
            Ok(image.to_owned())
        })
    }

    fn build_from_git<'a>(
        &'a self,
        source: &'a GitRepoSource,
        image: &'a str,
    ) -> BuildFuture<'a, String> {
        Box::pin(async move {
            if self.fail_pushes.load(Ordering::SeqCst) {
                return Err(BuildError::Git {
                    url: source.url.clone(),
                    image: image.to_owned(),
                    message: String::from("clone failed"),
                });
            }
            self.git_builds.fetch_add(1, Ordering::SeqCst);
            self.record(image);
            Ok(image.to_owned())
        })
    }
}

/// [`ProxyRegistrar`] that records routes and serves `http://proxy.test`
/// URLs.
#[derive(Debug, Default)]
pub struct RecordingProxy {
    routes: StdMutex<BTreeMap<String, (String, u16)>>,
}

impl RecordingProxy {
    /// Returns registered routes as `(prefix, service, port)`.
    #[must_use]
    pub fn routes(&self) -> Vec<(String, String, u16)> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(prefix, (service, port))| (prefix.clone(), service.clone(), *port))
            .collect()
    }
}

impl ProxyRegistrar for RecordingProxy {
    fn register<'a>(
        &'a self,
        service: &'a str,
        prefix: &'a str,
        port: u16,
    ) -> ProxyFuture<'a, ()> {
        Box::pin(async move {
            self.routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(prefix.to_owned(), (service.to_owned(), port));
            Ok(())
        })
    }

    fn url<'a>(&'a self, prefix: &'a str) -> ProxyFuture<'a, String> {
        Box::pin(async move {
            let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            if routes.contains_key(prefix) {
                Ok(format!("http://proxy.test/{prefix}"))
            } else {
                Err(ProxyError::UnknownRoute {
                    prefix: prefix.to_owned(),
                })
            }
        })
    }
}

/// Fakes wired into a [`SystemDependencies`] for tests.
#[derive(Debug)]
pub struct TestHarness {
    /// In-memory cluster.
    pub cluster: Arc<FakeCluster>,
    /// Counting image builder.
    pub builder: Arc<CountingBuilder>,
    /// Recording proxy.
    pub proxy: Arc<RecordingProxy>,
    /// Dependencies built from the fakes.
    pub deps: Arc<SystemDependencies>,
}

impl TestHarness {
    /// Builds dependencies on fresh fakes with fast timings, the scope
    /// `corral-test` and build directories under `build_dir`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`SystemDependenciesBuilder::build`](crate::deps::SystemDependenciesBuilder::build).
    pub fn new(build_dir: &str) -> Result<Self, Error> {
        Self::with_config(CorralConfig {
            build_dir: build_dir.to_owned(),
            ..CorralConfig::default()
        })
    }

    /// Builds dependencies on fresh fakes using `config`.
    ///
    /// # Errors
    ///
    /// See [`TestHarness::new`].
    pub fn with_config(config: CorralConfig) -> Result<Self, Error> {
        let cluster = Arc::new(FakeCluster::new());
        let builder = Arc::new(CountingBuilder::default());
        let proxy = Arc::new(RecordingProxy::default());
        let deps = SystemDependencies::builder()
            .cluster(Arc::clone(&cluster) as Arc<dyn ClusterClient>)
            .image_builder(Arc::clone(&builder) as Arc<dyn ImageBuilder>)
            .proxy(Arc::clone(&proxy) as Arc<dyn ProxyRegistrar>)
            .scope(TestScope::new("corral-test")?)
            .config(config)
            .timings(Timings::fast())
            .build()?;
        Ok(Self {
            cluster,
            builder,
            proxy,
            deps,
        })
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: std::rc::Rc<std::cell::RefCell<VecDeque<CommandOutput>>>,
    invocations: std::rc::Rc<std::cell::RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
