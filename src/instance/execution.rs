//! Start, stop and destroy orchestration plus in-container commands.
//!
//! Resources are created in the order Service, volume claim, files
//! ConfigMap, sidecar resources, RBAC, ReplicaSet. Teardown starts with the
//! ReplicaSet. Failures part-way through are not rolled back; the returned
//! error names the step that failed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterError, GracePeriod, Manifest, ResourceKind};
use crate::error::Error;
use crate::labels::app_selector;
use crate::state::InstanceState;
use crate::wait::{CallContext, Readiness, poll_until};

use super::Instance;
use super::chaos::NETWORK_CHAOS;
use super::manifest;

/// Lifecycle operations on an [`Instance`].
pub struct Execution<'a> {
    instance: &'a mut Instance,
}

impl<'a> Execution<'a> {
    pub(super) const fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    /// Deploys the instance without waiting for it to become ready.
    ///
    /// From `Committed` every supporting resource is created or updated
    /// first. From `Stopped` only the files ConfigMaps are refreshed before
    /// the ReplicaSet is recreated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for sidecars,
    /// [`Error::InvalidStateTransition`] outside `Committed` or `Stopped` or
    /// when a sidecar cannot start, [`Error::Timeout`] when `ctx` is already
    /// done, and [`Error::Cluster`] naming the first deployment step that
    /// failed.
    pub async fn start_async(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.ensure_host("start")?;
        self.instance.ensure_state(
            "start",
            &[InstanceState::Committed, InstanceState::Stopped],
        )?;
        self.instance.sidecars().ensure_startable()?;
        if ctx.is_done() {
            return Err(Error::timeout("start", &self.instance.k8s_name));
        }
        if self.instance.state == InstanceState::Committed {
            self.deploy_supporting_resources(ctx).await?;
        } else {
            self.refresh_config_maps().await?;
        }
        let replica_set = manifest::replica_set(self.instance);
        self.instance
            .deps
            .cluster()
            .create(self.instance.namespace(), &replica_set)
            .await
            .map_err(|source| Error::cluster("create replica set", &self.instance.k8s_name, source))?;
        self.instance.set_state(InstanceState::Started);
        info!(
            instance = self.instance.k8s_name.as_str(),
            sidecars = self.instance.sidecars.attached.len(),
            "instance started"
        );
        Ok(())
    }

    /// Deploys the instance and waits until its ReplicaSet reports ready.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Execution::start_async`] and
    /// [`Execution::wait_instance_is_running`].
    pub async fn start(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.start_async(ctx).await?;
        self.wait_instance_is_running(ctx).await
    }

    /// Deploys the instance and waits for readiness on a background task,
    /// invoking `callback` once it is running. Wait failures are logged and
    /// the callback is not invoked.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Execution::start_async`].
    pub async fn start_with_callback<F>(
        &mut self,
        ctx: &CallContext,
        callback: F,
    ) -> Result<JoinHandle<()>, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.start_async(ctx).await?;
        let deps = Arc::clone(&self.instance.deps);
        let name = self.instance.k8s_name.clone();
        let ctx = ctx.clone();
        Ok(tokio::spawn(async move {
            let interval = deps.timings().poll_interval;
            let cluster = deps.cluster();
            let namespace = deps.namespace();
            let outcome = poll_until(&ctx, interval, "instance running", &name, || {
                replica_set_readiness(cluster, namespace, &name)
            })
            .await;
            match outcome {
                Ok(()) => callback(),
                Err(err) => {
                    warn!(instance = name.as_str(), error = %err, "background readiness wait failed");
                }
            }
        }))
    }

    /// Reports whether every desired replica is ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Started`,
    /// [`Error::Timeout`] when `ctx` is done and [`Error::Cluster`] when the
    /// lookup fails.
    pub async fn is_running(&mut self, ctx: &CallContext) -> Result<bool, Error> {
        self.instance.ensure_state("check running", &[InstanceState::Started])?;
        if ctx.is_done() {
            return Err(Error::timeout("check running", &self.instance.k8s_name));
        }
        let readiness = replica_set_readiness(
            self.instance.deps.cluster(),
            self.instance.namespace(),
            self.instance.pod_owner(),
        )
        .await?;
        Ok(readiness == Readiness::Ready)
    }

    /// Polls until the ReplicaSet reports every replica ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Started`,
    /// [`Error::Timeout`] once `ctx` is done and [`Error::Cluster`] when a
    /// lookup fails.
    pub async fn wait_instance_is_running(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.instance.ensure_state("wait for running", &[InstanceState::Started])?;
        let instance: &Instance = self.instance;
        let cluster = instance.deps.cluster();
        let namespace = instance.namespace();
        let owner = instance.pod_owner();
        poll_until(
            ctx,
            instance.deps.timings().poll_interval,
            "instance running",
            &instance.k8s_name,
            || replica_set_readiness(cluster, namespace, owner),
        )
        .await?;
        debug!(instance = instance.k8s_name.as_str(), "instance running");
        Ok(())
    }

    /// Polls until no pod backs the instance any more.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Stopped`,
    /// [`Error::Timeout`] once `ctx` is done and [`Error::Cluster`] when
    /// listing pods fails.
    pub async fn wait_instance_is_stopped(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.instance.ensure_state("wait for stopped", &[InstanceState::Stopped])?;
        let instance: &Instance = self.instance;
        let cluster = instance.deps.cluster();
        let namespace = instance.namespace();
        let owned_selector = app_selector(instance.pod_owner());
        let selector = owned_selector.as_str();
        let name = instance.k8s_name.as_str();
        poll_until(
            ctx,
            instance.deps.timings().poll_interval,
            "instance stopped",
            name,
            || async move {
                let pods = cluster
                    .list_pods(namespace, selector)
                    .await
                    .map_err(|source| Error::cluster("list pods", name, source))?;
                Ok(Readiness::from(pods.is_empty()))
            },
        )
        .await
    }

    /// Deletes the ReplicaSet with no grace period. The Service, volume
    /// claim, ConfigMaps and RBAC objects are kept for a later start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for sidecars,
    /// [`Error::InvalidStateTransition`] outside `Started`,
    /// [`Error::Timeout`] when `ctx` is done and [`Error::Cluster`] when the
    /// deletion fails.
    pub async fn stop(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.ensure_host("stop")?;
        self.instance.ensure_state("stop", &[InstanceState::Started])?;
        if ctx.is_done() {
            return Err(Error::timeout("stop", &self.instance.k8s_name));
        }
        let result = self
            .instance
            .deps
            .cluster()
            .delete(
                self.instance.namespace(),
                ResourceKind::ReplicaSet,
                &self.instance.k8s_name,
                GracePeriod::Immediate,
            )
            .await;
        match result {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(instance = self.instance.k8s_name.as_str(), "replica set already gone");
            }
            Err(source) => {
                return Err(Error::cluster("delete replica set", &self.instance.k8s_name, source));
            }
        }
        self.instance.set_state(InstanceState::Stopped);
        info!(instance = self.instance.k8s_name.as_str(), "instance stopped");
        Ok(())
    }

    /// Deletes every cluster resource owned by the instance and its
    /// sidecars. Calling it again after success does nothing.
    ///
    /// Every deletion is attempted even when an earlier one fails; the first
    /// failure is returned and the state is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for sidecars,
    /// [`Error::InvalidStateTransition`] outside `Started` or `Stopped`,
    /// [`Error::Timeout`] when `ctx` is done and the first
    /// [`Error::Cluster`] raised by a deletion.
    pub async fn destroy(&mut self, ctx: &CallContext) -> Result<(), Error> {
        if self.instance.state == InstanceState::Destroyed {
            return Ok(());
        }
        self.ensure_host("destroy")?;
        self.instance.ensure_state(
            "destroy",
            &[InstanceState::Started, InstanceState::Stopped],
        )?;
        if ctx.is_done() {
            return Err(Error::timeout("destroy", &self.instance.k8s_name));
        }
        let deps = Arc::clone(&self.instance.deps);
        let mut teardown = Teardown::new(deps.cluster(), deps.namespace(), &self.instance.k8s_name);
        teardown
            .delete(
                "delete replica set",
                ResourceKind::ReplicaSet,
                &self.instance.k8s_name,
                GracePeriod::Immediate,
            )
            .await;
        teardown.delete_owned(self.instance).await;
        for (operation, kind) in [
            ("delete service", ResourceKind::Service),
            ("delete service account", ResourceKind::ServiceAccount),
            ("delete role", ResourceKind::Role),
            ("delete role binding", ResourceKind::RoleBinding),
        ] {
            teardown
                .delete(operation, kind, &self.instance.k8s_name, GracePeriod::Default)
                .await;
        }
        if self.instance.network.disabled {
            teardown
                .delete(
                    "delete network policy",
                    ResourceKind::NetworkPolicy,
                    &manifest::network_policy_name(&self.instance.k8s_name),
                    GracePeriod::Default,
                )
                .await;
        }
        for sidecar in &self.instance.sidecars.attached {
            if let Some(sidecar) = sidecar.instance() {
                teardown.delete_owned(sidecar).await;
            }
        }
        teardown.finish()?;
        self.instance.network.service = None;
        self.instance.network.disabled = false;
        self.instance.network.chaos_objects.clear();
        for sidecar in &mut self.instance.sidecars.attached {
            if let Some(sidecar) = sidecar.instance_mut() {
                sidecar.network.chaos_objects.clear();
            }
        }
        self.instance.set_state(InstanceState::Destroyed);
        info!(instance = self.instance.k8s_name.as_str(), "instance destroyed");
        Ok(())
    }

    /// Runs `command` inside the instance's container and returns its
    /// standard output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Started`,
    /// [`Error::Timeout`] when `ctx` is done, [`Error::Cluster`] when no pod
    /// is found or the exec stream fails, and [`Error::CommandFailed`] when
    /// the command writes to standard error.
    pub async fn execute_command(
        &mut self,
        ctx: &CallContext,
        command: &[&str],
    ) -> Result<String, Error> {
        self.instance.ensure_state("execute command", &[InstanceState::Started])?;
        let instance = self.instance.k8s_name.as_str();
        if command.is_empty() {
            return Err(Error::validation(instance, "command", "must not be empty"));
        }
        if ctx.is_done() {
            return Err(Error::timeout("execute command", instance));
        }
        let pod = first_pod(self.instance).await?;
        let command: Vec<String> = command.iter().map(|part| (*part).to_owned()).collect();
        let output = self
            .instance
            .deps
            .cluster()
            .exec(self.instance.namespace(), &pod, instance, &command)
            .await
            .map_err(|source| Error::cluster("execute command", instance, source))?;
        if !output.stderr.is_empty() {
            return Err(Error::CommandFailed {
                instance: instance.to_owned(),
                command: command.join(" "),
                stderr: output.stderr,
            });
        }
        debug!(instance, pod = pod.as_str(), "command executed");
        Ok(output.stdout)
    }

    fn ensure_host(&self, operation: &str) -> Result<(), Error> {
        if self.instance.is_sidecar() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "sidecar",
                format!("sidecars cannot {operation} on their own; use the parent instance"),
            ));
        }
        Ok(())
    }

    async fn deploy_supporting_resources(&mut self, ctx: &CallContext) -> Result<(), Error> {
        let deps = Arc::clone(&self.instance.deps);
        let cluster = deps.cluster();
        let namespace = deps.namespace();
        let name = self.instance.k8s_name.clone();

        if let Some(mut service) = manifest::service(self.instance) {
            let live = cluster
                .get(namespace, ResourceKind::Service, &name)
                .await
                .map_err(|source| Error::cluster("get service", &name, source))?;
            let stored = match live {
                Some(live) => {
                    manifest::merge_service_identity(&mut service, &live);
                    cluster
                        .update(namespace, &service)
                        .await
                        .map_err(|source| Error::cluster("update service", &name, source))?
                }
                None => cluster
                    .create(namespace, &service)
                    .await
                    .map_err(|source| Error::cluster("create service", &name, source))?,
            };
            self.instance.network.service = stored.as_service().cloned();
        }

        deploy_owned(cluster, namespace, self.instance).await?;

        for sidecar in &mut self.instance.sidecars.attached {
            let label = super::sidecars::sidecar_label(sidecar.as_ref()).to_owned();
            sidecar
                .pre_start(ctx)
                .await
                .map_err(|err| Error::sidecar(&label, err))?;
            let instance = super::sidecars::sidecar_instance(sidecar.as_ref())?;
            deploy_owned(cluster, namespace, instance)
                .await
                .map_err(|err| Error::sidecar(&label, err))?;
        }

        apply(
            cluster,
            namespace,
            &name,
            &manifest::service_account(self.instance),
            Apply::CreateIfAbsent,
        )
        .await?;
        if let Some(role) = manifest::role(self.instance) {
            apply(cluster, namespace, &name, &role, Apply::CreateOrUpdate).await?;
            let binding = manifest::role_binding(self.instance);
            apply(cluster, namespace, &name, &binding, Apply::CreateOrUpdate).await?;
        }
        Ok(())
    }

    async fn refresh_config_maps(&mut self) -> Result<(), Error> {
        let instance: &Instance = self.instance;
        let cluster = instance.deps.cluster();
        let namespace = instance.namespace();
        if let Some(config_map) = manifest::config_map(instance) {
            apply(cluster, namespace, &instance.k8s_name, &config_map, Apply::CreateOrUpdate).await?;
        }
        for sidecar in &instance.sidecars.attached {
            let sidecar = super::sidecars::sidecar_instance(sidecar.as_ref())?;
            if let Some(config_map) = manifest::config_map(sidecar) {
                apply(cluster, namespace, &sidecar.k8s_name, &config_map, Apply::CreateOrUpdate)
                    .await
                    .map_err(|err| Error::sidecar(&sidecar.k8s_name, err))?;
            }
        }
        Ok(())
    }
}

/// Destroys each present instance in order, stopping at the first error.
/// Does nothing when any instance's configuration sets `skip_cleanup`.
///
/// # Errors
///
/// Returns the first error raised by [`Execution::destroy`].
pub async fn batch_destroy<'i, I>(ctx: &CallContext, instances: I) -> Result<(), Error>
where
    I: IntoIterator<Item = Option<&'i mut Instance>>,
{
    let instances: Vec<&mut Instance> = instances.into_iter().flatten().collect();
    if instances
        .iter()
        .any(|instance| instance.deps.config().skip_cleanup)
    {
        info!(count = instances.len(), "cleanup skipped by configuration");
        return Ok(());
    }
    for instance in instances {
        instance.execution().destroy(ctx).await?;
    }
    Ok(())
}

/// Returns the name of the first pod backing `instance`'s ReplicaSet (the
/// parent's for a sidecar).
pub(crate) async fn first_pod(instance: &Instance) -> Result<String, Error> {
    let owner = instance.pod_owner();
    let pods = instance
        .deps
        .cluster()
        .list_pods(instance.namespace(), &app_selector(owner))
        .await
        .map_err(|source| Error::cluster("list pods", &instance.k8s_name, source))?;
    pods.into_iter()
        .find_map(|pod| pod.metadata.name)
        .ok_or_else(|| {
            Error::cluster(
                "find pod",
                &instance.k8s_name,
                ClusterError::NotFound {
                    kind: String::from("Pod"),
                    name: owner.to_owned(),
                },
            )
        })
}

async fn replica_set_readiness(
    cluster: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<Readiness, Error> {
    let found = cluster
        .get(namespace, ResourceKind::ReplicaSet, name)
        .await
        .map_err(|source| Error::cluster("get replica set", name, source))?;
    Ok(Readiness::from(
        found
            .as_ref()
            .and_then(Manifest::as_replica_set)
            .is_some_and(manifest::is_ready),
    ))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Apply {
    CreateIfAbsent,
    CreateOrUpdate,
}

async fn apply(
    cluster: &dyn ClusterClient,
    namespace: &str,
    instance: &str,
    manifest: &Manifest,
    mode: Apply,
) -> Result<Manifest, Error> {
    let kind = manifest.kind();
    let name = manifest.name();
    let live = cluster
        .get(namespace, kind, name)
        .await
        .map_err(|source| Error::cluster(format!("get {kind} {name}"), instance, source))?;
    let stored = match (live, mode) {
        (Some(live), Apply::CreateIfAbsent) => live,
        (Some(_), Apply::CreateOrUpdate) => cluster
            .update(namespace, manifest)
            .await
            .map_err(|source| Error::cluster(format!("update {kind} {name}"), instance, source))?,
        (None, _) => cluster
            .create(namespace, manifest)
            .await
            .map_err(|source| Error::cluster(format!("create {kind} {name}"), instance, source))?,
    };
    debug!(instance, kind = kind.as_str(), object = name, "resource applied");
    Ok(stored)
}

/// Creates the volume claim if absent and writes the files ConfigMap.
async fn deploy_owned(
    cluster: &dyn ClusterClient,
    namespace: &str,
    instance: &Instance,
) -> Result<(), Error> {
    let name = instance.k8s_name.as_str();
    if let Some(claim) = manifest::volume_claim(instance) {
        apply(cluster, namespace, name, &claim, Apply::CreateIfAbsent).await?;
    }
    if let Some(config_map) = manifest::config_map(instance) {
        apply(cluster, namespace, name, &config_map, Apply::CreateOrUpdate).await?;
    }
    Ok(())
}

/// Best-effort deletion that remembers the first hard failure.
struct Teardown<'t> {
    cluster: &'t dyn ClusterClient,
    namespace: &'t str,
    instance: &'t str,
    first_error: Option<Error>,
}

impl<'t> Teardown<'t> {
    fn new(cluster: &'t dyn ClusterClient, namespace: &'t str, instance: &'t str) -> Self {
        Self {
            cluster,
            namespace,
            instance,
            first_error: None,
        }
    }

    async fn delete(
        &mut self,
        operation: &'static str,
        kind: ResourceKind,
        name: &str,
        grace: GracePeriod,
    ) {
        match self.cluster.delete(self.namespace, kind, name, grace).await {
            Ok(()) => debug!(instance = self.instance, kind = kind.as_str(), object = name, "deleted"),
            Err(err) if err.is_not_found() => {}
            Err(source) => {
                warn!(
                    instance = self.instance,
                    kind = kind.as_str(),
                    object = name,
                    error = %source,
                    "deletion failed"
                );
                if self.first_error.is_none() {
                    self.first_error = Some(Error::cluster(operation, self.instance, source));
                }
            }
        }
    }

    /// Deletes the volume claim, files ConfigMap and submitted faults of
    /// `owner`.
    async fn delete_owned(&mut self, owner: &Instance) {
        let name = owner.k8s_name.as_str();
        self.delete(
            "delete volume claim",
            ResourceKind::PersistentVolumeClaim,
            &manifest::volume_claim_name(name),
            GracePeriod::Default,
        )
        .await;
        self.delete(
            "delete config map",
            ResourceKind::ConfigMap,
            &manifest::config_map_name(name),
            GracePeriod::Default,
        )
        .await;
        for chaos in &owner.network.chaos_objects {
            self.delete(
                "delete network chaos",
                ResourceKind::Custom(NETWORK_CHAOS),
                chaos,
                GracePeriod::Default,
            )
            .await;
        }
    }

    fn finish(self) -> Result<(), Error> {
        self.first_error.map_or(Ok(()), Err)
    }
}
