//! The instance aggregate: identity, lifecycle state and owned configuration.
//!
//! An [`Instance`] accumulates configuration through short-lived handles
//! ([`Instance::build`], [`Instance::network`], ...) that borrow it mutably.
//! Each handle method checks the instance state before touching anything,
//! so a rejected call never leaves partial changes behind.

pub mod build;
pub mod chaos;
pub mod container_sidecar;
pub mod execution;
mod manifest;
pub mod monitoring;
pub mod network;
pub mod pool;
pub mod resources;
pub mod security;
pub mod sidecars;
pub mod storage;

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::deps::SystemDependencies;
use crate::error::Error;
use crate::state::{InstanceState, ensure_state};

use build::{Build, BuildConfig};
use chaos::Chaos;
use execution::Execution;
use monitoring::{Monitoring, MonitoringConfig};
use network::{Network, NetworkConfig};
use resources::{Resources, ResourcesConfig};
use security::{Security, SecurityConfig};
use sidecars::{SidecarSet, Sidecars};
use storage::{Storage, StorageConfig};

const MAX_NAME_LEN: usize = 63;

/// Role an instance plays within a test.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum InstanceType {
    /// A workload under test.
    #[default]
    Basic,
    /// Utility container used to run checks against other instances.
    Executor,
    /// In-cluster deadline that deletes the test scope's resources.
    TimeoutHandler,
}

impl InstanceType {
    /// Returns the label value for this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Executor => "executor",
            Self::TimeoutHandler => "timeout-handler",
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names of the instance hosting a sidecar. Never implies ownership.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ParentLink {
    pub(crate) name: String,
    pub(crate) k8s_name: String,
}

/// A disposable workload and everything needed to deploy it.
pub struct Instance {
    name: String,
    k8s_name: String,
    state: InstanceState,
    instance_type: InstanceType,
    build: BuildConfig,
    network: NetworkConfig,
    storage: StorageConfig,
    resources: ResourcesConfig,
    security: SecurityConfig,
    monitoring: MonitoringConfig,
    sidecars: SidecarSet,
    parent: Option<ParentLink>,
    deps: Arc<SystemDependencies>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("k8s_name", &self.k8s_name)
            .field("state", &self.state)
            .field("instance_type", &self.instance_type)
            .field("image", &self.build.image_name)
            .field("sidecars", &self.sidecars.names())
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Creates a [`InstanceType::Basic`] instance and claims its cluster
    /// name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `name` has no usable characters and
    /// [`Error::ResourceConflict`] when the sanitised name is already taken.
    pub fn new(name: impl Into<String>, deps: Arc<SystemDependencies>) -> Result<Self, Error> {
        Self::with_type(name, InstanceType::Basic, deps)
    }

    /// Creates an instance of the given type and claims its cluster name.
    ///
    /// # Errors
    ///
    /// See [`Instance::new`].
    pub fn with_type(
        name: impl Into<String>,
        instance_type: InstanceType,
        deps: Arc<SystemDependencies>,
    ) -> Result<Self, Error> {
        let name = name.into();
        let k8s_name = sanitize_name(&name);
        if k8s_name.is_empty() {
            return Err(Error::validation(
                &name,
                "name",
                "must contain at least one letter or digit",
            ));
        }
        deps.names().register(&k8s_name)?;
        debug!(instance = k8s_name.as_str(), kind = instance_type.as_str(), "instance created");
        Ok(Self {
            name,
            k8s_name,
            state: InstanceState::None,
            instance_type,
            build: BuildConfig::default(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            resources: ResourcesConfig::default(),
            security: SecurityConfig::default(),
            monitoring: MonitoringConfig::default(),
            sidecars: SidecarSet::default(),
            parent: None,
            deps,
        })
    }

    /// Returns the name the instance was created with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the sanitised name used for every cluster resource.
    #[must_use]
    pub fn k8s_name(&self) -> &str {
        &self.k8s_name
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> InstanceState {
        self.state
    }

    /// Returns the instance type.
    #[must_use]
    pub const fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    /// Returns `true` when this instance is attached to a parent as a
    /// sidecar.
    #[must_use]
    pub const fn is_sidecar(&self) -> bool {
        self.sidecars.is_sidecar
    }

    /// Returns the parent's name when attached as a sidecar.
    #[must_use]
    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_ref().map(|parent| parent.name.as_str())
    }

    /// Returns the shared dependencies.
    #[must_use]
    pub const fn deps(&self) -> &Arc<SystemDependencies> {
        &self.deps
    }

    /// Image, command and environment configuration.
    pub fn build(&mut self) -> Build<'_> {
        Build::new(self)
    }

    /// Ports, proxy hosts, port forwarding and network isolation.
    pub fn network(&mut self) -> Network<'_> {
        Network::new(self)
    }

    /// Files and the persistent volume.
    pub fn storage(&mut self) -> Storage<'_> {
        Storage::new(self)
    }

    /// CPU and memory requirements plus RBAC rules.
    pub fn resources(&mut self) -> Resources<'_> {
        Resources::new(self)
    }

    /// Privileged mode and Linux capabilities.
    pub fn security(&mut self) -> Security<'_> {
        Security::new(self)
    }

    /// Liveness, readiness and startup probes.
    pub fn monitoring(&mut self) -> Monitoring<'_> {
        Monitoring::new(self)
    }

    /// Attached sidecars.
    pub fn sidecars(&mut self) -> Sidecars<'_> {
        Sidecars::new(self)
    }

    /// Start, stop, destroy and command execution.
    pub fn execution(&mut self) -> Execution<'_> {
        Execution::new(self)
    }

    /// Network fault injection.
    pub fn chaos(&mut self) -> Chaos<'_> {
        Chaos::new(self)
    }

    /// Returns a committed copy of this instance under a new name.
    ///
    /// Configuration is deep-copied; cached cluster objects and submitted
    /// faults are not. Sidecars are cloned through
    /// [`Sidecar::clone_for`](sidecars::Sidecar::clone_for) and attached to
    /// the copy. Cloning a sidecar yields a detached instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless the instance is
    /// committed, plus any naming error from [`Instance::new`].
    pub fn clone_with_name(&self, name: impl Into<String>) -> Result<Self, Error> {
        ensure_state("clone", &self.k8s_name, self.state, &[InstanceState::Committed])?;
        let mut clone = Self::with_type(name, self.instance_type, Arc::clone(&self.deps))?;
        clone.state = InstanceState::Committed;
        clone.build = self.build.clone();
        clone.network = self.network.clone_config();
        clone.storage = self.storage.clone();
        clone.resources = self.resources.clone();
        clone.security = self.security.clone();
        clone.monitoring = self.monitoring.clone();
        for sidecar in &self.sidecars.attached {
            let copy = sidecar
                .clone_for(&clone.name)
                .map_err(|err| Error::sidecar(sidecars::sidecar_label(sidecar.as_ref()), err))?;
            sidecars::attach(&mut clone, copy)?;
        }
        debug!(
            instance = clone.k8s_name.as_str(),
            template = self.k8s_name.as_str(),
            "instance cloned"
        );
        Ok(clone)
    }

    /// Sets the state and mirrors it onto every attached sidecar.
    pub(crate) fn set_state(&mut self, state: InstanceState) {
        self.state = state;
        for sidecar in &mut self.sidecars.attached {
            if let Some(instance) = sidecar.instance_mut() {
                instance.state = state;
            }
        }
    }

    pub(crate) fn ensure_state(
        &self,
        operation: &'static str,
        allowed: &[InstanceState],
    ) -> Result<(), Error> {
        ensure_state(operation, &self.k8s_name, self.state, allowed)
    }

    /// Returns the cluster name of the instance that owns the pod: the
    /// parent for sidecars, otherwise this instance.
    pub(crate) fn pod_owner(&self) -> &str {
        self.parent
            .as_ref()
            .map_or(self.k8s_name.as_str(), |parent| parent.k8s_name.as_str())
    }

    pub(crate) fn namespace(&self) -> &str {
        self.deps.namespace()
    }

    /// Returns the instances sharing this instance's pod: itself followed by
    /// every attached sidecar.
    pub(crate) fn pod_members(&self) -> Vec<&Self> {
        std::iter::once(self)
            .chain(
                self.sidecars
                    .attached
                    .iter()
                    .filter_map(|sidecar| sidecar.instance()),
            )
            .collect()
    }
}

/// Lowercases `name` and replaces anything outside `[a-z0-9-]` with `-`,
/// trimming dashes and truncating to a DNS label.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| {
            let lower = c.to_ascii_lowercase();
            if lower.is_ascii_lowercase() || lower.is_ascii_digit() {
                lower
            } else {
                '-'
            }
        })
        .collect();
    let truncated: String = mapped.trim_matches('-').chars().take(MAX_NAME_LEN).collect();
    truncated.trim_end_matches('-').to_owned()
}

/// Joins a sanitized `base` and `suffix` with a dash, shortening `base` so
/// the result still fits a DNS label.
pub(crate) fn derived_name(base: &str, suffix: &str) -> String {
    let room = MAX_NAME_LEN.saturating_sub(suffix.len().saturating_add(1));
    let head: String = base.chars().take(room).collect();
    format!("{}-{suffix}", head.trim_end_matches('-'))
}

#[cfg(test)]
mod tests;
