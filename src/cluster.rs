//! Cluster client abstraction and the typed manifests it operates on.
//!
//! The orchestration engine never talks to the Kubernetes API directly. It
//! submits [`Manifest`] values through a [`ClusterClient`], which keeps the
//! engine testable against the in-memory double in
//! [`crate::test_support`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use thiserror::Error;

/// Future returned by cluster operations.
pub type ClusterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClusterError>> + Send + 'a>>;

/// Identifies a custom resource type by group, version and plural name.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CustomResourceRef {
    /// API group (for example `chaos-mesh.org`).
    pub group: &'static str,
    /// API version within the group.
    pub version: &'static str,
    /// Plural resource name used in request paths.
    pub resource: &'static str,
    /// Object kind written into the body.
    pub kind: &'static str,
}

impl CustomResourceRef {
    /// Returns `group/version` as used in an object's `apiVersion`.
    #[must_use]
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

/// An untyped custom object.
#[derive(Clone, Debug, PartialEq)]
pub struct CustomObject {
    /// Resource type of the object.
    pub resource: CustomResourceRef,
    /// Object name within the namespace.
    pub name: String,
    /// Full object body including `apiVersion`, `kind`, `metadata`, `spec`
    /// and, when read back, `status`.
    pub body: serde_json::Value,
}

/// Resource kinds the engine creates and deletes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResourceKind {
    /// `apps/v1` ReplicaSet.
    ReplicaSet,
    /// `v1` Service.
    Service,
    /// `v1` ConfigMap.
    ConfigMap,
    /// `v1` PersistentVolumeClaim.
    PersistentVolumeClaim,
    /// `v1` ServiceAccount.
    ServiceAccount,
    /// `rbac.authorization.k8s.io/v1` Role.
    Role,
    /// `rbac.authorization.k8s.io/v1` RoleBinding.
    RoleBinding,
    /// `networking.k8s.io/v1` NetworkPolicy.
    NetworkPolicy,
    /// A custom resource.
    Custom(CustomResourceRef),
}

impl ResourceKind {
    /// Returns the lowercase resource name used in logs and `kubectl`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReplicaSet => "replicaset",
            Self::Service => "service",
            Self::ConfigMap => "configmap",
            Self::PersistentVolumeClaim => "persistentvolumeclaim",
            Self::ServiceAccount => "serviceaccount",
            Self::Role => "role",
            Self::RoleBinding => "rolebinding",
            Self::NetworkPolicy => "networkpolicy",
            Self::Custom(resource) => resource.resource,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed resource submitted to or read from the cluster.
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    /// Workload controller.
    ReplicaSet(ReplicaSet),
    /// Stable network identity.
    Service(Service),
    /// Files mounted into containers.
    ConfigMap(ConfigMap),
    /// Persistent storage claim.
    PersistentVolumeClaim(PersistentVolumeClaim),
    /// Pod identity for RBAC.
    ServiceAccount(ServiceAccount),
    /// Namespaced permissions.
    Role(Role),
    /// Binds a role to a service account.
    RoleBinding(RoleBinding),
    /// Network isolation policy.
    NetworkPolicy(NetworkPolicy),
    /// Custom resource such as a chaos experiment.
    Custom(CustomObject),
}

impl Manifest {
    /// Returns the object name, or an empty string when unset.
    #[must_use]
    pub fn name(&self) -> &str {
        let name = match self {
            Self::ReplicaSet(obj) => obj.metadata.name.as_deref(),
            Self::Service(obj) => obj.metadata.name.as_deref(),
            Self::ConfigMap(obj) => obj.metadata.name.as_deref(),
            Self::PersistentVolumeClaim(obj) => obj.metadata.name.as_deref(),
            Self::ServiceAccount(obj) => obj.metadata.name.as_deref(),
            Self::Role(obj) => obj.metadata.name.as_deref(),
            Self::RoleBinding(obj) => obj.metadata.name.as_deref(),
            Self::NetworkPolicy(obj) => obj.metadata.name.as_deref(),
            Self::Custom(obj) => Some(obj.name.as_str()),
        };
        name.unwrap_or_default()
    }

    /// Returns the kind of this manifest.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::ReplicaSet(_) => ResourceKind::ReplicaSet,
            Self::Service(_) => ResourceKind::Service,
            Self::ConfigMap(_) => ResourceKind::ConfigMap,
            Self::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            Self::ServiceAccount(_) => ResourceKind::ServiceAccount,
            Self::Role(_) => ResourceKind::Role,
            Self::RoleBinding(_) => ResourceKind::RoleBinding,
            Self::NetworkPolicy(_) => ResourceKind::NetworkPolicy,
            Self::Custom(obj) => ResourceKind::Custom(obj.resource),
        }
    }

    /// Returns the ReplicaSet when this manifest holds one.
    #[must_use]
    pub const fn as_replica_set(&self) -> Option<&ReplicaSet> {
        match self {
            Self::ReplicaSet(obj) => Some(obj),
            _ => None,
        }
    }

    /// Returns the Service when this manifest holds one.
    #[must_use]
    pub const fn as_service(&self) -> Option<&Service> {
        match self {
            Self::Service(obj) => Some(obj),
            _ => None,
        }
    }

    /// Returns the custom object when this manifest holds one.
    #[must_use]
    pub const fn as_custom(&self) -> Option<&CustomObject> {
        match self {
            Self::Custom(obj) => Some(obj),
            _ => None,
        }
    }
}

/// Grace period applied when deleting a resource.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum GracePeriod {
    /// The cluster's default grace period.
    #[default]
    Default,
    /// Zero-second grace period; pods are killed immediately.
    Immediate,
}

/// Output captured from a command executed inside a container.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Errors raised by cluster clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClusterError {
    /// The named object does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind that was requested.
        kind: String,
        /// Object name.
        name: String,
    },
    /// An object with the same name already exists.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind that was submitted.
        kind: String,
        /// Object name.
        name: String,
    },
    /// Any other API failure.
    #[error("cluster API error: {message}")]
    Api {
        /// Error message from the API server.
        message: String,
    },
    /// Command execution inside a container failed to run.
    #[error("exec failed: {message}")]
    Exec {
        /// Error message from the exec stream.
        message: String,
    },
    /// Port forwarding could not be established.
    #[error("port forward failed: {message}")]
    PortForward {
        /// Error message from the forwarder.
        message: String,
    },
}

impl ClusterError {
    /// Returns `true` for [`ClusterError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Minimal Kubernetes client used by the orchestration engine.
pub trait ClusterClient: Send + Sync {
    /// Creates `manifest` in `namespace` and returns the stored object.
    fn create<'a>(&'a self, namespace: &'a str, manifest: &'a Manifest)
    -> ClusterFuture<'a, Manifest>;

    /// Replaces an existing object with `manifest`.
    fn update<'a>(&'a self, namespace: &'a str, manifest: &'a Manifest)
    -> ClusterFuture<'a, Manifest>;

    /// Reads an object, returning `None` when it does not exist.
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        kind: ResourceKind,
        name: &'a str,
    ) -> ClusterFuture<'a, Option<Manifest>>;

    /// Deletes an object. Missing objects yield [`ClusterError::NotFound`].
    fn delete<'a>(
        &'a self,
        namespace: &'a str,
        kind: ResourceKind,
        name: &'a str,
        grace: GracePeriod,
    ) -> ClusterFuture<'a, ()>;

    /// Lists pods matching a label selector such as `app=web`.
    fn list_pods<'a>(&'a self, namespace: &'a str, selector: &'a str) -> ClusterFuture<'a, Vec<Pod>>;

    /// Runs `command` in `container` of `pod` and captures its output.
    fn exec<'a>(
        &'a self,
        namespace: &'a str,
        pod: &'a str,
        container: &'a str,
        command: &'a [String],
    ) -> ClusterFuture<'a, ExecOutput>;

    /// Forwards `local_port` on the loopback interface to `remote_port` of
    /// `pod`. The forward stays open for the lifetime of the client.
    fn port_forward<'a>(
        &'a self,
        namespace: &'a str,
        pod: &'a str,
        local_port: u16,
        remote_port: u16,
    ) -> ClusterFuture<'a, ()>;
}
