//! Error taxonomy for instance orchestration.
//!
//! Every collaborator failure is wrapped together with the operation and the
//! cluster-facing instance name so callers can tell exactly which step
//! failed. [`Error::kind`] collapses the variants into the coarse categories
//! tests and callers branch on.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::image::BuildError;
use crate::proxy::ProxyError;
use crate::state::InstanceState;

/// Coarse error categories.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// An operation was attempted outside its legal state set.
    InvalidStateTransition,
    /// Malformed input such as an out-of-range port or a second volume.
    Validation,
    /// An instance name collided with one already registered.
    ResourceConflict,
    /// A cluster, builder, proxy or filesystem collaborator failed.
    DependencyFailure,
    /// A wait loop's context was cancelled or its deadline elapsed.
    Timeout,
}

/// Errors raised by instances, sidecars and pools.
#[derive(Debug, Error)]
pub enum Error {
    /// Raised when an operation is invoked outside its legal states.
    #[error("cannot {operation} instance {instance} in state {state}")]
    InvalidStateTransition {
        /// Operation that was attempted.
        operation: &'static str,
        /// Cluster-facing instance name.
        instance: String,
        /// State the instance was in.
        state: InstanceState,
    },
    /// Raised when caller input is rejected before any side effect.
    #[error("invalid {field} for instance {instance}: {reason}")]
    Validation {
        /// Cluster-facing instance name.
        instance: String,
        /// Name of the rejected input.
        field: &'static str,
        /// Human-readable explanation.
        reason: String,
    },
    /// Raised when an instance name is already registered.
    #[error("instance name {name} is already registered")]
    ResourceConflict {
        /// Sanitised name that collided.
        name: String,
    },
    /// Wrapper for cluster client failures.
    #[error("{operation} failed for instance {instance}: {source}")]
    Cluster {
        /// Step that failed (for example `create configmap web-files`).
        operation: String,
        /// Cluster-facing instance name.
        instance: String,
        /// Underlying client error.
        #[source]
        source: ClusterError,
    },
    /// Wrapper for image builder failures.
    #[error("image build failed for instance {instance}: {source}")]
    Build {
        /// Cluster-facing instance name.
        instance: String,
        /// Underlying builder error.
        #[source]
        source: BuildError,
    },
    /// Wrapper for proxy registrar failures.
    #[error("proxy {operation} failed for instance {instance}: {source}")]
    Proxy {
        /// Step that failed.
        operation: &'static str,
        /// Cluster-facing instance name.
        instance: String,
        /// Underlying proxy error.
        #[source]
        source: ProxyError,
    },
    /// Raised when staging files into the build directory fails.
    #[error("failed to stage {path} for instance {instance}: {message}")]
    Staging {
        /// Cluster-facing instance name.
        instance: String,
        /// Path being read or written.
        path: Utf8PathBuf,
        /// Error message from the filesystem.
        message: String,
    },
    /// Raised when port forwarding keeps failing after every retry.
    #[error("port forward to {instance}:{port} failed after {attempts} attempts: {source}")]
    PortForward {
        /// Cluster-facing instance name.
        instance: String,
        /// Remote port that was targeted.
        port: u16,
        /// Number of attempts made.
        attempts: u32,
        /// Last error reported by the client.
        #[source]
        source: ClusterError,
    },
    /// Raised when a command run inside a container writes to stderr.
    #[error("command `{command}` failed in instance {instance}: {stderr}")]
    CommandFailed {
        /// Cluster-facing instance name.
        instance: String,
        /// Command line that was executed.
        command: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when a wait loop's context is cancelled or expires.
    #[error("timed out waiting for {action} on instance {instance}")]
    Timeout {
        /// Condition being waited on.
        action: &'static str,
        /// Cluster-facing instance name.
        instance: String,
    },
    /// Raised when an operation fanned out to a sidecar fails.
    #[error("sidecar {sidecar}: {source}")]
    Sidecar {
        /// Name of the offending sidecar instance.
        sidecar: String,
        /// Error reported for that sidecar.
        #[source]
        source: Box<Error>,
    },
    /// Raised when dependency configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Returns the coarse category of this error. Sidecar errors report the
    /// category of the wrapped error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::Validation { .. } | Self::Config(_) => ErrorKind::Validation,
            Self::ResourceConflict { .. } => ErrorKind::ResourceConflict,
            Self::Cluster { .. }
            | Self::Build { .. }
            | Self::Proxy { .. }
            | Self::Staging { .. }
            | Self::PortForward { .. }
            | Self::CommandFailed { .. } => ErrorKind::DependencyFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Sidecar { source, .. } => source.kind(),
        }
    }

    pub(crate) fn validation(
        instance: &str,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            instance: instance.to_owned(),
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn cluster(
        operation: impl Into<String>,
        instance: &str,
        source: ClusterError,
    ) -> Self {
        Self::Cluster {
            operation: operation.into(),
            instance: instance.to_owned(),
            source,
        }
    }

    pub(crate) fn timeout(action: &'static str, instance: &str) -> Self {
        Self::Timeout {
            action,
            instance: instance.to_owned(),
        }
    }

    pub(crate) fn sidecar(sidecar: &str, source: Self) -> Self {
        Self::Sidecar {
            sidecar: sidecar.to_owned(),
            source: Box::new(source),
        }
    }
}
