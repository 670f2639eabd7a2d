//! Test-scope janitor.
//!
//! Every resource an instance creates carries the `corral.dev/scope` label.
//! The janitor lists each swept kind by that label with `kubectl`, deletes
//! what it finds and fails if anything remains afterwards. It is the
//! out-of-band counterpart to instance `destroy` for runs that crashed or
//! set `skip_cleanup`.

use std::collections::BTreeMap;
use std::ffi::OsString;

use thiserror::Error;
use tracing::{debug, info};

use crate::command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
use crate::labels::SCOPE_LABEL;

/// Default `kubectl` binary name.
pub const DEFAULT_KUBECTL_BIN: &str = "kubectl";

/// A namespaced resource kind created by instances.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SweptKind {
    /// Plural resource name as understood by `kubectl`.
    pub resource: &'static str,
    /// API group; empty for the core group.
    pub api_group: &'static str,
}

/// Kinds removed by a sweep, workloads first.
pub const SWEPT_KINDS: &[SweptKind] = &[
    SweptKind {
        resource: "replicasets",
        api_group: "apps",
    },
    SweptKind {
        resource: "services",
        api_group: "",
    },
    SweptKind {
        resource: "configmaps",
        api_group: "",
    },
    SweptKind {
        resource: "persistentvolumeclaims",
        api_group: "",
    },
    SweptKind {
        resource: "serviceaccounts",
        api_group: "",
    },
    SweptKind {
        resource: "roles",
        api_group: "rbac.authorization.k8s.io",
    },
    SweptKind {
        resource: "rolebindings",
        api_group: "rbac.authorization.k8s.io",
    },
    SweptKind {
        resource: "networkpolicies",
        api_group: "networking.k8s.io",
    },
    SweptKind {
        resource: "networkchaos",
        api_group: "chaos-mesh.org",
    },
];

/// Configuration for a janitor sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JanitorConfig {
    /// Namespace holding the scope's resources.
    pub namespace: String,
    /// Test scope whose label selects resources.
    pub scope: String,
    /// Path to the `kubectl` binary.
    pub kubectl_bin: String,
}

impl JanitorConfig {
    /// Constructs a config, trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::InvalidConfig`] when any field is blank.
    pub fn new(
        namespace: impl Into<String>,
        scope: impl Into<String>,
        kubectl_bin: impl Into<String>,
    ) -> Result<Self, JanitorError> {
        let namespace = required("namespace", namespace.into())?;
        let scope = required("scope", scope.into())?;
        let kubectl_bin = required("kubectl_bin", kubectl_bin.into())?;
        Ok(Self {
            namespace,
            scope,
            kubectl_bin,
        })
    }

    /// Returns the label selector matching this scope.
    #[must_use]
    pub fn selector(&self) -> String {
        format!("{SCOPE_LABEL}={}", self.scope)
    }
}

fn required(field: &str, value: String) -> Result<String, JanitorError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(JanitorError::InvalidConfig {
            field: field.to_owned(),
        });
    }
    Ok(trimmed.to_owned())
}

/// Deleted object counts keyed by resource kind.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Number of objects deleted per kind. Kinds with nothing to delete are
    /// omitted.
    pub deleted: BTreeMap<String, usize>,
}

impl SweepSummary {
    /// Returns the number of objects deleted across every kind.
    #[must_use]
    pub fn total(&self) -> usize {
        self.deleted.values().sum()
    }
}

/// Errors returned by the janitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JanitorError {
    /// Raised when configuration is missing required values.
    #[error("missing {field}")]
    InvalidConfig {
        /// Name of the missing or invalid field.
        field: String,
    },
    /// Raised when `kubectl` returns a non-zero exit status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed (typically `kubectl`).
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when resources remain after the sweep.
    #[error("resources remain after janitor sweep: {message}")]
    NotClean {
        /// Human-readable description of what remains.
        message: String,
    },
    /// Raised when command execution fails.
    #[error(transparent)]
    Runner(#[from] CommandError),
}

/// Deletes scope-labelled resources by shelling out to `kubectl`.
#[derive(Clone, Debug)]
pub struct Janitor<R: CommandRunner> {
    config: JanitorConfig,
    runner: R,
}

impl Janitor<ProcessCommandRunner> {
    /// Creates a janitor wired to the real process runner.
    #[must_use]
    pub const fn with_process_runner(config: JanitorConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> Janitor<R> {
    /// Creates a new janitor using the provided configuration and runner.
    #[must_use]
    pub const fn new(config: JanitorConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Deletes every labelled object of every swept kind and verifies none
    /// remain.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError`] when `kubectl` fails or labelled objects
    /// remain after deletion.
    pub fn sweep(&self) -> Result<SweepSummary, JanitorError> {
        let mut summary = SweepSummary::default();
        for kind in SWEPT_KINDS {
            let names = self.list(kind)?;
            for name in &names {
                self.delete(name)?;
            }
            if !names.is_empty() {
                debug!(kind = kind.resource, count = names.len(), "swept");
                summary.deleted.insert(kind.resource.to_owned(), names.len());
            }
        }

        let mut remaining = Vec::new();
        for kind in SWEPT_KINDS {
            remaining.extend(self.list(kind)?);
        }
        if !remaining.is_empty() {
            return Err(JanitorError::NotClean {
                message: remaining.join(", "),
            });
        }

        info!(
            scope = self.config.scope.as_str(),
            deleted = summary.total(),
            "janitor sweep complete"
        );
        Ok(summary)
    }

    /// Returns `kind/name` entries for labelled objects of `kind`.
    fn list(&self, kind: &SweptKind) -> Result<Vec<String>, JanitorError> {
        let args = [
            OsString::from("get"),
            OsString::from(kind.resource),
            OsString::from("-n"),
            OsString::from(&self.config.namespace),
            OsString::from("-l"),
            OsString::from(self.config.selector()),
            OsString::from("-o"),
            OsString::from("name"),
        ];
        let output = self.run(&args, kind.resource)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn delete(&self, name: &str) -> Result<CommandOutput, JanitorError> {
        let args = [
            OsString::from("delete"),
            OsString::from(name),
            OsString::from("-n"),
            OsString::from(&self.config.namespace),
            OsString::from("--ignore-not-found"),
        ];
        self.run(&args, name)
    }

    /// Runs `kubectl` and converts a failing exit status into an error.
    fn run(&self, args: &[OsString], resource: &str) -> Result<CommandOutput, JanitorError> {
        let output = self.runner.run(&self.config.kubectl_bin, args)?;
        if output.is_success() {
            return Ok(output);
        }

        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(JanitorError::CommandFailure {
            program: self.config.kubectl_bin.clone(),
            status: output.code,
            status_text,
            stderr: format!("{resource}: {}", output.stderr),
        })
    }
}

#[cfg(test)]
mod tests;
