//! Command-line interface definitions for the `corral` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `corral` binary.
#[derive(Debug, Parser)]
#[command(
    name = "corral",
    about = "Maintain Kubernetes resources created by corral test runs",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Delete every resource labelled with a test scope.
    #[command(name = "sweep", about = "Delete every resource labelled with a test scope")]
    Sweep(SweepCommand),
}

/// Arguments for the `corral sweep` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct SweepCommand {
    /// Namespace holding the scope's resources.
    #[arg(long, env = "CORRAL_NAMESPACE")]
    pub(crate) namespace: String,
    /// Test scope whose `corral.dev/scope` label selects resources.
    #[arg(long, env = "CORRAL_SCOPE")]
    pub(crate) scope: String,
    /// Path to the `kubectl` binary.
    #[arg(long, value_name = "PATH", default_value = "kubectl")]
    pub(crate) kubectl_bin: String,
}
