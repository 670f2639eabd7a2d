//! Disposable Kubernetes workloads for integration tests.
//!
//! An [`Instance`] describes one workload: its image, ports, files, volume,
//! resource limits, security settings, probes and sidecars. Tests drive it
//! through the lifecycle `None → Preparing → Committed → Started ⇄ Stopped →
//! Destroyed`; every operation checks the current state before touching the
//! cluster. Committed images are content-addressed and shared across
//! instances through the [`ImageCache`] held by [`SystemDependencies`].
//!
//! Cluster access, image building and proxy registration sit behind the
//! [`ClusterClient`], [`ImageBuilder`] and [`ProxyRegistrar`] traits so the
//! engine can run against the in-memory doubles in [`test_support`].

pub mod cluster;
pub mod command;
pub mod config;
pub mod deps;
pub mod error;
pub mod executor;
pub mod image;
pub mod instance;
pub mod janitor;
pub mod labels;
pub mod proxy;
pub mod staging;
pub mod state;
pub mod test_support;
pub mod timeout_handler;
pub mod wait;

pub use cluster::{
    ClusterClient, ClusterError, CustomObject, CustomResourceRef, ExecOutput, GracePeriod,
    Manifest, ResourceKind,
};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, CorralConfig};
pub use deps::{SystemDependencies, SystemDependenciesBuilder, TestScope, Timings};
pub use error::{Error, ErrorKind};
pub use executor::Executor;
pub use image::{BuildError, BuildPlan, GitRepoSource, ImageBuilder, ImageCache};
pub use instance::build::ImagePullPolicy;
pub use instance::container_sidecar::ContainerSidecar;
pub use instance::execution::batch_destroy;
pub use instance::pool::InstancePool;
pub use instance::sidecars::Sidecar;
pub use instance::{Instance, InstanceType, sanitize_name};
pub use janitor::{Janitor, JanitorConfig, JanitorError, SweepSummary};
pub use proxy::{ProxyError, ProxyRegistrar};
pub use state::InstanceState;
pub use timeout_handler::TimeoutHandler;
pub use wait::CallContext;
