//! Utility instance for running commands from inside the cluster.
//!
//! Tests use the executor to reach other instances over the pod network,
//! for example `wget -qO- http://web:80` or `ping`, without exposing them to
//! the host.

use std::sync::Arc;

use tracing::info;

use crate::deps::SystemDependencies;
use crate::error::Error;
use crate::instance::{Instance, InstanceType};
use crate::wait::CallContext;

/// Image providing common network tooling.
pub const EXECUTOR_IMAGE: &str = "docker.io/nicolaka/netshoot:v0.13";

/// Default executor instance name.
pub const EXECUTOR_NAME: &str = "executor";

/// A running [`InstanceType::Executor`] instance.
#[derive(Debug)]
pub struct Executor {
    instance: Instance,
}

impl Executor {
    /// Deploys an executor named [`EXECUTOR_NAME`] and waits until it runs.
    ///
    /// # Errors
    ///
    /// See [`Executor::with_name`].
    pub async fn new(ctx: &CallContext, deps: Arc<SystemDependencies>) -> Result<Self, Error> {
        Self::with_name(ctx, deps, EXECUTOR_NAME).await
    }

    /// Deploys an executor under `name` and waits until it runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceConflict`] when the name is taken and any
    /// error raised while committing or starting the instance.
    pub async fn with_name(
        ctx: &CallContext,
        deps: Arc<SystemDependencies>,
        name: &str,
    ) -> Result<Self, Error> {
        let mut instance = Instance::with_type(name, InstanceType::Executor, deps)?;
        instance.build().set_image(EXECUTOR_IMAGE)?;
        instance.build().commit(ctx).await?;
        instance.build().set_start_command(&["sleep", "infinity"])?;
        instance.execution().start(ctx).await?;
        info!(instance = instance.k8s_name(), "executor running");
        Ok(Self { instance })
    }

    /// Runs `command` in the executor and returns its standard output.
    ///
    /// # Errors
    ///
    /// See [`Execution::execute_command`](crate::instance::execution::Execution::execute_command).
    pub async fn execute_command(&mut self, ctx: &CallContext, command: &[&str]) -> Result<String, Error> {
        self.instance.execution().execute_command(ctx, command).await
    }

    /// Removes the executor's cluster resources.
    ///
    /// # Errors
    ///
    /// See [`Execution::destroy`](crate::instance::execution::Execution::destroy).
    pub async fn destroy(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.instance.execution().destroy(ctx).await
    }

    /// Returns the underlying instance.
    #[must_use]
    pub const fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Returns the underlying instance mutably.
    pub const fn instance_mut(&mut self) -> &mut Instance {
        &mut self.instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ResourceKind;
    use crate::state::InstanceState;
    use crate::test_support::TestHarness;

    #[tokio::test]
    async fn executor_runs_sleep_forever() {
        let harness = TestHarness::new("/tmp/corral-executor").expect("harness");
        let ctx = CallContext::new();
        let mut executor = Executor::new(&ctx, Arc::clone(&harness.deps))
            .await
            .expect("executor starts");

        assert_eq!(executor.instance().state(), InstanceState::Started);
        assert_eq!(executor.instance().instance_type(), InstanceType::Executor);
        let Some(manifest) = harness.cluster.object(ResourceKind::ReplicaSet, "executor") else {
            panic!("executor replica set missing");
        };
        let container = manifest
            .as_replica_set()
            .and_then(|rs| rs.spec.as_ref())
            .and_then(|spec| spec.template.as_ref())
            .and_then(|template| template.spec.as_ref())
            .and_then(|pod| pod.containers.first().cloned())
            .expect("container present");
        assert_eq!(container.image.as_deref(), Some(EXECUTOR_IMAGE));
        assert_eq!(
            container.command,
            Some(vec![String::from("sleep"), String::from("infinity")])
        );

        executor.destroy(&ctx).await.expect("destroy succeeds");
        assert!(!harness.cluster.contains(ResourceKind::ReplicaSet, "executor"));
    }

    #[tokio::test]
    async fn executor_name_is_claimed() {
        let harness = TestHarness::new("/tmp/corral-executor").expect("harness");
        let ctx = CallContext::new();
        let _executor = Executor::new(&ctx, Arc::clone(&harness.deps))
            .await
            .expect("first executor starts");
        let err = Executor::new(&ctx, Arc::clone(&harness.deps))
            .await
            .expect_err("second executor conflicts");
        assert!(matches!(err, Error::ResourceConflict { .. }));
    }
}
