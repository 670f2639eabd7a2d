//! Groups of identical instances cloned from a committed template.

use tracing::info;

use crate::error::Error;
use crate::state::InstanceState;
use crate::wait::CallContext;

use super::{Instance, derived_name};

/// Instances cloned from one template, driven sequentially.
///
/// Every fan-out stops at the first failing member; later members are not
/// touched.
#[derive(Debug)]
pub struct InstancePool {
    instances: Vec<Instance>,
}

impl Instance {
    /// Consumes this committed template into `amount` clones named
    /// `{name}-0` to `{name}-{amount-1}`. Long template names are shortened
    /// so the index always survives. The template is marked `Destroyed`
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when `amount` is zero,
    /// [`Error::InvalidStateTransition`] unless the template is committed,
    /// and any error from [`Instance::clone_with_name`].
    pub fn new_pool(&mut self, amount: usize) -> Result<InstancePool, Error> {
        self.ensure_state("create pool", &[InstanceState::Committed])?;
        if amount == 0 {
            return Err(Error::validation(
                &self.k8s_name,
                "pool size",
                "must be at least one",
            ));
        }
        let instances = (0..amount)
            .map(|index| self.clone_with_name(derived_name(&self.k8s_name, &index.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        self.set_state(InstanceState::Destroyed);
        info!(template = self.k8s_name.as_str(), amount, "instance pool created");
        Ok(InstancePool { instances })
    }
}

impl InstancePool {
    /// Returns the members in creation order.
    #[must_use]
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Returns the members mutably.
    pub fn instances_mut(&mut self) -> &mut [Instance] {
        &mut self.instances
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns `true` when the pool has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Releases the members.
    #[must_use]
    pub fn into_instances(self) -> Vec<Instance> {
        self.instances
    }

    /// Starts every member and waits for each to become ready.
    ///
    /// # Errors
    ///
    /// Returns the first member error from
    /// [`Execution::start`](super::execution::Execution::start).
    pub async fn start(&mut self, ctx: &CallContext) -> Result<(), Error> {
        for instance in &mut self.instances {
            instance.execution().start(ctx).await?;
        }
        Ok(())
    }

    /// Deploys every member without waiting for readiness.
    ///
    /// # Errors
    ///
    /// Returns the first member error from
    /// [`Execution::start_async`](super::execution::Execution::start_async).
    pub async fn start_without_wait(&mut self, ctx: &CallContext) -> Result<(), Error> {
        for instance in &mut self.instances {
            instance.execution().start_async(ctx).await?;
        }
        Ok(())
    }

    /// Waits until every member reports ready.
    ///
    /// # Errors
    ///
    /// Returns the first member error from
    /// [`Execution::wait_instance_is_running`](super::execution::Execution::wait_instance_is_running).
    pub async fn wait_instance_pool_is_running(&mut self, ctx: &CallContext) -> Result<(), Error> {
        for instance in &mut self.instances {
            instance.execution().wait_instance_is_running(ctx).await?;
        }
        Ok(())
    }

    /// Destroys every member.
    ///
    /// # Errors
    ///
    /// Returns the first member error from
    /// [`Execution::destroy`](super::execution::Execution::destroy).
    pub async fn destroy(&mut self, ctx: &CallContext) -> Result<(), Error> {
        for instance in &mut self.instances {
            instance.execution().destroy(ctx).await?;
        }
        Ok(())
    }
}
