//! Sidecar capability trait and the attached-sidecar aggregate.
//!
//! A sidecar is an instance co-scheduled in its parent's pod. It never hosts
//! sidecars itself and is reachable only through the parent's Service. The
//! parent drives every lifecycle transition; sidecar states simply mirror
//! the parent's.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use crate::deps::SystemDependencies;
use crate::error::Error;
use crate::state::InstanceState;
use crate::wait::CallContext;

use super::{Instance, ParentLink};

/// Future returned by sidecar hooks.
pub type SidecarFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// Companion workload attachable to an instance.
pub trait Sidecar: Send + Sync {
    /// Builds and commits the sidecar's own instance. `parent_name` is the
    /// host's name and is typically used to derive the sidecar's name.
    fn initialize<'a>(
        &'a mut self,
        ctx: &'a CallContext,
        parent_name: &'a str,
        deps: Arc<SystemDependencies>,
    ) -> SidecarFuture<'a, ()>;

    /// Returns the sidecar's instance once initialised.
    fn instance(&self) -> Option<&Instance>;

    /// Returns the sidecar's instance mutably once initialised.
    fn instance_mut(&mut self) -> Option<&mut Instance>;

    /// Runs before the sidecar's resources are deployed.
    fn pre_start<'a>(&'a mut self, _ctx: &'a CallContext) -> SidecarFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Returns a committed copy of this sidecar for the host `parent_name`.
    ///
    /// # Errors
    ///
    /// Implementations return the errors of
    /// [`Instance::clone_with_name`].
    fn clone_for(&self, parent_name: &str) -> Result<Box<dyn Sidecar>, Error>;
}

#[derive(Default)]
pub(crate) struct SidecarSet {
    pub(crate) is_sidecar: bool,
    pub(crate) attached: Vec<Box<dyn Sidecar>>,
}

impl SidecarSet {
    pub(crate) fn names(&self) -> Vec<&str> {
        self.attached
            .iter()
            .map(|sidecar| sidecar_label(sidecar.as_ref()))
            .collect()
    }

    /// Applies `operation` to every sidecar instance, returning the first
    /// error tagged with the sidecar's name.
    pub(crate) fn try_for_each<F>(&self, mut operation: F) -> Result<(), Error>
    where
        F: FnMut(&Instance) -> Result<(), Error>,
    {
        for sidecar in &self.attached {
            let instance = sidecar_instance(sidecar.as_ref())?;
            operation(instance).map_err(|err| Error::sidecar(&instance.k8s_name, err))?;
        }
        Ok(())
    }
}

/// Returns the sidecar's cluster name, or a placeholder before
/// initialisation.
pub(crate) fn sidecar_label(sidecar: &dyn Sidecar) -> &str {
    sidecar
        .instance()
        .map_or("<uninitialised>", |instance| instance.k8s_name.as_str())
}

pub(crate) fn sidecar_instance(sidecar: &dyn Sidecar) -> Result<&Instance, Error> {
    sidecar.instance().ok_or_else(|| Error::Validation {
        instance: String::from("<uninitialised>"),
        field: "sidecar",
        reason: String::from("sidecar has no instance"),
    })
}

/// Validates `sidecar` and attaches it to `host`.
pub(crate) fn attach(host: &mut Instance, mut sidecar: Box<dyn Sidecar>) -> Result<(), Error> {
    let link = ParentLink {
        name: host.name.clone(),
        k8s_name: host.k8s_name.clone(),
    };
    let instance = sidecar.instance_mut().ok_or_else(|| {
        Error::validation(&host.k8s_name, "sidecar", "sidecar did not create an instance")
    })?;
    let label = instance.k8s_name.clone();
    if instance.state != InstanceState::Committed {
        return Err(Error::sidecar(
            &label,
            Error::InvalidStateTransition {
                operation: "attach sidecar",
                instance: label.clone(),
                state: instance.state,
            },
        ));
    }
    if instance.is_sidecar() || !instance.sidecars.attached.is_empty() {
        return Err(Error::sidecar(
            &label,
            Error::validation(&label, "sidecar", "sidecars cannot host sidecars"),
        ));
    }
    instance.sidecars.is_sidecar = true;
    instance.parent = Some(link);
    host.sidecars.attached.push(sidecar);
    Ok(())
}

/// Sidecar operations on an [`Instance`].
pub struct Sidecars<'a> {
    instance: &'a mut Instance,
}

impl<'a> Sidecars<'a> {
    pub(super) const fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    /// Initialises `sidecar` and attaches it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the host is itself a sidecar or the
    /// sidecar hosts sidecars, [`Error::InvalidStateTransition`] outside
    /// `Preparing` or `Committed`, and [`Error::Sidecar`] wrapping any
    /// initialisation failure.
    pub async fn add<S>(&mut self, ctx: &CallContext, sidecar: S) -> Result<(), Error>
    where
        S: Sidecar + 'static,
    {
        if self.instance.is_sidecar() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "sidecar",
                "sidecars cannot host sidecars",
            ));
        }
        self.instance.ensure_state(
            "add sidecar",
            &[InstanceState::Preparing, InstanceState::Committed],
        )?;
        let mut sidecar: Box<dyn Sidecar> = Box::new(sidecar);
        let position = self.instance.sidecars.attached.len();
        sidecar
            .initialize(ctx, &self.instance.name, Arc::clone(&self.instance.deps))
            .await
            .map_err(|err| {
                Error::sidecar(&format!("{}#{position}", self.instance.k8s_name), err)
            })?;
        attach(self.instance, sidecar)?;
        info!(
            instance = self.instance.k8s_name.as_str(),
            sidecars = self.instance.sidecars.attached.len(),
            "sidecar attached"
        );
        Ok(())
    }

    /// Returns the number of attached sidecars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instance.sidecars.attached.len()
    }

    /// Returns `true` when no sidecar is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instance.sidecars.attached.is_empty()
    }

    /// Returns the cluster names of attached sidecars.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.instance.sidecars.names()
    }

    /// Returns the sidecar at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&dyn Sidecar> {
        self.instance.sidecars.attached.get(index).map(|sidecar| &**sidecar)
    }

    /// Returns the sidecar at `index` mutably.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut (dyn Sidecar + 'static)> {
        self.instance
            .sidecars
            .attached
            .get_mut(index)
            .map(|sidecar| &mut **sidecar)
    }

    /// Verifies every sidecar can start with the host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sidecar`] wrapping an
    /// [`Error::InvalidStateTransition`] for the first sidecar outside
    /// `Committed` or `Stopped`.
    pub fn ensure_startable(&self) -> Result<(), Error> {
        self.instance.sidecars.try_for_each(|sidecar| {
            sidecar.ensure_state(
                "start sidecar",
                &[InstanceState::Committed, InstanceState::Stopped],
            )
        })
    }
}
