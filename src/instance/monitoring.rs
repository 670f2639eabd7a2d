//! Health probes passed through to the container spec.

use k8s_openapi::api::core::v1::Probe;

use crate::error::Error;
use crate::state::InstanceState;

use super::Instance;

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct MonitoringConfig {
    pub(crate) liveness: Option<Probe>,
    pub(crate) readiness: Option<Probe>,
    pub(crate) startup: Option<Probe>,
}

/// Probe operations on an [`Instance`].
pub struct Monitoring<'a> {
    instance: &'a mut Instance,
}

const PROBE_STATES: &[InstanceState] = &[InstanceState::Preparing, InstanceState::Committed];

impl<'a> Monitoring<'a> {
    pub(super) const fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    /// Sets the liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing` or
    /// `Committed`.
    pub fn set_liveness_probe(&mut self, probe: Probe) -> Result<(), Error> {
        self.instance.ensure_state("set liveness probe", PROBE_STATES)?;
        self.instance.monitoring.liveness = Some(probe);
        Ok(())
    }

    /// Sets the readiness probe.
    ///
    /// # Errors
    ///
    /// See [`Monitoring::set_liveness_probe`].
    pub fn set_readiness_probe(&mut self, probe: Probe) -> Result<(), Error> {
        self.instance.ensure_state("set readiness probe", PROBE_STATES)?;
        self.instance.monitoring.readiness = Some(probe);
        Ok(())
    }

    /// Sets the startup probe.
    ///
    /// # Errors
    ///
    /// See [`Monitoring::set_liveness_probe`].
    pub fn set_startup_probe(&mut self, probe: Probe) -> Result<(), Error> {
        self.instance.ensure_state("set startup probe", PROBE_STATES)?;
        self.instance.monitoring.startup = Some(probe);
        Ok(())
    }

    /// Returns the liveness probe.
    #[must_use]
    pub fn liveness_probe(&self) -> Option<&Probe> {
        self.instance.monitoring.liveness.as_ref()
    }

    /// Returns the readiness probe.
    #[must_use]
    pub fn readiness_probe(&self) -> Option<&Probe> {
        self.instance.monitoring.readiness.as_ref()
    }

    /// Returns the startup probe.
    #[must_use]
    pub fn startup_probe(&self) -> Option<&Probe> {
        self.instance.monitoring.startup.as_ref()
    }
}
