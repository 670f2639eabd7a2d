//! Container security context.

use crate::error::Error;
use crate::state::InstanceState;

use super::Instance;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct SecurityConfig {
    pub(crate) privileged: bool,
    pub(crate) capabilities: Vec<String>,
}

/// Security operations on an [`Instance`].
pub struct Security<'a> {
    instance: &'a mut Instance,
}

const SECURITY_STATES: &[InstanceState] = &[InstanceState::Preparing, InstanceState::Committed];

impl<'a> Security<'a> {
    pub(super) const fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    /// Runs the container privileged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing` or
    /// `Committed`.
    pub fn set_privileged(&mut self, privileged: bool) -> Result<(), Error> {
        self.instance.ensure_state("set privileged", SECURITY_STATES)?;
        self.instance.security.privileged = privileged;
        Ok(())
    }

    /// Adds a Linux capability such as `NET_ADMIN`. Duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing` or
    /// `Committed`, and [`Error::Validation`] for an empty name.
    pub fn add_capability(&mut self, capability: &str) -> Result<(), Error> {
        self.instance.ensure_state("add capability", SECURITY_STATES)?;
        let capability = capability.trim().to_ascii_uppercase();
        if capability.is_empty() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "capability",
                "must not be empty",
            ));
        }
        if !self.instance.security.capabilities.contains(&capability) {
            self.instance.security.capabilities.push(capability);
        }
        Ok(())
    }

    /// Adds several capabilities.
    ///
    /// # Errors
    ///
    /// See [`Security::add_capability`]. Capabilities before the failing one
    /// remain added.
    pub fn add_capabilities(&mut self, capabilities: &[&str]) -> Result<(), Error> {
        capabilities
            .iter()
            .try_for_each(|capability| self.add_capability(capability))
    }

    /// Returns `true` when the container runs privileged.
    #[must_use]
    pub fn privileged(&self) -> bool {
        self.instance.security.privileged
    }

    /// Returns the added capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.instance.security.capabilities
    }
}
