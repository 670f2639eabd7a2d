//! CPU and memory requirements and RBAC rules.

use k8s_openapi::api::rbac::v1::PolicyRule;

use crate::error::Error;
use crate::state::InstanceState;

use super::Instance;

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ResourcesConfig {
    pub(crate) cpu_request: Option<String>,
    pub(crate) cpu_limit: Option<String>,
    pub(crate) memory_request: Option<String>,
    pub(crate) memory_limit: Option<String>,
    pub(crate) policy_rules: Vec<PolicyRule>,
}

/// Resource operations on an [`Instance`].
pub struct Resources<'a> {
    instance: &'a mut Instance,
}

const RESOURCE_STATES: &[InstanceState] = &[InstanceState::Preparing, InstanceState::Committed];

impl<'a> Resources<'a> {
    pub(super) const fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    /// Sets the memory request and limit, for example `64Mi` and `128Mi`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing` or
    /// `Committed`, and [`Error::Validation`] for an empty quantity.
    pub fn set_memory(&mut self, request: &str, limit: &str) -> Result<(), Error> {
        self.instance.ensure_state("set memory", RESOURCE_STATES)?;
        let (request, limit) = self.quantities("memory", request, limit)?;
        self.instance.resources.memory_request = Some(request);
        self.instance.resources.memory_limit = Some(limit);
        Ok(())
    }

    /// Sets the CPU request and limit, for example `100m` and `500m`.
    ///
    /// # Errors
    ///
    /// See [`Resources::set_memory`].
    pub fn set_cpu(&mut self, request: &str, limit: &str) -> Result<(), Error> {
        self.instance.ensure_state("set cpu", RESOURCE_STATES)?;
        let (request, limit) = self.quantities("cpu", request, limit)?;
        self.instance.resources.cpu_request = Some(request);
        self.instance.resources.cpu_limit = Some(limit);
        Ok(())
    }

    /// Grants the pod's service account an additional RBAC rule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing` or
    /// `Committed`, and [`Error::Validation`] for a rule without verbs.
    pub fn add_policy_rule(&mut self, rule: PolicyRule) -> Result<(), Error> {
        self.instance.ensure_state("add policy rule", RESOURCE_STATES)?;
        if rule.verbs.is_empty() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "policy rule",
                "at least one verb is required",
            ));
        }
        self.instance.resources.policy_rules.push(rule);
        Ok(())
    }

    /// Returns the RBAC rules in insertion order.
    #[must_use]
    pub fn policy_rules(&self) -> &[PolicyRule] {
        &self.instance.resources.policy_rules
    }

    /// Returns the memory request and limit.
    #[must_use]
    pub fn memory(&self) -> (Option<&str>, Option<&str>) {
        (
            self.instance.resources.memory_request.as_deref(),
            self.instance.resources.memory_limit.as_deref(),
        )
    }

    /// Returns the CPU request and limit.
    #[must_use]
    pub fn cpu(&self) -> (Option<&str>, Option<&str>) {
        (
            self.instance.resources.cpu_request.as_deref(),
            self.instance.resources.cpu_limit.as_deref(),
        )
    }

    fn quantities(&self, field: &'static str, request: &str, limit: &str) -> Result<(String, String), Error> {
        let (request, limit) = (request.trim(), limit.trim());
        if request.is_empty() || limit.is_empty() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                field,
                "request and limit must not be empty",
            ));
        }
        Ok((request.to_owned(), limit.to_owned()))
    }
}
