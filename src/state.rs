//! Instance lifecycle states and the transition guard shared by every
//! mutator.

use std::fmt;

use crate::error::Error;

/// Lifecycle state of an [`Instance`](crate::Instance).
///
/// The forward path is `None → Preparing → Committed → Started ⇄ Stopped →
/// Destroyed`. `Destroyed` is absorbing.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum InstanceState {
    /// Freshly constructed; no image selected yet.
    #[default]
    None,
    /// An image has been selected and build instructions are accumulating.
    Preparing,
    /// The image is final and pushed; runtime configuration may still change.
    Committed,
    /// The workload has been created on the cluster.
    Started,
    /// The workload has been removed but its supporting resources remain.
    Stopped,
    /// Every cluster resource has been removed. Terminal.
    Destroyed,
}

impl InstanceState {
    /// Returns the lowercase name used in log fields and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Preparing => "preparing",
            Self::Committed => "committed",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        }
    }

    /// Returns `true` when `self` is one of `allowed`.
    #[must_use]
    pub fn is_in(self, allowed: &[Self]) -> bool {
        allowed.contains(&self)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fails with [`Error::InvalidStateTransition`] unless `current` is one of
/// `allowed`.
///
/// # Errors
///
/// Returns [`Error::InvalidStateTransition`] naming `operation`, the instance
/// and its current state.
pub(crate) fn ensure_state(
    operation: &'static str,
    instance: &str,
    current: InstanceState,
    allowed: &[InstanceState],
) -> Result<(), Error> {
    if current.is_in(allowed) {
        return Ok(());
    }
    Err(Error::InvalidStateTransition {
        operation,
        instance: instance.to_owned(),
        state: current,
    })
}
