//! Network fault injection through Chaos Mesh `NetworkChaos` objects.
//!
//! A fault counts as active only once the cluster reports the
//! `AllInjected=True` condition on the submitted object.

use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::cluster::{CustomResourceRef, GracePeriod, Manifest, ResourceKind};
use crate::error::Error;
use crate::state::InstanceState;
use crate::wait::{CallContext, Readiness, poll_until};

use super::manifest;
use super::{Instance, derived_name};

/// Chaos Mesh network fault resource.
pub const NETWORK_CHAOS: CustomResourceRef = CustomResourceRef {
    group: "chaos-mesh.org",
    version: "v1alpha1",
    resource: "networkchaos",
    kind: "NetworkChaos",
};

const INJECTED_CONDITION: &str = "AllInjected";

#[derive(Clone, Debug, PartialEq)]
enum Fault {
    Delay { latency: Duration, jitter: Duration },
    Loss(f64),
    Duplicate(f64),
    Corrupt(f64),
    Bandwidth { rate: String, limit: u32, buffer: u32 },
}

impl Fault {
    const fn action(&self) -> &'static str {
        match self {
            Self::Delay { .. } => "delay",
            Self::Loss(_) => "loss",
            Self::Duplicate(_) => "duplicate",
            Self::Corrupt(_) => "corrupt",
            Self::Bandwidth { .. } => "bandwidth",
        }
    }

    fn spec(&self) -> Map<String, Value> {
        let detail = match self {
            Self::Delay { latency, jitter } => json!({
                "latency": format_millis(*latency),
                "jitter": format_millis(*jitter),
                "correlation": "0",
            }),
            Self::Loss(percent) => json!({ "loss": percent.to_string(), "correlation": "0" }),
            Self::Duplicate(percent) => {
                json!({ "duplicate": percent.to_string(), "correlation": "0" })
            }
            Self::Corrupt(percent) => json!({ "corrupt": percent.to_string(), "correlation": "0" }),
            Self::Bandwidth {
                rate,
                limit,
                buffer,
            } => json!({ "rate": rate, "limit": limit, "buffer": buffer }),
        };
        let mut spec = Map::new();
        spec.insert(String::from("action"), json!(self.action()));
        spec.insert(self.action().to_owned(), detail);
        spec
    }
}

fn format_millis(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

/// Fault injection operations on an [`Instance`].
pub struct Chaos<'a> {
    instance: &'a mut Instance,
}

impl<'a> Chaos<'a> {
    pub(super) const fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    /// Opts the instance in to fault injection. Must precede every fault
    /// method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] once the instance is
    /// destroyed.
    pub fn enable_chaos_mesh(&mut self) -> Result<(), Error> {
        self.instance.ensure_state(
            "enable chaos",
            &[
                InstanceState::None,
                InstanceState::Preparing,
                InstanceState::Committed,
                InstanceState::Started,
                InstanceState::Stopped,
            ],
        )?;
        self.instance.network.chaos_enabled = true;
        Ok(())
    }

    /// Returns `true` once [`Chaos::enable_chaos_mesh`] has been called.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.instance.network.chaos_enabled
    }

    /// Returns the names of submitted fault objects.
    #[must_use]
    pub fn submitted(&self) -> &[String] {
        &self.instance.network.chaos_objects
    }

    /// Delays every packet by `latency` plus up to `jitter` and waits for
    /// injection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when chaos is not enabled or `latency`
    /// is zero, [`Error::InvalidStateTransition`] outside `Started`,
    /// [`Error::Cluster`] when submission fails and [`Error::Timeout`] when
    /// `ctx` finishes before injection is confirmed.
    pub async fn set_delay(
        &mut self,
        ctx: &CallContext,
        latency: Duration,
        jitter: Duration,
    ) -> Result<(), Error> {
        self.ensure_injectable()?;
        if latency.is_zero() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "latency",
                "must be greater than zero",
            ));
        }
        self.inject(ctx, Fault::Delay { latency, jitter }).await
    }

    /// Drops `percent` of packets.
    ///
    /// # Errors
    ///
    /// See [`Chaos::set_delay`]; `percent` must lie within 0–100.
    pub async fn set_loss(&mut self, ctx: &CallContext, percent: f64) -> Result<(), Error> {
        self.ensure_injectable()?;
        self.validate_percent("loss", percent)?;
        self.inject(ctx, Fault::Loss(percent)).await
    }

    /// Duplicates `percent` of packets.
    ///
    /// # Errors
    ///
    /// See [`Chaos::set_loss`].
    pub async fn set_duplicate(&mut self, ctx: &CallContext, percent: f64) -> Result<(), Error> {
        self.ensure_injectable()?;
        self.validate_percent("duplicate", percent)?;
        self.inject(ctx, Fault::Duplicate(percent)).await
    }

    /// Corrupts `percent` of packets.
    ///
    /// # Errors
    ///
    /// See [`Chaos::set_loss`].
    pub async fn set_corrupt(&mut self, ctx: &CallContext, percent: f64) -> Result<(), Error> {
        self.ensure_injectable()?;
        self.validate_percent("corrupt", percent)?;
        self.inject(ctx, Fault::Corrupt(percent)).await
    }

    /// Limits bandwidth to `rate` (for example `1mbps`) with a token bucket
    /// of `buffer` bytes and a queue of `limit` bytes.
    ///
    /// # Errors
    ///
    /// See [`Chaos::set_delay`]; `rate` must be non-empty and `limit` and
    /// `buffer` positive.
    pub async fn set_bandwidth(
        &mut self,
        ctx: &CallContext,
        rate: &str,
        limit: u32,
        buffer: u32,
    ) -> Result<(), Error> {
        self.ensure_injectable()?;
        let instance = &self.instance.k8s_name;
        if rate.trim().is_empty() {
            return Err(Error::validation(instance, "rate", "must not be empty"));
        }
        if limit == 0 || buffer == 0 {
            return Err(Error::validation(
                instance,
                "bandwidth",
                "limit and buffer must be positive",
            ));
        }
        let fault = Fault::Bandwidth {
            rate: rate.trim().to_owned(),
            limit,
            buffer,
        };
        self.inject(ctx, fault).await
    }

    /// Deletes every submitted fault object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Started` and
    /// [`Error::Cluster`] for deletion failures other than a missing object.
    /// Objects deleted before the failure are forgotten.
    pub async fn clear_chaos(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.instance.ensure_state("clear chaos", &[InstanceState::Started])?;
        if ctx.is_done() {
            return Err(Error::timeout("clear chaos", &self.instance.k8s_name));
        }
        while let Some(name) = self.instance.network.chaos_objects.last() {
            let result = self
                .instance
                .deps
                .cluster()
                .delete(
                    self.instance.namespace(),
                    ResourceKind::Custom(NETWORK_CHAOS),
                    name,
                    GracePeriod::Default,
                )
                .await;
            match result {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(source) => {
                    return Err(Error::cluster("delete network chaos", &self.instance.k8s_name, source));
                }
            }
            self.instance.network.chaos_objects.pop();
        }
        info!(instance = self.instance.k8s_name.as_str(), "chaos cleared");
        Ok(())
    }

    /// Polls the fault object `name` until it reports `AllInjected=True`.
    /// A missing object counts as not yet injected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Started`,
    /// [`Error::Cluster`] when a lookup fails and [`Error::Timeout`] once
    /// `ctx` is done.
    pub async fn wait_for_chaos_injection(
        &mut self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<(), Error> {
        self.instance.ensure_state("wait for chaos", &[InstanceState::Started])?;
        let instance: &Instance = self.instance;
        let cluster = instance.deps.cluster();
        let namespace = instance.namespace();
        let label = instance.k8s_name.as_str();
        poll_until(
            ctx,
            instance.deps.timings().poll_interval,
            "chaos injection",
            label,
            || async move {
                let found = cluster
                    .get(namespace, ResourceKind::Custom(NETWORK_CHAOS), name)
                    .await
                    .map_err(|source| Error::cluster("get network chaos", label, source))?;
                Ok(Readiness::from(
                    found
                        .as_ref()
                        .and_then(Manifest::as_custom)
                        .is_some_and(|object| is_injected(&object.body)),
                ))
            },
        )
        .await?;
        debug!(instance = label, object = name, "chaos injected");
        Ok(())
    }

    fn validate_percent(&self, field: &'static str, percent: f64) -> Result<(), Error> {
        if percent.is_finite() && (0.0..=100.0).contains(&percent) {
            return Ok(());
        }
        Err(Error::validation(
            &self.instance.k8s_name,
            field,
            format!("{percent} is outside 0-100"),
        ))
    }

    /// Checks the instance can take a fault before any argument is looked at.
    fn ensure_injectable(&self) -> Result<(), Error> {
        self.instance.ensure_state("inject chaos", &[InstanceState::Started])?;
        if !self.instance.network.chaos_enabled {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "chaos",
                "enable_chaos_mesh must be called first",
            ));
        }
        Ok(())
    }

    async fn inject(&mut self, ctx: &CallContext, fault: Fault) -> Result<(), Error> {
        let instance = self.instance.k8s_name.clone();
        if ctx.is_done() {
            return Err(Error::timeout("inject chaos", &instance));
        }
        let name = derived_name(&instance, fault.action());
        let object = manifest::fault(self.instance, NETWORK_CHAOS, name.clone(), fault.spec());
        let cluster = self.instance.deps.cluster();
        let namespace = self.instance.namespace();
        let existing = cluster
            .get(namespace, object.kind(), &name)
            .await
            .map_err(|source| Error::cluster("get network chaos", &instance, source))?;
        if existing.is_some() {
            cluster
                .update(namespace, &object)
                .await
                .map_err(|source| Error::cluster("update network chaos", &instance, source))?;
        } else {
            cluster
                .create(namespace, &object)
                .await
                .map_err(|source| Error::cluster("create network chaos", &instance, source))?;
        }
        if !self.instance.network.chaos_objects.contains(&name) {
            self.instance.network.chaos_objects.push(name.clone());
        }
        info!(instance = instance.as_str(), action = fault.action(), "chaos submitted");
        self.wait_for_chaos_injection(ctx, &name).await
    }
}

fn is_injected(body: &Value) -> bool {
    body.pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(Value::as_str) == Some(INJECTED_CONDITION)
                    && condition.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}
