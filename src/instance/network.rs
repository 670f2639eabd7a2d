//! Ports, proxy hosts, port forwarding and network isolation.

use std::future::Future;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, GracePeriod, ResourceKind};
use crate::error::Error;
use crate::state::InstanceState;
use crate::wait::{CallContext, Readiness, poll_until};

use super::Instance;
use super::manifest;

#[derive(Clone, Debug, Default)]
pub(crate) struct NetworkConfig {
    pub(crate) tcp_ports: Vec<u16>,
    pub(crate) udp_ports: Vec<u16>,
    pub(crate) service: Option<Service>,
    pub(crate) disabled: bool,
    pub(crate) chaos_enabled: bool,
    pub(crate) chaos_objects: Vec<String>,
}

impl NetworkConfig {
    /// Copies the port configuration and chaos opt-in, dropping the cached
    /// Service, isolation flag and submitted faults.
    pub(crate) fn clone_config(&self) -> Self {
        Self {
            tcp_ports: self.tcp_ports.clone(),
            udp_ports: self.udp_ports.clone(),
            chaos_enabled: self.chaos_enabled,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp port",
            Self::Udp => "udp port",
        }
    }
}

/// Network operations on an [`Instance`].
pub struct Network<'a> {
    instance: &'a mut Instance,
}

impl<'a> Network<'a> {
    pub(super) const fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    /// Returns the registered TCP ports in insertion order.
    #[must_use]
    pub fn tcp_ports(&self) -> &[u16] {
        &self.instance.network.tcp_ports
    }

    /// Returns the registered UDP ports in insertion order.
    #[must_use]
    pub fn udp_ports(&self) -> &[u16] {
        &self.instance.network.udp_ports
    }

    /// Returns the Service last written for this instance, if any.
    #[must_use]
    pub fn service(&self) -> Option<&Service> {
        self.instance.network.service.as_ref()
    }

    /// Exposes a TCP port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing` or
    /// `Committed`, and [`Error::Validation`] for ports outside 1–65535 or
    /// already registered.
    pub fn add_port_tcp(&mut self, port: u32) -> Result<(), Error> {
        self.add_port(Protocol::Tcp, port)
    }

    /// Exposes a UDP port.
    ///
    /// # Errors
    ///
    /// See [`Network::add_port_tcp`].
    pub fn add_port_udp(&mut self, port: u32) -> Result<(), Error> {
        self.add_port(Protocol::Udp, port)
    }

    fn add_port(&mut self, protocol: Protocol, port: u32) -> Result<(), Error> {
        self.instance.ensure_state(
            "add port",
            &[InstanceState::Preparing, InstanceState::Committed],
        )?;
        let instance = &self.instance.k8s_name;
        let port = u16::try_from(port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                Error::validation(instance, protocol.as_str(), format!("{port} is outside 1-65535"))
            })?;
        let ports = match protocol {
            Protocol::Tcp => &mut self.instance.network.tcp_ports,
            Protocol::Udp => &mut self.instance.network.udp_ports,
        };
        if ports.contains(&port) {
            return Err(Error::validation(
                &self.instance.k8s_name,
                protocol.as_str(),
                format!("{port} is already registered"),
            ));
        }
        ports.push(port);
        Ok(())
    }

    /// Registers `port` with the proxy and returns its external URL.
    /// Sidecars are exposed through their parent's Service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing` or
    /// `Started`, [`Error::Validation`] when no proxy is configured, and
    /// [`Error::Proxy`] when registration fails.
    pub async fn add_host(&mut self, ctx: &CallContext, port: u16) -> Result<String, Error> {
        self.instance.ensure_state(
            "add host",
            &[InstanceState::Preparing, InstanceState::Started],
        )?;
        let instance = self.instance.k8s_name.as_str();
        let proxy = self
            .instance
            .deps
            .proxy()
            .ok_or_else(|| Error::validation(instance, "proxy", "no proxy registrar configured"))?;
        if ctx.is_done() {
            return Err(Error::timeout("add host", instance));
        }
        let service = self.instance.pod_owner();
        let prefix = format!("{service}-{port}");
        let proxy_error = |operation, source| Error::Proxy {
            operation,
            instance: instance.to_owned(),
            source,
        };
        proxy
            .register(service, &prefix, port)
            .await
            .map_err(|source| proxy_error("register", source))?;
        let url = proxy
            .url(&prefix)
            .await
            .map_err(|source| proxy_error("resolve", source))?;
        info!(instance, url = url.as_str(), "host registered");
        Ok(url)
    }

    /// Registers a host and polls `check` with its URL until it reports
    /// ready.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Network::add_host`] and [`Error::Timeout`]
    /// when `ctx` finishes before `check` succeeds.
    pub async fn add_host_with_ready_check<F, Fut>(
        &mut self,
        ctx: &CallContext,
        port: u16,
        mut check: F,
    ) -> Result<String, Error>
    where
        F: FnMut(&str) -> Fut,
        Fut: Future<Output = bool>,
    {
        let url = self.add_host(ctx, port).await?;
        let interval = self.instance.deps.timings().host_check_interval;
        poll_until(ctx, interval, "host ready", &self.instance.k8s_name, || {
            let ready = check(&url);
            async move { Ok(Readiness::from(ready.await)) }
        })
        .await?;
        Ok(url)
    }

    /// Forwards a free local port to `port` on the instance's pod and
    /// returns the local port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Started`,
    /// [`Error::Timeout`] when `ctx` finishes between attempts, and
    /// [`Error::PortForward`] once every attempt has failed.
    pub async fn port_forward_tcp(&mut self, ctx: &CallContext, port: u16) -> Result<u16, Error> {
        self.instance.ensure_state("port forward", &[InstanceState::Started])?;
        let instance = self.instance.k8s_name.as_str();
        let pod = super::execution::first_pod(self.instance).await?;
        let local_port = free_local_port().await.map_err(|source| Error::PortForward {
            instance: instance.to_owned(),
            port,
            attempts: 0,
            source,
        })?;
        let timings = self.instance.deps.timings();
        let cluster = self.instance.deps.cluster();
        let namespace = self.instance.namespace();
        let mut last_error = None;
        for attempt in 1..=timings.port_forward_attempts {
            if ctx.is_done() {
                return Err(Error::timeout("port forward", instance));
            }
            match cluster.port_forward(namespace, &pod, local_port, port).await {
                Ok(()) => {
                    info!(instance, local_port, port, "port forward established");
                    return Ok(local_port);
                }
                Err(err) => {
                    warn!(instance, attempt, error = %err, "port forward attempt failed");
                    last_error = Some(err);
                }
            }
            if attempt < timings.port_forward_attempts
                && !ctx.sleep(timings.port_forward_backoff).await
            {
                return Err(Error::timeout("port forward", instance));
            }
        }
        Err(Error::PortForward {
            instance: instance.to_owned(),
            port,
            attempts: timings.port_forward_attempts,
            source: last_error.unwrap_or_else(|| ClusterError::PortForward {
                message: String::from("no attempts were made"),
            }),
        })
    }

    /// Isolates the pod with a deny-all NetworkPolicy. A no-op when the
    /// network is already disabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for sidecars,
    /// [`Error::InvalidStateTransition`] outside `Started` and
    /// [`Error::Cluster`] when the policy cannot be created.
    pub async fn disable_network(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.ensure_isolation_target("disable network", ctx)?;
        if self.instance.network.disabled {
            return Ok(());
        }
        let policy = manifest::deny_all_policy(self.instance)?;
        let cluster = self.instance.deps.cluster();
        match cluster.create(self.instance.namespace(), &policy).await {
            Ok(_) | Err(ClusterError::AlreadyExists { .. }) => {}
            Err(source) => {
                return Err(Error::cluster("create network policy", &self.instance.k8s_name, source));
            }
        }
        self.instance.network.disabled = true;
        info!(instance = self.instance.k8s_name.as_str(), "network disabled");
        Ok(())
    }

    /// Removes the deny-all NetworkPolicy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for sidecars,
    /// [`Error::InvalidStateTransition`] outside `Started` and
    /// [`Error::Cluster`] when deletion fails for a reason other than the
    /// policy being absent.
    pub async fn enable_network(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.ensure_isolation_target("enable network", ctx)?;
        remove_deny_all_policy(self.instance).await?;
        info!(instance = self.instance.k8s_name.as_str(), "network enabled");
        Ok(())
    }

    /// Reports whether the deny-all NetworkPolicy exists on the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for sidecars,
    /// [`Error::InvalidStateTransition`] outside `Started` and
    /// [`Error::Cluster`] when the lookup fails.
    pub async fn is_network_disabled(&mut self, ctx: &CallContext) -> Result<bool, Error> {
        self.ensure_isolation_target("check network", ctx)?;
        let name = manifest::network_policy_name(&self.instance.k8s_name);
        let found = self
            .instance
            .deps
            .cluster()
            .get(self.instance.namespace(), ResourceKind::NetworkPolicy, &name)
            .await
            .map_err(|source| Error::cluster("get network policy", &self.instance.k8s_name, source))?;
        Ok(found.is_some())
    }

    /// Returns the cluster IP of the Service fronting this instance (the
    /// parent's Service for sidecars).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Started`,
    /// [`Error::Cluster`] when the Service is missing or the lookup fails,
    /// and [`Error::Validation`] when the Service has no cluster IP.
    pub async fn get_ip(&mut self, ctx: &CallContext) -> Result<String, Error> {
        self.instance.ensure_state("get ip", &[InstanceState::Started])?;
        let instance = self.instance.k8s_name.as_str();
        if ctx.is_done() {
            return Err(Error::timeout("get ip", instance));
        }
        let service_name = self.instance.pod_owner();
        let found = self
            .instance
            .deps
            .cluster()
            .get(self.instance.namespace(), ResourceKind::Service, service_name)
            .await
            .map_err(|source| Error::cluster("get service", instance, source))?
            .ok_or_else(|| {
                Error::cluster(
                    "get service",
                    instance,
                    ClusterError::NotFound {
                        kind: ResourceKind::Service.to_string(),
                        name: service_name.to_owned(),
                    },
                )
            })?;
        found
            .as_service()
            .and_then(|service| service.spec.as_ref())
            .and_then(|spec| spec.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None")
            .ok_or_else(|| Error::validation(instance, "service", "no cluster IP assigned"))
    }

    fn ensure_isolation_target(&self, operation: &'static str, ctx: &CallContext) -> Result<(), Error> {
        if self.instance.is_sidecar() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "network",
                "sidecars share their parent's network",
            ));
        }
        self.instance.ensure_state(operation, &[InstanceState::Started])?;
        if ctx.is_done() {
            return Err(Error::timeout(operation, &self.instance.k8s_name));
        }
        Ok(())
    }
}

/// Deletes the deny-all NetworkPolicy, treating an absent policy as success.
pub(crate) async fn remove_deny_all_policy(instance: &mut Instance) -> Result<(), Error> {
    let name = manifest::network_policy_name(&instance.k8s_name);
    let result = instance
        .deps
        .cluster()
        .delete(
            instance.namespace(),
            ResourceKind::NetworkPolicy,
            &name,
            GracePeriod::Default,
        )
        .await;
    match result {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {
            debug!(instance = instance.k8s_name.as_str(), "no network policy to remove");
        }
        Err(source) => {
            return Err(Error::cluster("delete network policy", &instance.k8s_name, source));
        }
    }
    instance.network.disabled = false;
    Ok(())
}

async fn free_local_port() -> Result<u16, ClusterError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|err| ClusterError::PortForward {
            message: format!("failed to reserve a local port: {err}"),
        })?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|err| ClusterError::PortForward {
            message: format!("failed to read the reserved port: {err}"),
        })
}

