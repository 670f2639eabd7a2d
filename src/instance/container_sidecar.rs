//! A sidecar built from a plain container image.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::deps::SystemDependencies;
use crate::error::Error;
use crate::wait::CallContext;

use super::{Instance, derived_name, sanitize_name};
use super::sidecars::{Sidecar, SidecarFuture};

/// Sidecar running `image` with optional ports, environment and command.
///
/// The sidecar's instance is named `{parent}-{suffix}`, with the parent
/// part shortened when the joined name would exceed a DNS label.
#[derive(Debug)]
pub struct ContainerSidecar {
    suffix: String,
    image: String,
    tcp_ports: Vec<u16>,
    udp_ports: Vec<u16>,
    env: BTreeMap<String, String>,
    command: Vec<String>,
    args: Vec<String>,
    instance: Option<Instance>,
}

impl ContainerSidecar {
    /// Creates a sidecar running `image`.
    #[must_use]
    pub fn new(suffix: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            image: image.into(),
            tcp_ports: Vec::new(),
            udp_ports: Vec::new(),
            env: BTreeMap::new(),
            command: Vec::new(),
            args: Vec::new(),
            instance: None,
        }
    }

    /// Exposes a TCP port through the parent's Service.
    #[must_use]
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_ports.push(port);
        self
    }

    /// Exposes a UDP port through the parent's Service.
    #[must_use]
    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_ports.push(port);
        self
    }

    /// Sets an environment variable on the container.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Overrides the container entrypoint.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the container arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn instance_name(&self, parent_name: &str) -> String {
        derived_name(&sanitize_name(parent_name), &sanitize_name(&self.suffix))
    }

    async fn build_instance(
        &self,
        ctx: &CallContext,
        name: String,
        deps: Arc<SystemDependencies>,
    ) -> Result<Instance, Error> {
        let mut instance = Instance::new(name, deps)?;
        instance.build().set_image(&self.image)?;
        for port in &self.tcp_ports {
            instance.network().add_port_tcp(u32::from(*port))?;
        }
        for port in &self.udp_ports {
            instance.network().add_port_udp(u32::from(*port))?;
        }
        instance.build().commit(ctx).await?;
        let mut build = instance.build();
        for (key, value) in &self.env {
            build.set_environment_variable(key, value)?;
        }
        if !self.command.is_empty() {
            let command: Vec<&str> = self.command.iter().map(String::as_str).collect();
            build.set_start_command(&command)?;
        }
        if !self.args.is_empty() {
            let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
            build.set_args(&args)?;
        }
        Ok(instance)
    }
}

impl Sidecar for ContainerSidecar {
    fn initialize<'a>(
        &'a mut self,
        ctx: &'a CallContext,
        parent_name: &'a str,
        deps: Arc<SystemDependencies>,
    ) -> SidecarFuture<'a, ()> {
        Box::pin(async move {
            let name = self.instance_name(parent_name);
            let instance = self.build_instance(ctx, name, deps).await?;
            self.instance = Some(instance);
            Ok(())
        })
    }

    fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    fn instance_mut(&mut self) -> Option<&mut Instance> {
        self.instance.as_mut()
    }

    fn clone_for(&self, parent_name: &str) -> Result<Box<dyn Sidecar>, Error> {
        let instance = self
            .instance
            .as_ref()
            .map(|instance| instance.clone_with_name(self.instance_name(parent_name)))
            .transpose()?;
        Ok(Box::new(Self {
            suffix: self.suffix.clone(),
            image: self.image.clone(),
            tcp_ports: self.tcp_ports.clone(),
            udp_ports: self.udp_ports.clone(),
            env: self.env.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            instance,
        }))
    }
}
