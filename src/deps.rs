//! Shared collaborators injected into every instance.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;
use uuid::Uuid;

use crate::cluster::ClusterClient;
use crate::config::{ConfigError, CorralConfig};
use crate::error::Error;
use crate::image::{ImageBuilder, ImageCache};
use crate::proxy::ProxyRegistrar;

/// Default interval between readiness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of port-forward attempts.
pub const DEFAULT_PORT_FORWARD_ATTEMPTS: u32 = 5;

/// Default pause between port-forward attempts.
pub const DEFAULT_PORT_FORWARD_BACKOFF: Duration = Duration::from_secs(2);

/// Default interval between host ready checks.
pub const DEFAULT_HOST_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const MAX_LABEL_LEN: usize = 63;

/// Poll and retry knobs shared by every wait loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timings {
    /// Interval between readiness and chaos-injection polls.
    pub poll_interval: Duration,
    /// Attempts made before port forwarding gives up.
    pub port_forward_attempts: u32,
    /// Pause between port-forward attempts.
    pub port_forward_backoff: Duration,
    /// Interval between host ready checks.
    pub host_check_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            port_forward_attempts: DEFAULT_PORT_FORWARD_ATTEMPTS,
            port_forward_backoff: DEFAULT_PORT_FORWARD_BACKOFF,
            host_check_interval: DEFAULT_HOST_CHECK_INTERVAL,
        }
    }
}

impl Timings {
    /// Returns timings suited to in-memory tests: millisecond intervals.
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            port_forward_attempts: 3,
            port_forward_backoff: Duration::from_millis(5),
            host_check_interval: Duration::from_millis(5),
        }
    }
}

/// Identifier grouping every resource created by one test run.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TestScope(String);

impl TestScope {
    /// Validates an explicit scope.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when `value` is not a lowercase
    /// DNS label.
    pub fn new(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        if !is_dns_label(&value) {
            return Err(ConfigError::MissingField(format!(
                "test scope `{value}` must be a lowercase DNS label of at most {MAX_LABEL_LEN} characters"
            )));
        }
        Ok(Self(value))
    }

    /// Generates a fresh scope of the form `{prefix}-{8 hex chars}`.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let short = suffix.get(..8).unwrap_or(&suffix);
        Self(format!("{prefix}-{short}"))
    }

    /// Returns the scope as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_LABEL_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

/// Set of cluster names claimed during a run.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: Mutex<HashSet<String>>,
}

impl NameRegistry {
    /// Claims `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceConflict`] when the name is already claimed.
    pub fn register(&self, name: &str) -> Result<(), Error> {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        if !names.insert(name.to_owned()) {
            return Err(Error::ResourceConflict {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    /// Returns `true` when `name` is claimed.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        let names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        names.contains(name)
    }
}

/// Collaborators and shared state used by every instance in a run.
pub struct SystemDependencies {
    cluster: Arc<dyn ClusterClient>,
    image_builder: Arc<dyn ImageBuilder>,
    proxy: Option<Arc<dyn ProxyRegistrar>>,
    scope: TestScope,
    namespace: String,
    config: CorralConfig,
    image_cache: ImageCache,
    names: NameRegistry,
    timings: Timings,
}

impl fmt::Debug for SystemDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemDependencies")
            .field("scope", &self.scope)
            .field("namespace", &self.namespace)
            .field("proxy", &self.proxy.is_some())
            .field("config", &self.config)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl SystemDependencies {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> SystemDependenciesBuilder {
        SystemDependenciesBuilder::default()
    }

    /// Returns the cluster client.
    #[must_use]
    pub fn cluster(&self) -> &dyn ClusterClient {
        self.cluster.as_ref()
    }

    /// Returns the image builder.
    #[must_use]
    pub fn image_builder(&self) -> &dyn ImageBuilder {
        self.image_builder.as_ref()
    }

    /// Returns the proxy registrar when one is configured.
    #[must_use]
    pub fn proxy(&self) -> Option<&dyn ProxyRegistrar> {
        self.proxy.as_deref()
    }

    /// Returns the test scope.
    #[must_use]
    pub const fn scope(&self) -> &TestScope {
        &self.scope
    }

    /// Returns the namespace every resource is created in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &CorralConfig {
        &self.config
    }

    /// Returns the shared image cache.
    #[must_use]
    pub const fn image_cache(&self) -> &ImageCache {
        &self.image_cache
    }

    /// Returns the instance name registry.
    #[must_use]
    pub const fn names(&self) -> &NameRegistry {
        &self.names
    }

    /// Returns the poll and retry knobs.
    #[must_use]
    pub const fn timings(&self) -> Timings {
        self.timings
    }

    /// Returns the build directory for an instance.
    #[must_use]
    pub fn build_dir_for(&self, k8s_name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.config.build_dir)
            .join(self.scope.as_str())
            .join(k8s_name)
    }
}

/// Builder for [`SystemDependencies`].
#[derive(Default)]
pub struct SystemDependenciesBuilder {
    cluster: Option<Arc<dyn ClusterClient>>,
    image_builder: Option<Arc<dyn ImageBuilder>>,
    proxy: Option<Arc<dyn ProxyRegistrar>>,
    scope: Option<TestScope>,
    config: Option<CorralConfig>,
    timings: Option<Timings>,
}

impl SystemDependenciesBuilder {
    /// Sets the cluster client.
    #[must_use]
    pub fn cluster(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Sets the image builder.
    #[must_use]
    pub fn image_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.image_builder = Some(builder);
        self
    }

    /// Sets the proxy registrar.
    #[must_use]
    pub fn proxy(mut self, proxy: Arc<dyn ProxyRegistrar>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Uses an explicit test scope instead of generating one.
    #[must_use]
    pub fn scope(mut self, scope: TestScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Sets the configuration; defaults apply otherwise.
    #[must_use]
    pub fn config(mut self, config: CorralConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides poll and retry timings.
    #[must_use]
    pub const fn timings(mut self, timings: Timings) -> Self {
        self.timings = Some(timings);
        self
    }

    /// Validates the collected parts and returns shared dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the cluster client or image builder is
    /// missing, or when the configuration fails validation.
    pub fn build(self) -> Result<Arc<SystemDependencies>, Error> {
        let cluster = self
            .cluster
            .ok_or_else(|| ConfigError::MissingField(String::from("cluster client")))?;
        let image_builder = self
            .image_builder
            .ok_or_else(|| ConfigError::MissingField(String::from("image builder")))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let scope = self
            .scope
            .unwrap_or_else(|| TestScope::generate(&config.scope_prefix));
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| scope.as_str().to_owned());
        Ok(Arc::new(SystemDependencies {
            cluster,
            image_builder,
            proxy: self.proxy,
            scope,
            namespace,
            config,
            image_cache: ImageCache::new(),
            names: NameRegistry::default(),
            timings: self.timings.unwrap_or_default(),
        }))
    }
}
