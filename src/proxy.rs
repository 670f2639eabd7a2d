//! HTTP proxy registrar used to expose instance ports to the test host.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Future returned by proxy operations.
pub type ProxyFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProxyError>> + Send + 'a>>;

/// Errors raised by proxy registrars.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProxyError {
    /// Registering a route failed.
    #[error("failed to register route {prefix}: {message}")]
    Register {
        /// Route prefix that was requested.
        prefix: String,
        /// Error message from the proxy.
        message: String,
    },
    /// No route exists for the prefix.
    #[error("no route registered for {prefix}")]
    UnknownRoute {
        /// Route prefix that was looked up.
        prefix: String,
    },
}

/// Registers routes from the proxy to in-cluster services.
pub trait ProxyRegistrar: Send + Sync {
    /// Routes `prefix` to `port` of `service`.
    fn register<'a>(&'a self, service: &'a str, prefix: &'a str, port: u16)
    -> ProxyFuture<'a, ()>;

    /// Returns the externally reachable URL for a registered prefix.
    fn url<'a>(&'a self, prefix: &'a str) -> ProxyFuture<'a, String>;
}
