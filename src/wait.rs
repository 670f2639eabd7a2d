//! Call contexts and the bounded poll loop used by every wait operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::Error;

/// Cancellation and deadline carried through every cluster-touching call.
///
/// Cloning a context shares its cancellation token; [`CallContext::child`]
/// derives a context that is cancelled with its parent but can also be
/// cancelled on its own.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Creates a context with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().with_deadline(Instant::now() + timeout)
    }

    /// Sets an absolute deadline, keeping the earlier of the two when one is
    /// already set.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |current| current.min(deadline)));
        self
    }

    /// Returns a child context sharing this context's deadline.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` once the context has been cancelled or its deadline
    /// has passed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Sleeps for `interval` unless the context finishes first. Returns
    /// `false` when the context finished.
    pub async fn sleep(&self, interval: Duration) -> bool {
        tokio::select! {
            () = self.done() => false,
            () = tokio::time::sleep(interval) => !self.is_done(),
        }
    }
}

/// Outcome of a single readiness check inside [`poll_until`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Readiness {
    Ready,
    Pending,
}

impl From<bool> for Readiness {
    fn from(ready: bool) -> Self {
        if ready { Self::Ready } else { Self::Pending }
    }
}

/// Polls `check` every `interval` until it reports [`Readiness::Ready`].
///
/// Errors from `check` abort the loop. The context is consulted before every
/// attempt and during every sleep.
///
/// # Errors
///
/// Returns [`Error::Timeout`] naming `action` and `instance` once the context
/// is done, or the first error returned by `check`.
pub(crate) async fn poll_until<F, Fut>(
    ctx: &CallContext,
    interval: Duration,
    action: &'static str,
    instance: &str,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Readiness, Error>>,
{
    loop {
        if ctx.is_done() {
            return Err(Error::timeout(action, instance));
        }
        if check().await? == Readiness::Ready {
            return Ok(());
        }
        trace!(instance, action, "condition not yet met, retrying");
        if !ctx.sleep(interval).await {
            return Err(Error::timeout(action, instance));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn poll_until_returns_once_ready() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        poll_until(
            &CallContext::with_timeout(Duration::from_secs(5)),
            Duration::from_millis(1),
            "ready",
            "web",
            move || {
                let counter = Arc::clone(&counter);
                async move { Ok(Readiness::from(counter.fetch_add(1, Ordering::SeqCst) >= 2)) }
            },
        )
        .await
        .expect("condition becomes ready on the third attempt");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_times_out_on_deadline() {
        let err = poll_until(
            &CallContext::with_timeout(Duration::from_millis(20)),
            Duration::from_millis(5),
            "instance running",
            "web",
            || async { Ok(Readiness::Pending) },
        )
        .await
        .expect_err("never-ready condition must time out");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn poll_until_stops_when_cancelled() {
        let ctx = CallContext::new();
        ctx.cancel();
        let err = poll_until(&ctx, Duration::from_secs(60), "ready", "web", || async {
            Ok(Readiness::Pending)
        })
        .await
        .expect_err("cancelled context must stop the loop");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn child_is_cancelled_with_parent() {
        let parent = CallContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_done());
    }
}
