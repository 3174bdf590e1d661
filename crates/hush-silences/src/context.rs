//! Cancellation-aware request context.
//!
//! Every operation that touches the durable store takes a [`RequestContext`].
//! The context carries a deadline and a [`CancellationToken`]; store futures
//! are raced against both, and the in-memory index is only touched after the
//! store future has resolved successfully.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SilenceError};

/// Default request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline and cancellation signal for a single request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    timeout: Duration,
    deadline: Instant,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Creates a context whose deadline is `timeout` from now.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_token(timeout, CancellationToken::new())
    }

    /// Creates a context bound to an existing cancellation token.
    #[must_use]
    pub fn with_token(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Returns a context with the same deadline that is cancelled together
    /// with this one, but can also be cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            timeout: self.timeout,
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    /// The total time budget this context was created with.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// The cancellation token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the context was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails fast if the context is already cancelled or past its deadline.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `Timeout`.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(SilenceError::Cancelled);
        }
        if self.remaining().is_zero() {
            return Err(SilenceError::Timeout {
                after: self.timeout,
            });
        }
        Ok(())
    }

    /// Drives `fut` until it completes, the deadline passes, or the context
    /// is cancelled, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns the future's own error, `Timeout`, or `Cancelled`.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let remaining = self.remaining();

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SilenceError::Cancelled),
            res = tokio::time::timeout(remaining, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(SilenceError::Timeout { after: self.timeout }),
            },
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_passes_through_result() {
        let ctx = RequestContext::default();
        let value = ctx.run(async { Ok::<_, SilenceError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = RequestContext::new(Duration::from_millis(20));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, SilenceError>(())
            })
            .await;
        assert!(matches!(result, Err(SilenceError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let ctx = RequestContext::default();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, SilenceError>(())
            })
            .await;
        assert!(matches!(result, Err(SilenceError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_fast() {
        let ctx = RequestContext::default();
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(SilenceError::Cancelled)));
    }

    #[test]
    fn test_child_follows_parent_cancellation() {
        let parent = RequestContext::default();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
