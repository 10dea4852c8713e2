//! Request-scoped execution context
//!
//! A [`RequestContext`] bundles a cancellation signal, an optional deadline and
//! a few informational values (currently the request id used in log spans).
//! Every stage that may block on I/O receives one and should either check it
//! or run its work through [`RequestContext::run`].
//!
//! Contexts form a tree: [`RequestContext::with_timeout`] produces a child that
//! is cancelled together with its parent and additionally expires on its own
//! deadline. [`RequestContext::detached`] cuts the cancellation link while
//! keeping the informational values, which is what background work such as
//! cache fills and persistence needs.

use crate::error::{RelayError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    request_id: u64,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// Root context with a fresh request id, no deadline and no parent.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Child context bounded by `timeout`.
    ///
    /// A zero timeout means "no additional bound"; the child still inherits the
    /// parent's deadline and cancellation. The earlier of the two deadlines wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let own = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: self.token.child_token(),
            deadline,
            request_id: self.request_id,
        }
    }

    /// Context that keeps this one's values but none of its cancellation or
    /// deadline. Cancelling `self` afterwards has no effect on the result.
    pub fn detached(&self) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            request_id: self.request_id,
        }
    }

    /// Cancel this context and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Error describing why the context is finished, if it is.
    pub fn err(&self) -> Option<RelayError> {
        if self.token.is_cancelled() {
            Some(RelayError::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(RelayError::Timeout)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes, yielding
    /// the matching error.
    pub async fn done(&self) -> RelayError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => RelayError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => RelayError::Timeout,
                }
            }
            None => {
                self.token.cancelled().await;
                RelayError::Cancelled
            }
        }
    }

    /// Drive `fut` until it completes or the context finishes, whichever comes
    /// first. The future is dropped when the context wins.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }
}
