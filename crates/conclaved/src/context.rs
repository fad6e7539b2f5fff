//! Cancellation contexts that remember why they were cancelled.
//!
//! A [`Context`] wraps a [`CancellationToken`] and records the first
//! [`Cause`] it was cancelled with. Children are cancelled together with
//! their parent and report the parent's cause unless they were cancelled
//! on their own first.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Reason a context was cancelled
#[derive(Clone, PartialEq, Eq)]
pub struct Cause(Arc<str>);

impl Cause {
    pub fn new(message: impl Into<String>) -> Self {
        Self(Arc::from(message.into()))
    }

    /// Cause reported when a context was cancelled without one
    pub fn canceled() -> Self {
        Self::new("context canceled")
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cause({:?})", &*self.0)
    }
}

impl std::error::Error for Cause {}

impl From<&str> for Cause {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Cause {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Cancellable context carrying a cancellation cause
#[derive(Clone)]
pub struct Context {
    token: CancellationToken,
    cause: Arc<OnceLock<Cause>>,
    parent: Option<Arc<Context>>,
}

impl Context {
    /// A new root context
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    /// A context cancelled whenever `self` is
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// A child context that cancels itself with `cause` after `timeout`
    pub fn with_timeout(&self, timeout: Duration, cause: impl Into<Cause>) -> Self {
        let child = self.child();
        let cause = cause.into();
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => timer.cancel(cause),
                _ = timer.token.cancelled() => {}
            }
        });
        child
    }

    /// Cancel with `cause`. Only the first cause is kept, and a context
    /// already cancelled through its parent keeps the parent's cause.
    pub fn cancel(&self, cause: impl Into<Cause>) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.cause.set(cause.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The cancellation cause, or `None` while the context is live
    pub fn cause(&self) -> Option<Cause> {
        if !self.token.is_cancelled() {
            return None;
        }
        if let Some(cause) = self.cause.get() {
            return Some(cause.clone());
        }
        match &self.parent {
            Some(parent) => parent.cause().or_else(|| Some(Cause::canceled())),
            None => Some(Cause::canceled()),
        }
    }

    /// `Err(cause)` once cancelled
    pub fn check(&self) -> Result<(), Cause> {
        match self.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Resolves with the cause once the context is cancelled
    pub async fn done(&self) -> Cause {
        self.token.cancelled().await;
        self.cause().unwrap_or_else(Cause::canceled)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}
