//! Cancellation for blocking database calls.
//!
//! Every engine operation takes a `Context`. Cancelling it (or letting its deadline pass)
//! aborts the statement currently running on the database and surfaces as
//! `StorageError::Cancelled` / `StorageError::DeadlineExceeded`, never as partial data.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::storage::{StorageError, StorageResult};

/// A cancellation token with an optional deadline.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled unless `cancel` is called.
    pub fn background() -> Self {
        Self::default()
    }

    /// Wraps an existing token, e.g. one owned by a service's shutdown path.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child that is cancelled with this context and also expires after `timeout`.
    ///
    /// Cancelling the child does not cancel the parent.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    /// Cancels this context, its clones and its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The error this context resolves to, if it is done.
    pub fn err(&self) -> Option<StorageError> {
        if self.token.is_cancelled() {
            return Some(StorageError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StorageError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Fails fast if the context is already done.
    pub fn check(&self) -> StorageResult<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_live() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.check().is_ok());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let ctx = Context::background();
        let child = ctx.with_timeout(Duration::from_secs(60));
        ctx.cancel();
        assert!(matches!(child.check(), Err(StorageError::Cancelled)));
    }

    #[test]
    fn test_child_cancel_leaves_parent_live() {
        let ctx = Context::background();
        let child = ctx.with_timeout(Duration::from_secs(60));
        child.cancel();
        assert!(child.is_done());
        assert!(!ctx.is_done());
    }

    #[test]
    fn test_cancel_through_shared_token() {
        let token = CancellationToken::new();
        let ctx = Context::from_token(token.clone());
        token.cancel();
        assert!(matches!(ctx.err(), Some(StorageError::Cancelled)));
        assert!(ctx.token().is_cancelled());
    }

    #[test]
    fn test_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert!(matches!(ctx.err(), Some(StorageError::DeadlineExceeded)));
    }

    #[test]
    fn test_child_keeps_earlier_deadline() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(3600));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
