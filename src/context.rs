//! Cancellation context shared by every phase of a sync job
//!
//! A single [`OperationContext`] is created per command. It fires either when
//! cancelled explicitly (Ctrl-C) or when the optional command timeout elapses,
//! and is threaded through source resolution, every copy attempt and every
//! retry wait.

use crate::error::{Result, SyncError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OperationContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OperationContext {
    /// A context that only fires when cancelled explicitly
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that additionally expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => Self::with_timeout(timeout),
            None => Self::background(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context is done, or `None` while it is still live
    pub fn err(&self) -> Option<SyncError> {
        if self.token.is_cancelled() {
            return Some(SyncError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(SyncError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) -> SyncError {
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = self.token.cancelled() => SyncError::Cancelled,
            _ = expired => SyncError::DeadlineExceeded,
        }
    }

    /// Run `future` unless the context fires first
    pub async fn guard<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            err = self.done() => Err(err),
            result = future => result,
        }
    }
}
