use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::OperationError;

#[derive(Debug, Clone, Default)]
/// The cancellation scope of a unit of work.
///
/// Every operation issued through a [crate::Handle] checks the context
/// before touching a pool and stops waiting on the pool once the context
/// is cancelled or its deadline passes.
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context which is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Creates a context cancelled alongside the given token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Sets a deadline `timeout` from now.
    ///
    /// An existing earlier deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets the deadline of the context.
    ///
    /// An existing earlier deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Creates a child context which is cancelled when this context is,
    /// but can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels the context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns why the context is finished, if it is.
    pub fn err(&self) -> Option<OperationError> {
        if self.token.is_cancelled() {
            return Some(OperationError::Cancelled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(OperationError::DeadlineExceeded)
            },
            _ => None,
        }
    }

    /// Fails if the context is already finished.
    pub fn check(&self) -> Result<(), OperationError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Waits until the context is cancelled or its deadline passes.
    pub async fn done(&self) -> OperationError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => OperationError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => OperationError::DeadlineExceeded,
                }
            },
            None => {
                self.token.cancelled().await;
                OperationError::Cancelled
            },
        }
    }
}
