//! Per-request context
//!
//! Carries the barebones flag, a cancellation token and an optional
//! deadline through every storage call.

use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Request context
///
/// Cheap to clone. Derived contexts share the parent's cancellation
/// token, so cancelling the parent cancels everything started from it.
#[derive(Debug, Clone, Default)]
pub struct Ctx {
    barebones: bool,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Ctx {
    /// Background context: never cancelled, no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that is cancelled when `token` is
    pub fn with_cancel(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..Self::default()
        }
    }

    /// Copy of this context with a deadline
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Copy of this context asking for rows only, no relations
    pub fn barebones(&self) -> Self {
        Self {
            barebones: true,
            ..self.clone()
        }
    }

    /// Background copy keeping only the barebones flag
    ///
    /// Work shared by several callers runs under this; each caller
    /// waits for it through its own [`Ctx::run`].
    pub fn detached(&self) -> Self {
        Self {
            barebones: self.barebones,
            ..Self::default()
        }
    }

    pub fn is_barebones(&self) -> bool {
        self.barebones
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the cancellation error if the context is already done
    pub fn check(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(AppError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves with the reason once the context is cancelled or
    /// its deadline passes. Pending forever for a background context.
    pub async fn done(&self) -> AppError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => AppError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => AppError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                AppError::Cancelled
            }
        }
    }

    /// Run `fut`, abandoning it as soon as the context is done
    pub async fn run<T, F>(&self, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            result = fut => result,
        }
    }
}
