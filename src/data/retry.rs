//! Busy/locked retry with exponential backoff
//!
//! SQLite rejects writers with SQLITE_BUSY while another connection
//! holds the write lock. The driver-level busy handler is disabled and
//! callers retry here instead, so that every wait can be cancelled.

use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::context::Ctx;
use crate::error::AppError;
use crate::metrics::{DB_BUSY_RETRIES_TOTAL, DB_BUSY_TIMEOUTS_TOTAL};

/// Backoff bounds for busy retries
#[derive(Debug, Clone, Copy)]
pub struct BusyPolicy {
    /// Delay unit; the first sleep is twice this
    pub base: Duration,
    /// Stop retrying once the next sleep would reach this
    pub ceiling: Duration,
}

impl BusyPolicy {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            base: config.busy_backoff_base(),
            ceiling: config.busy_backoff_ceiling(),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
            waited: Duration::ZERO,
        }
    }
}

impl Default for BusyPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2),
            ceiling: Duration::from_secs(300),
        }
    }
}

/// Backoff state for one retried operation
#[derive(Debug)]
pub struct Backoff {
    policy: BusyPolicy,
    attempt: u32,
    waited: Duration,
}

impl Backoff {
    /// Next sleep, doubling each time, or `None` once the ceiling is hit
    pub fn next_delay(&mut self) -> Option<Duration> {
        let factor = 1u32.checked_shl(self.attempt + 1)?;
        let delay = self.policy.base.checked_mul(factor)?;
        if delay >= self.policy.ceiling {
            return None;
        }
        self.attempt += 1;
        Some(delay)
    }

    /// Total time slept so far
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Sleep for the next delay
    ///
    /// # Errors
    /// `BusyTimeout` once the ceiling is reached, or the context's
    /// cancellation error if it fires first. Cancellation always wins
    /// over the timeout.
    pub async fn wait(&mut self, ctx: &Ctx) -> Result<(), AppError> {
        ctx.check()?;

        let Some(delay) = self.next_delay() else {
            DB_BUSY_TIMEOUTS_TOTAL.inc();
            tracing::warn!(waited = ?self.waited, "Giving up on busy database");
            return Err(AppError::BusyTimeout {
                waited: self.waited,
            });
        };

        DB_BUSY_RETRIES_TOTAL.inc();
        tracing::debug!(attempt = self.attempt, ?delay, "Database busy, backing off");

        tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }

        self.waited += delay;
        Ok(())
    }
}
