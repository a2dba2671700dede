//! SQLite executor
//!
//! All database access goes through [`Database::query`] or
//! [`Database::run_in_tx`]. Both retry SQLITE_BUSY with backoff and
//! abandon the attempt as soon as the caller's context is done.

use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};

use super::retry::BusyPolicy;
use crate::config::DatabaseConfig;
use crate::context::Ctx;
use crate::error::AppError;
use crate::metrics::observe_db_operation;

/// Database connection pool wrapper.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    busy: BusyPolicy,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| AppError::from(sqlx::Error::Io(e)))?;
        }

        let pool = open_pool(
            &config.path,
            config.max_connections,
            Duration::from_millis(config.sqlite_busy_timeout_ms),
        )
        .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            AppError::from(e)
        })?;

        tracing::info!(
            path = %config.path.display(),
            "Database connected and migrated successfully"
        );

        Ok(Self {
            pool,
            busy: BusyPolicy::from_config(config),
        })
    }

    /// Replace the busy backoff bounds
    pub fn with_busy_policy(mut self, busy: BusyPolicy) -> Self {
        self.busy = busy;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `f` on a pooled connection, outside any explicit transaction
    ///
    /// `f` may run more than once: it is retried whenever the database
    /// reports busy. It must therefore own (clone) whatever it needs
    /// inside the returned future.
    pub async fn query<T, F>(&self, ctx: &Ctx, operation: &'static str, mut f: F) -> Result<T, AppError>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>> + Send,
    {
        let mut backoff = self.busy.backoff();
        loop {
            let attempt = async {
                let mut conn = self.pool.acquire().await?;
                f(&mut *conn).await
            };

            match ctx.run(attempt).await {
                Err(AppError::Busy) => {
                    if let Err(err) = backoff.wait(ctx).await {
                        observe_db_operation(operation, err.error_type());
                        return Err(err);
                    }
                }
                result => {
                    observe(operation, &result);
                    return result;
                }
            }
        }
    }

    /// Run `f` inside a transaction, committing on success
    ///
    /// Any error rolls the whole transaction back; a busy error retries
    /// the whole transaction from the start. A cancelled or panicking
    /// caller drops the transaction, which rolls it back as well.
    pub async fn run_in_tx<T, F>(&self, ctx: &Ctx, operation: &'static str, mut f: F) -> Result<T, AppError>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>> + Send,
    {
        let mut backoff = self.busy.backoff();
        loop {
            let attempt = async {
                let mut tx = self.pool.begin().await?;
                match f(&mut *tx).await {
                    Ok(value) => {
                        tx.commit().await?;
                        Ok(value)
                    }
                    Err(err) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            tracing::warn!(operation, error = %rollback_err, "Rollback failed");
                        }
                        Err(err)
                    }
                }
            };

            match ctx.run(attempt).await {
                Err(AppError::Busy) => {
                    tracing::debug!(operation, "Transaction hit a busy database");
                    if let Err(err) = backoff.wait(ctx).await {
                        observe_db_operation(operation, err.error_type());
                        return Err(err);
                    }
                }
                result => {
                    observe(operation, &result);
                    return result;
                }
            }
        }
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database closed");
    }
}

async fn open_pool(path: &Path, max_connections: u32, busy_timeout: Duration) -> Result<SqlitePool, AppError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

fn observe<T>(operation: &str, result: &Result<T, AppError>) {
    match result {
        Ok(_) => observe_db_operation(operation, "ok"),
        // Absence is an answer, not a failure.
        Err(AppError::NotFound) => observe_db_operation(operation, "not_found"),
        Err(err) => {
            tracing::debug!(operation, error = %err, "Database operation failed");
            observe_db_operation(operation, err.error_type());
        }
    }
}
