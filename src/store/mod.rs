//! Cache-through repository
//!
//! [`Store`] is the only way application code reads or writes rows.
//! Reads go through the caches and fall back to the database; writes
//! persist first and then update or invalidate every cache the row
//! could be held in.
//!
//! Each entity lives in its own submodule as an `impl Store` block.

mod account;
mod conversation;
mod domain;
mod instance_key;
mod marker;
mod status;

pub use domain::{normalize_domain, resolve_blocked};

use sqlx::{QueryBuilder, Sqlite};

use crate::cache::Caches;
use crate::config::{AppConfig, InstanceConfig};
use crate::data::Database;
use crate::error::{AppError, Result};
use crate::metrics::POPULATE_FAILURES_TOTAL;

/// Storage service shared by every request handler
///
/// Cheap to clone; clones share the pool and caches.
#[derive(Clone)]
pub struct Store {
    db: Database,
    caches: Caches,
    instance: InstanceConfig,
}

impl Store {
    /// Connect to the configured database and build fresh caches
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let db = Database::connect(&config.database).await?;
        let caches = Caches::new(&config.cache);
        Ok(Self::new(db, caches, config.instance.clone()))
    }

    pub fn new(db: Database, caches: Caches, instance: InstanceConfig) -> Self {
        Self {
            db,
            caches,
            instance,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Drop caches and close the pool
    pub async fn close(&self) {
        self.caches.clear();
        self.db.close().await;
    }
}

/// Log and count an entity dropped from a batch result
fn drop_unpopulated(entity: &'static str, id: &str, err: &AppError) {
    tracing::error!(entity, id, error = %err, "Error populating entity, dropping it from results");
    POPULATE_FAILURES_TOTAL.with_label_values(&[entity]).inc();
}

/// `SELECT * FROM table WHERE column IN (?, ?, ...)`
fn select_in<'a>(table: &str, column: &str, values: &'a [String]) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new(format!("SELECT * FROM {table} WHERE {column} IN ("));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.as_str());
    }
    separated.push_unseparated(")");
    qb
}
