//! Column-set aware statement builders
//!
//! Every insert, update and upsert of a model row is built here so the
//! "partial update always also writes `updated_at`" rule lives in one
//! place.

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

/// A persisted row type with a typed column set
pub trait Model {
    type Column: Copy + PartialEq + fmt::Debug + 'static;

    /// Every persisted non-key column, in table order
    const ALL: &'static [Self::Column];
    /// Column stamped on every write, if the table has one
    const UPDATED_AT: Option<Self::Column>;
    /// Primary key column names
    const KEY_COLUMNS: &'static [&'static str];

    fn table(&self) -> &'static str;
    fn column_name(column: Self::Column) -> &'static str;
    /// Bind this row's value for `column`
    fn push_column<'a>(&'a self, column: Self::Column, qb: &mut QueryBuilder<'a, Sqlite>);
    /// Bind this row's value for the `index`th key column
    fn push_key<'a>(&'a self, index: usize, qb: &mut QueryBuilder<'a, Sqlite>);
    fn set_updated_at(&mut self, now: DateTime<Utc>);
}

/// Resolve the columns an update writes
///
/// Empty means every persisted column. Otherwise the given columns,
/// de-duplicated, with `updated_at` appended when missing.
pub fn update_columns<M: Model>(columns: &[M::Column]) -> Vec<M::Column> {
    if columns.is_empty() {
        return M::ALL.to_vec();
    }

    let mut resolved: Vec<M::Column> = Vec::with_capacity(columns.len() + 1);
    for column in columns.iter().copied().chain(M::UPDATED_AT) {
        if !resolved.contains(&column) {
            resolved.push(column);
        }
    }
    resolved
}

/// Stamp `updated_at` with the current time
pub fn touch<M: Model>(model: &mut M) {
    model.set_updated_at(Utc::now());
}

/// `INSERT INTO t (keys.., cols..) VALUES (...)`
pub fn insert<'a, M: Model>(model: &'a M) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new("INSERT INTO ");
    push_insert_body(&mut qb, model);
    qb
}

/// Insert, or on primary key conflict update only `columns`
pub fn upsert<'a, M: Model>(model: &'a M, columns: &[M::Column]) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new("INSERT INTO ");
    push_insert_body(&mut qb, model);

    qb.push(" ON CONFLICT (");
    qb.push(M::KEY_COLUMNS.join(", "));
    qb.push(") DO UPDATE SET ");
    for (i, column) in update_columns::<M>(columns).into_iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        let name = M::column_name(column);
        qb.push(format!("{name} = excluded.{name}"));
    }
    qb
}

/// `UPDATE t SET cols.. WHERE keys..`
pub fn update<'a, M: Model>(model: &'a M, columns: &[M::Column]) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new("UPDATE ");
    qb.push(model.table());
    qb.push(" SET ");
    for (i, column) in update_columns::<M>(columns).into_iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(M::column_name(column));
        qb.push(" = ");
        model.push_column(column, &mut qb);
    }
    push_key_filter(&mut qb, model);
    qb
}

/// `WHERE k1 = ? AND k2 = ?` for the model's own key
pub fn push_key_filter<'a, M: Model>(qb: &mut QueryBuilder<'a, Sqlite>, model: &'a M) {
    qb.push(" WHERE ");
    for (i, key) in M::KEY_COLUMNS.iter().enumerate() {
        if i > 0 {
            qb.push(" AND ");
        }
        qb.push(*key);
        qb.push(" = ");
        model.push_key(i, qb);
    }
}

fn push_insert_body<'a, M: Model>(qb: &mut QueryBuilder<'a, Sqlite>, model: &'a M) {
    qb.push(model.table());
    qb.push(" (");
    let names: Vec<&str> = M::KEY_COLUMNS
        .iter()
        .copied()
        .chain(M::ALL.iter().map(|column| M::column_name(*column)))
        .collect();
    qb.push(names.join(", "));
    qb.push(") VALUES (");
    for i in 0..M::KEY_COLUMNS.len() {
        if i > 0 {
            qb.push(", ");
        }
        model.push_key(i, qb);
    }
    for column in M::ALL {
        qb.push(", ");
        model.push_column(*column, qb);
    }
    qb.push(")");
}
