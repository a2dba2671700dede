//! Data layer module
//!
//! Handles persistence:
//! - SQLite executor with busy retry
//! - Row models and their typed column sets
//! - Statement builders for column-set writes

mod database;
mod models;
pub mod query;
mod retry;

pub use database::Database;
pub use models::*;
pub use retry::{Backoff, BusyPolicy};
