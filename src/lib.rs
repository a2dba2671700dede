//! fedistore - cache-coherent storage for a federated social server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Store (store::*)                       │
//! │  - get / get-by-ids / put / update / delete per entity       │
//! │  - relation population with MultiError                       │
//! │  - conversation last-status maintenance                      │
//! │  - domain permission resolution, marker compare-and-swap     │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                               │
//! ┌──────────────────────────────┐ ┌────────────────────────────┐
//! │        Caches (cache::*)      │ │    Executor (data::*)      │
//! │  - load-once struct caches    │ │  - SQLite pool (sqlx)      │
//! │  - ID list / domain / value   │ │  - busy retry + backoff    │
//! │  - invalidation hooks         │ │  - scoped transactions     │
//! └──────────────────────────────┘ └────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `store`: The repository every caller goes through
//! - `cache`: In-memory caches owned by [`cache::Caches`]
//! - `data`: Database executor, row models and statement builders
//! - `context`: Per-call cancellation, deadline and barebones flag
//! - `paging`: ID-window paging over cached lists
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod cache;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod metrics;
pub mod paging;
pub mod store;

pub use context::Ctx;
pub use error::{AppError, MultiError, Result};
pub use store::Store;
