//! Per-key ID list cache
//!
//! Holds newest-first ID lists (e.g. an account's conversations by
//! last status) and serves pages out of them.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::future::Cache;

use crate::error::AppError;
use crate::metrics::{CACHE_SIZE, observe_cache_lookup};
use crate::paging::Page;

/// Load-once cache of ID lists
#[derive(Clone)]
pub struct SliceCache {
    name: &'static str,
    lists: Cache<String, Arc<Vec<String>>>,
    generation: Arc<AtomicU64>,
}

impl SliceCache {
    pub fn new(name: &'static str, max_items: u64) -> Self {
        let lists = Cache::builder().max_capacity(max_items).build();

        Self {
            name,
            lists,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The page of the list under `key`, loading the full list if needed
    ///
    /// `load` must return the whole list, newest first.
    pub async fn load<Fut>(&self, key: &str, page: Option<&Page>, load: Fut) -> Result<Vec<String>, AppError>
    where
        Fut: Future<Output = Result<Vec<String>, AppError>>,
    {
        let ids = match self.lists.get(key).await {
            Some(ids) => {
                observe_cache_lookup(self.name, true);
                ids
            }
            None => {
                observe_cache_lookup(self.name, false);
                let generation = self.generation.load(Ordering::Acquire);
                let ids = self
                    .lists
                    .try_get_with(key.to_string(), async { load.await.map(Arc::new) })
                    .await
                    .map_err(|err: Arc<AppError>| (*err).clone())?;

                // Invalidated while loading: the list may predate the change.
                if self.generation.load(Ordering::Acquire) != generation {
                    self.lists.invalidate(key).await;
                }
                CACHE_SIZE
                    .with_label_values(&[self.name])
                    .set(self.lists.entry_count() as i64);
                ids
            }
        };

        Ok(match page {
            Some(page) => page.apply(&ids),
            None => ids.to_vec(),
        })
    }

    pub async fn invalidate(&self, key: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.lists.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.lists.invalidate_all();
    }
}
