//! Single-value cache for singleton rows

use std::future::Future;
use std::sync::Arc;

use moka::future::Cache;

use crate::error::AppError;
use crate::metrics::observe_cache_lookup;

/// Load-once holder of one value
#[derive(Clone)]
pub struct ValueCache<T: Clone + Send + Sync + 'static> {
    name: &'static str,
    value: Cache<(), Arc<T>>,
}

impl<T: Clone + Send + Sync + 'static> ValueCache<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Cache::builder().max_capacity(1).build(),
        }
    }

    pub async fn get_or_load<Fut>(&self, load: Fut) -> Result<T, AppError>
    where
        Fut: Future<Output = Result<T, AppError>>,
    {
        if let Some(value) = self.value.get(&()).await {
            observe_cache_lookup(self.name, true);
            return Ok((*value).clone());
        }
        observe_cache_lookup(self.name, false);

        let value = self
            .value
            .try_get_with((), async { load.await.map(Arc::new) })
            .await
            .map_err(|err| (*err).clone())?;
        Ok((*value).clone())
    }

    pub async fn set(&self, value: T) {
        self.value.insert((), Arc::new(value)).await;
    }

    pub fn clear(&self) {
        self.value.invalidate_all();
    }
}
