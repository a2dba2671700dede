//! Multi-index, load-once struct cache
//!
//! Values are cached once under their primary key and looked up
//! through any number of secondary indices. Concurrent misses for the
//! same key share a single in-flight load.
//!
//! Uses Moka for the size-bounded primary map; the secondary lookup
//! follows it through the eviction listener.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use moka::notification::RemovalCause;
use moka::sync::Cache;

use crate::error::AppError;
use crate::metrics::{CACHE_SIZE, observe_cache_lookup};

/// Separator between the parts of a composite key
const KEY_SEPARATOR: &str = "\u{1f}";

/// Join composite key parts
pub fn key(parts: &[&str]) -> String {
    parts.join(KEY_SEPARATOR)
}

/// A value that can live in a [`StructCache`]
pub trait Cacheable: Clone + Send + Sync + 'static {
    /// Index names this type is looked up by
    const INDICES: &'static [&'static str];

    fn primary_key(&self) -> String;

    /// Key under `index`, or `None` if the value has none there
    fn index_key(&self, index: &str) -> Option<String>;
}

/// Callback run for every value leaving or (re)entering the cache
pub type InvalidateHook<T> = Arc<dyn Fn(Arc<T>) -> BoxFuture<'static, ()> + Send + Sync>;

type LoadResult<T> = Result<Arc<T>, AppError>;
type LoadFuture<T> = Shared<BoxFuture<'static, LoadResult<T>>>;
type BatchFuture<T> = Shared<BoxFuture<'static, Result<Arc<HashMap<String, Arc<T>>>, AppError>>>;
type LookupKey = (&'static str, String);
type Evicted<T> = Arc<Mutex<Vec<(Arc<String>, Arc<T>)>>>;

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Every (index, key) pair `value` is reachable through
fn lookup_keys<T: Cacheable>(value: &T) -> Vec<LookupKey> {
    T::INDICES
        .iter()
        .filter_map(|index| value.index_key(index).map(|key| (*index, key)))
        .collect()
}

/// Secondary lookup and load bookkeeping, guarded by one mutex
struct Index<T> {
    lookup: HashMap<LookupKey, HashSet<String>>,
    in_flight: HashMap<LookupKey, (u64, LoadFuture<T>)>,
    /// Start stamps of loads that have not finished yet
    running: BTreeSet<u64>,
    /// Stamp of the last write to each key, kept while an older load runs
    touched: HashMap<LookupKey, u64>,
    cleared_at: u64,
    clock: u64,
}

impl<T: Cacheable> Index<T> {
    fn new() -> Self {
        Self {
            lookup: HashMap::new(),
            in_flight: HashMap::new(),
            running: BTreeSet::new(),
            touched: HashMap::new(),
            cleared_at: 0,
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn link(&mut self, pk: &str, value: &T) {
        for lookup_key in lookup_keys(value) {
            self.lookup.entry(lookup_key).or_default().insert(pk.to_string());
        }
    }

    fn unlink(&mut self, pk: &str, value: &T) {
        for lookup_key in lookup_keys(value) {
            if let Some(pks) = self.lookup.get_mut(&lookup_key) {
                pks.remove(pk);
                if pks.is_empty() {
                    self.lookup.remove(&lookup_key);
                }
            }
        }
    }

    /// Record a write to `keys`
    ///
    /// Later callers start a fresh load for these keys, and loads
    /// already running will not insert a value reachable through them.
    /// In-flight loads for other keys are untouched.
    fn touch(&mut self, keys: Vec<LookupKey>) {
        let stamp = self.tick();
        for lookup_key in keys {
            self.in_flight.remove(&lookup_key);
            if !self.running.is_empty() {
                self.touched.insert(lookup_key, stamp);
            }
        }
    }

    fn begin(&mut self) -> u64 {
        let started = self.tick();
        self.running.insert(started);
        started
    }

    fn is_stale(&self, started: u64, value: &T) -> bool {
        started < self.cleared_at
            || lookup_keys(value)
                .iter()
                .any(|lookup_key| self.touched.get(lookup_key).is_some_and(|stamp| *stamp > started))
    }

    fn finish(&mut self, keys: &[LookupKey], started: u64) {
        for lookup_key in keys {
            if self.in_flight.get(lookup_key).is_some_and(|(s, _)| *s == started) {
                self.in_flight.remove(lookup_key);
            }
        }
        self.running.remove(&started);
        match self.running.first().copied() {
            Some(oldest) => self.touched.retain(|_, stamp| *stamp > oldest),
            None => self.touched.clear(),
        }
    }
}

struct Inner<T> {
    name: &'static str,
    entries: Cache<String, Arc<T>>,
    index: Mutex<Index<T>>,
    /// Values moka dropped for size, waiting to be unlinked
    evicted: Evicted<T>,
    hook: RwLock<Option<InvalidateHook<T>>>,
}

impl<T: Cacheable> Inner<T> {
    /// Lock the index, first unlinking anything moka evicted
    ///
    /// The eviction listener only ever takes the `evicted` lock, so
    /// moka may run it while the index lock is held.
    fn index(&self) -> MutexGuard<'_, Index<T>> {
        let mut index = lock(&self.index);
        let evicted = std::mem::take(&mut *lock(&self.evicted));
        for (pk, value) in evicted {
            index.unlink(&pk, &value);
            if let Some(current) = self.entries.get(pk.as_str()) {
                index.link(&pk, &current);
            }
        }
        index
    }

    fn find(&self, index: &Index<T>, name: &'static str, key: &str) -> Option<Arc<T>> {
        let pks = index.lookup.get(&(name, key.to_string()))?;
        pks.iter().find_map(|pk| self.entries.get(pk))
    }

    /// Cache `value`, returning the value it replaced
    fn insert(&self, index: &mut Index<T>, value: Arc<T>) -> Option<Arc<T>> {
        let pk = value.primary_key();
        let old = self.remove(index, &pk);
        index.link(&pk, &value);
        self.entries.insert(pk, value);
        old
    }

    fn remove(&self, index: &mut Index<T>, pk: &str) -> Option<Arc<T>> {
        let value = self.entries.remove(pk)?;
        index.unlink(pk, &value);
        Some(value)
    }

    fn record_size(&self) {
        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(self.entries.entry_count() as i64);
    }

    /// Insert freshly loaded values unless a write touched them meanwhile
    fn complete(&self, started: u64, values: &[Arc<T>]) {
        let mut index = self.index();
        for value in values {
            if !index.is_stale(started, value) {
                self.insert(&mut index, value.clone());
            }
        }
        self.record_size();
    }
}

/// Marks a load finished however its future ends
struct LoadGuard<T: Cacheable> {
    inner: Arc<Inner<T>>,
    keys: Vec<LookupKey>,
    started: u64,
}

impl<T: Cacheable> Drop for LoadGuard<T> {
    fn drop(&mut self) {
        self.inner.index().finish(&self.keys, self.started);
    }
}

/// Load-once cache of `T` keyed by every index in `T::INDICES`
///
/// Cheap to clone; clones share storage.
pub struct StructCache<T: Cacheable> {
    inner: Arc<Inner<T>>,
}

impl<T: Cacheable> Clone for StructCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Cacheable> StructCache<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let evicted: Evicted<T> = Arc::new(Mutex::new(Vec::new()));
        let queue = evicted.clone();
        let entries = Cache::builder()
            .max_capacity(capacity.max(1) as u64)
            .eviction_listener(move |pk: Arc<String>, value: Arc<T>, cause: RemovalCause| {
                if cause.was_evicted() {
                    lock(&queue).push((pk, value));
                }
            })
            .build();

        Self {
            inner: Arc::new(Inner {
                name,
                entries,
                index: Mutex::new(Index::new()),
                evicted,
                hook: RwLock::new(None),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Register the callback run on store and invalidation
    pub fn set_invalidate_hook<F>(&self, hook: F)
    where
        F: Fn(Arc<T>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let mut slot = self.inner.hook.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(hook));
    }

    /// Run the invalidate hook for a value that may never have been cached
    pub async fn run_invalidate_hook(&self, value: T) {
        self.run_hooks(vec![Arc::new(value)]).await;
    }

    async fn run_hooks(&self, values: Vec<Arc<T>>) {
        let hook = self
            .inner
            .hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            for value in values {
                hook(value).await;
            }
        }
    }

    /// Cached value without loading
    pub fn get(&self, index: &'static str, key: &str) -> Option<T> {
        let guard = self.inner.index();
        self.inner.find(&guard, index, key).map(|value| (*value).clone())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.run_pending_tasks();
        drop(self.inner.index());
        self.inner.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn lookup_len(&self) -> usize {
        self.inner.index().lookup.values().map(HashSet::len).sum()
    }

    /// Cached value for `key` under `index`, or the result of `load`
    ///
    /// `load` runs at most once per key however many callers miss at
    /// the same time; they all receive its result. Errors are shared
    /// but never cached. The load is driven on its own task, so a
    /// caller that stops waiting does not stop it for the others.
    pub async fn load_one<F, Fut>(&self, index: &'static str, key: String, load: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        let pending = {
            let mut guard = self.inner.index();

            if let Some(value) = self.inner.find(&guard, index, &key) {
                observe_cache_lookup(self.inner.name, true);
                return Ok((*value).clone());
            }
            observe_cache_lookup(self.inner.name, false);

            let lookup_key = (index, key);
            match guard.in_flight.get(&lookup_key) {
                Some((_, pending)) => pending.clone(),
                None => {
                    let started = guard.begin();
                    let finished = LoadGuard {
                        inner: self.inner.clone(),
                        keys: vec![lookup_key.clone()],
                        started,
                    };
                    let fut = load();
                    let pending = async move {
                        let result = fut.await.map(Arc::new);
                        if let Ok(value) = &result {
                            finished.inner.complete(started, std::slice::from_ref(value));
                        }
                        drop(finished);
                        result
                    }
                    .boxed()
                    .shared();
                    guard.in_flight.insert(lookup_key, (started, pending.clone()));
                    tokio::spawn(pending.clone());
                    pending
                }
            }
        };

        pending.await.map(|value| (*value).clone())
    }

    /// Batched lookup by single-part keys under `index`
    ///
    /// `load` receives only the keys that are neither cached nor
    /// already being loaded. The result follows the order of `ids` and
    /// silently omits keys that did not resolve.
    pub async fn load_ids<F, Fut>(&self, index: &'static str, ids: &[String], load: F) -> Result<Vec<T>, AppError>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<T>, AppError>> + Send + 'static,
    {
        let keys = ids.iter().map(|id| (id.clone(), id.clone())).collect();
        self.load_many(index, keys, load).await
    }

    /// Batched lookup by two-part keys sharing the first part
    ///
    /// `load` receives `id1` and the uncached second parts.
    pub async fn load_ids_2part<F, Fut>(
        &self,
        index: &'static str,
        id1: &str,
        id2s: &[String],
        load: F,
    ) -> Result<Vec<T>, AppError>
    where
        F: FnOnce(String, Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<T>, AppError>> + Send + 'static,
    {
        let keys = id2s.iter().map(|id2| (key(&[id1, id2]), id2.clone())).collect();
        let id1 = id1.to_string();
        self.load_many(index, keys, move |uncached| load(id1, uncached)).await
    }

    /// `keys` pairs each cache key with the argument the loader needs
    async fn load_many<F, Fut>(
        &self,
        index: &'static str,
        keys: Vec<(String, String)>,
        load: F,
    ) -> Result<Vec<T>, AppError>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<T>, AppError>> + Send + 'static,
    {
        let mut found: HashMap<String, Arc<T>> = HashMap::new();
        let mut waiting: Vec<(String, LoadFuture<T>)> = Vec::new();

        {
            let mut guard = self.inner.index();
            let mut uncached: Vec<(String, String)> = Vec::new();

            for (cache_key, arg) in &keys {
                if found.contains_key(cache_key) || uncached.iter().any(|(k, _)| k == cache_key) {
                    continue;
                }
                if let Some(value) = self.inner.find(&guard, index, cache_key) {
                    observe_cache_lookup(self.inner.name, true);
                    found.insert(cache_key.clone(), value);
                    continue;
                }
                observe_cache_lookup(self.inner.name, false);
                match guard.in_flight.get(&(index, cache_key.clone())) {
                    Some((_, pending)) => waiting.push((cache_key.clone(), pending.clone())),
                    None => uncached.push((cache_key.clone(), arg.clone())),
                }
            }

            if !uncached.is_empty() {
                let started = guard.begin();
                let batch = self.start_batch(index, started, &uncached, load);
                tokio::spawn(batch.clone());

                for (cache_key, _) in uncached {
                    let wanted = cache_key.clone();
                    let pending: LoadFuture<T> = batch
                        .clone()
                        .map(move |result| {
                            result.and_then(|loaded| loaded.get(&wanted).cloned().ok_or(AppError::NotFound))
                        })
                        .boxed()
                        .shared();
                    guard
                        .in_flight
                        .insert((index, cache_key.clone()), (started, pending.clone()));
                    waiting.push((cache_key, pending));
                }
            }
        }

        for (cache_key, pending) in waiting {
            match pending.await {
                Ok(value) => {
                    found.insert(cache_key, value);
                }
                Err(AppError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(keys
            .iter()
            .filter_map(|(cache_key, _)| found.get(cache_key))
            .map(|value| (**value).clone())
            .collect())
    }

    fn start_batch<F, Fut>(
        &self,
        index: &'static str,
        started: u64,
        uncached: &[(String, String)],
        load: F,
    ) -> BatchFuture<T>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<T>, AppError>> + Send + 'static,
    {
        let finished = LoadGuard {
            inner: self.inner.clone(),
            keys: uncached.iter().map(|(k, _)| (index, k.clone())).collect(),
            started,
        };
        let fut = load(uncached.iter().map(|(_, arg)| arg.clone()).collect());

        async move {
            let values: Vec<Arc<T>> = fut.await?.into_iter().map(Arc::new).collect();
            finished.inner.complete(started, &values);
            drop(finished);
            let by_key: HashMap<String, Arc<T>> = values
                .into_iter()
                .filter_map(|value| value.index_key(index).map(|k| (k, value)))
                .collect();
            Ok(Arc::new(by_key))
        }
        .boxed()
        .shared()
    }

    /// Run `persist`, then cache `value` under every index
    ///
    /// No cache lock is held while `persist` runs. If it fails, whatever
    /// was cached under the value's primary key is evicted, since the
    /// database may no longer agree with it.
    pub async fn store<Fut>(&self, value: T, persist: Fut) -> Result<(), AppError>
    where
        Fut: Future<Output = Result<(), AppError>>,
    {
        let value = Arc::new(value);

        if let Err(err) = persist.await {
            let removed = {
                let mut guard = self.inner.index();
                let removed = self.inner.remove(&mut guard, &value.primary_key());
                let mut keys = lookup_keys(&*value);
                if let Some(old) = &removed {
                    keys.extend(lookup_keys(&**old));
                }
                guard.touch(keys);
                self.inner.record_size();
                removed
            };
            if let Some(old) = removed {
                tracing::debug!(cache = self.inner.name, error = %err, "Evicted cached value after failed write");
                self.run_hooks(vec![old]).await;
            }
            return Err(err);
        }

        {
            let mut guard = self.inner.index();
            let mut keys = lookup_keys(&*value);
            if let Some(old) = self.inner.insert(&mut guard, value.clone()) {
                keys.extend(lookup_keys(&*old));
            }
            guard.touch(keys);
            self.inner.record_size();
        }

        self.run_hooks(vec![value]).await;
        Ok(())
    }

    /// Evict every value cached under `key` in `index`
    ///
    /// The hook only runs for values that were actually cached.
    pub async fn invalidate(&self, index: &'static str, key: &str) {
        self.invalidate_keys(index, std::slice::from_ref(&key.to_string())).await;
    }

    /// Evict every value cached under any of `keys` in `index`
    pub async fn invalidate_ids(&self, index: &'static str, keys: &[String]) {
        self.invalidate_keys(index, keys).await;
    }

    async fn invalidate_keys(&self, index: &'static str, keys: &[String]) {
        let removed = {
            let mut guard = self.inner.index();
            let mut touched: Vec<LookupKey> = keys.iter().map(|key| (index, key.clone())).collect();

            let pks: HashSet<String> = touched
                .iter()
                .filter_map(|lookup_key| guard.lookup.get(lookup_key))
                .flat_map(|pks| pks.iter().cloned())
                .collect();
            let removed: Vec<Arc<T>> = pks
                .iter()
                .filter_map(|pk| self.inner.remove(&mut guard, pk))
                .collect();

            for value in &removed {
                touched.extend(lookup_keys(&**value));
            }
            guard.touch(touched);
            self.inner.record_size();
            removed
        };

        if !removed.is_empty() {
            tracing::debug!(cache = self.inner.name, index, count = removed.len(), "Invalidated cached values");
        }
        self.run_hooks(removed).await;
    }

    /// Drop everything without running hooks
    pub fn clear(&self) {
        let mut guard = self.inner.index();
        guard.cleared_at = guard.tick();
        guard.in_flight.clear();
        guard.touched.clear();
        guard.lookup.clear();
        self.inner.entries.invalidate_all();
        self.inner.record_size();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        owner: String,
        name: String,
    }

    impl Item {
        fn new(id: &str, owner: &str, name: &str) -> Self {
            Self {
                id: id.to_string(),
                owner: owner.to_string(),
                name: name.to_string(),
            }
        }
    }

    impl Cacheable for Item {
        const INDICES: &'static [&'static str] = &["ID", "Owner", "Owner,Name"];

        fn primary_key(&self) -> String {
            self.id.clone()
        }

        fn index_key(&self, index: &str) -> Option<String> {
            match index {
                "ID" => Some(self.id.clone()),
                "Owner" => Some(self.owner.clone()),
                "Owner,Name" => Some(key(&[&self.owner, &self.name])),
                _ => None,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_load_once() {
        let cache = StructCache::<Item>::new("test", 16);
        let loads = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let loads = loads.clone();
                tokio::spawn(async move {
                    cache
                        .load_one("ID", "a".to_string(), move || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Item::new("a", "o", "n"))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().id, "a");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn errors_fan_out_and_are_not_cached() {
        let cache = StructCache::<Item>::new("test", 16);
        let loads = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let loads = loads.clone();
                tokio::spawn(async move {
                    cache
                        .load_one("ID", "a".to_string(), move || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err::<Item, _>(AppError::NotFound)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert!(matches!(task.await.unwrap(), Err(AppError::NotFound)));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let item = cache
            .load_one("ID", "a".to_string(), || async { Ok(Item::new("a", "o", "n")) })
            .await
            .unwrap();
        assert_eq!(item.owner, "o");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn values_are_reachable_through_every_index() {
        let cache = StructCache::<Item>::new("test", 16);
        cache
            .store(Item::new("a", "o", "n"), async { Ok(()) })
            .await
            .unwrap();

        assert!(cache.get("ID", "a").is_some());
        assert!(cache.get("Owner", "o").is_some());
        assert!(cache.get("Owner,Name", &key(&["o", "n"])).is_some());

        cache.invalidate("Owner", "o").await;
        assert!(cache.get("ID", "a").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failed_persist_caches_nothing() {
        let cache = StructCache::<Item>::new("test", 16);
        let result = cache
            .store(Item::new("a", "o", "n"), async { Err(AppError::Conflict("race".into())) })
            .await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert!(cache.get("ID", "a").is_none());
    }

    #[tokio::test]
    async fn batch_loads_only_uncached_ids_in_input_order() {
        let cache = StructCache::<Item>::new("test", 16);
        cache
            .store(Item::new("b", "o", "b"), async { Ok(()) })
            .await
            .unwrap();

        let requested = Arc::new(Mutex::new(Vec::new()));
        let seen = requested.clone();
        let ids: Vec<String> = ["c", "b", "missing", "a"].iter().map(|s| s.to_string()).collect();

        let items = cache
            .load_ids("ID", &ids, move |uncached| async move {
                seen.lock().unwrap().extend(uncached.clone());
                Ok(uncached
                    .into_iter()
                    .filter(|id| id != "missing")
                    .map(|id| Item::new(&id, "o", &id))
                    .collect())
            })
            .await
            .unwrap();

        let got: Vec<_> = items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(got, vec!["c", "b", "a"]);
        assert_eq!(*requested.lock().unwrap(), vec!["c", "missing", "a"]);
    }

    #[tokio::test]
    async fn two_part_batches_key_on_both_parts() {
        let cache = StructCache::<Item>::new("test", 16);
        let names: Vec<String> = vec!["x".to_string(), "y".to_string()];

        let items = cache
            .load_ids_2part("Owner,Name", "o", &names, |owner, uncached| async move {
                Ok(uncached
                    .into_iter()
                    .map(|name| Item::new(&format!("id-{name}"), &owner, &name))
                    .collect())
            })
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert!(cache.get("Owner,Name", &key(&["o", "y"])).is_some());
    }

    #[tokio::test]
    async fn stale_load_does_not_overwrite_invalidation() {
        let cache = StructCache::<Item>::new("test", 16);
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        let loader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .load_one("ID", "a".to_string(), move || async move {
                        let _ = wait.await;
                        Ok(Item::new("a", "o", "stale"))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.invalidate("ID", "a").await;
        release.send(()).unwrap();

        assert_eq!(loader.await.unwrap().unwrap().name, "stale");
        assert!(cache.get("ID", "a").is_none());
    }

    #[tokio::test]
    async fn hook_runs_on_store_and_cached_invalidation_only() {
        let cache = StructCache::<Item>::new("test", 16);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        cache.set_invalidate_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        });

        cache
            .store(Item::new("a", "o", "n"), async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate("ID", "never-cached").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate("ID", "a").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.run_invalidate_hook(Item::new("z", "o", "n")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_persist_evicts_the_previous_value() {
        let cache = StructCache::<Item>::new("test", 16);
        cache
            .store(Item::new("a", "o", "old"), async { Ok(()) })
            .await
            .unwrap();

        let result = cache
            .store(Item::new("a", "o", "new"), async { Err(AppError::Conflict("race".into())) })
            .await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert!(cache.get("ID", "a").is_none());
        assert!(cache.get("Owner,Name", &key(&["o", "old"])).is_none());
        assert_eq!(cache.lookup_len(), 0);

        let reloaded = cache
            .load_one("ID", "a".to_string(), || async { Ok(Item::new("a", "o", "fresh")) })
            .await
            .unwrap();
        assert_eq!(reloaded.name, "fresh");
    }

    #[tokio::test]
    async fn writes_to_other_keys_keep_loads_shared() {
        let cache = StructCache::<Item>::new("test", 16);
        let loads = Arc::new(AtomicUsize::new(0));
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let cache = cache.clone();
            let loads = loads.clone();
            tokio::spawn(async move {
                cache
                    .load_one("ID", "a".to_string(), move || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        let _ = wait.await;
                        Ok(Item::new("a", "o", "n"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache
            .store(Item::new("b", "p", "n"), async { Ok(()) })
            .await
            .unwrap();
        cache.invalidate("ID", "c").await;

        let second = {
            let cache = cache.clone();
            let loads = loads.clone();
            tokio::spawn(async move {
                cache
                    .load_one("ID", "a".to_string(), move || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok(Item::new("a", "o", "n"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.send(()).unwrap();

        assert_eq!(first.await.unwrap().unwrap().id, "a");
        assert_eq!(second.await.unwrap().unwrap().id, "a");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(cache.get("ID", "a").is_some());
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_stop_the_load() {
        let cache = StructCache::<Item>::new("test", 16);
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .load_one("ID", "a".to_string(), move || async move {
                        let _ = wait.await;
                        Ok(Item::new("a", "o", "n"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        release.send(()).unwrap();
        let item = cache
            .load_one("ID", "a".to_string(), || async { Err(AppError::NotFound) })
            .await
            .unwrap();
        assert_eq!(item.id, "a");
    }

    #[tokio::test]
    async fn storing_one_key_repeatedly_keeps_a_single_entry() {
        let cache = StructCache::<Item>::new("test", 16);
        for i in 0..1_000 {
            let item = Item::new("a", "o", &format!("n{}", i % 7));
            cache.store(item, async { Ok(()) }).await.unwrap();
        }

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup_len(), Item::INDICES.len());
        assert_eq!(cache.get("ID", "a").unwrap().name, "n5");
    }

    #[tokio::test]
    async fn capacity_bounds_entries_and_lookups() {
        let cache = StructCache::<Item>::new("test", 4);
        for i in 0..64 {
            let id = format!("item-{i}");
            cache.store(Item::new(&id, &id, "n"), async { Ok(()) }).await.unwrap();
        }

        let len = cache.len();
        assert!(len <= 4, "cache holds {len} entries");
        assert!(cache.lookup_len() <= len * Item::INDICES.len());
    }
}
