//! Wildcard domain matcher
//!
//! A rule for `example.org` matches `example.org` and every subdomain
//! of it, but not `notexample.org`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::future::Cache;

use crate::error::AppError;
use crate::metrics::observe_cache_lookup;

/// A set of normalized domains matched by suffix
#[derive(Debug, Default, Clone)]
pub struct DomainSet {
    domains: HashSet<String>,
}

impl DomainSet {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains.into_iter().map(Into::into).collect(),
        }
    }

    /// True if `domain` or any parent domain of it is in the set
    pub fn matches(&self, domain: &str) -> bool {
        let mut candidate = domain;
        loop {
            if self.domains.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) => candidate = parent,
                None => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Lazily hydrated [`DomainSet`], cleared wholesale on any change
#[derive(Clone)]
pub struct DomainCache {
    name: &'static str,
    set: Cache<(), Arc<DomainSet>>,
    generation: Arc<AtomicU64>,
}

impl DomainCache {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            set: Cache::builder().max_capacity(1).build(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether `domain` matches, loading every rule on first use
    ///
    /// `load` returns all rule domains, already normalized.
    pub async fn matches<Fut>(&self, domain: &str, load: Fut) -> Result<bool, AppError>
    where
        Fut: Future<Output = Result<Vec<String>, AppError>>,
    {
        let set = match self.set.get(&()).await {
            Some(set) => {
                observe_cache_lookup(self.name, true);
                set
            }
            None => {
                observe_cache_lookup(self.name, false);
                let generation = self.generation.load(Ordering::Acquire);
                let set = self
                    .set
                    .try_get_with((), async {
                        let domains = load.await?;
                        tracing::debug!(cache = self.name, count = domains.len(), "Loaded domain rules");
                        Ok::<_, AppError>(Arc::new(DomainSet::new(domains)))
                    })
                    .await
                    .map_err(|err| (*err).clone())?;

                if self.generation.load(Ordering::Acquire) != generation {
                    self.set.invalidate_all();
                }
                set
            }
        };

        Ok(set.matches(domain))
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set.invalidate_all();
    }
}
