//! In-memory caches
//!
//! These caches are volatile and cleared on restart. Every cache lives
//! in one [`Caches`] service that is built at startup, handed to the
//! store and torn down with [`Caches::clear`].
//!
//! Cached structs are always barebones rows; relations are hydrated
//! on the copy handed back to the caller.

mod domain_cache;
mod slice_cache;
mod struct_cache;
mod value_cache;

pub use domain_cache::{DomainCache, DomainSet};
pub use slice_cache::SliceCache;
pub use struct_cache::{Cacheable, InvalidateHook, StructCache, key};
pub use value_cache::ValueCache;

use futures::FutureExt;

use crate::config::CacheConfig;
use crate::data::{Account, Conversation, DomainPermissionKind, InstanceKey, Marker, Status};

impl Cacheable for Account {
    const INDICES: &'static [&'static str] = &["ID", "URI"];

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn index_key(&self, index: &str) -> Option<String> {
        match index {
            "ID" => Some(self.id.clone()),
            "URI" => Some(self.uri.clone()),
            _ => None,
        }
    }
}

impl Cacheable for Status {
    const INDICES: &'static [&'static str] = &["ID", "URI"];

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn index_key(&self, index: &str) -> Option<String> {
        match index {
            "ID" => Some(self.id.clone()),
            "URI" => Some(self.uri.clone()),
            _ => None,
        }
    }
}

impl Cacheable for Conversation {
    const INDICES: &'static [&'static str] = &[
        "ID",
        "ThreadID,AccountID,OtherAccountsKey",
        "AccountID",
        "AccountID,LastStatusID",
    ];

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn index_key(&self, index: &str) -> Option<String> {
        match index {
            "ID" => Some(self.id.clone()),
            "ThreadID,AccountID,OtherAccountsKey" => Some(key(&[
                &self.thread_id,
                &self.account_id,
                &self.other_accounts_key,
            ])),
            "AccountID" => Some(self.account_id.clone()),
            "AccountID,LastStatusID" => self
                .last_status_id
                .as_deref()
                .map(|last_status_id| key(&[&self.account_id, last_status_id])),
            _ => None,
        }
    }
}

impl Cacheable for Marker {
    const INDICES: &'static [&'static str] = &["AccountID,Name", "AccountID"];

    fn primary_key(&self) -> String {
        key(&[&self.account_id, self.name.as_str()])
    }

    fn index_key(&self, index: &str) -> Option<String> {
        match index {
            "AccountID,Name" => Some(self.primary_key()),
            "AccountID" => Some(self.account_id.clone()),
            _ => None,
        }
    }
}

/// Every cache the store uses
#[derive(Clone)]
pub struct Caches {
    pub account: StructCache<Account>,
    pub status: StructCache<Status>,
    pub conversation: StructCache<Conversation>,
    /// Per owner: IDs of last statuses of their conversations, newest first
    pub conversation_last_status_ids: SliceCache,
    pub domain_block: DomainCache,
    pub domain_allow: DomainCache,
    pub marker: StructCache<Marker>,
    pub instance_key: ValueCache<InstanceKey>,
}

impl Caches {
    pub fn new(config: &CacheConfig) -> Self {
        let caches = Self {
            account: StructCache::new("account", config.account_max_items),
            status: StructCache::new("status", config.status_max_items),
            conversation: StructCache::new("conversation", config.conversation_max_items),
            conversation_last_status_ids: SliceCache::new(
                "conversation_last_status_ids",
                config.conversation_ids_max_items,
            ),
            domain_block: DomainCache::new("domain_block"),
            domain_allow: DomainCache::new("domain_allow"),
            marker: StructCache::new("marker", config.marker_max_items),
            instance_key: ValueCache::new("instance_key"),
        };
        caches.register_hooks();

        tracing::debug!("Caches initialized");
        caches
    }

    fn register_hooks(&self) {
        let last_status_ids = self.conversation_last_status_ids.clone();
        self.conversation.set_invalidate_hook(move |conversation| {
            let last_status_ids = last_status_ids.clone();
            async move {
                // The owner's list is ordered by last status.
                last_status_ids.invalidate(&conversation.account_id).await;
            }
            .boxed()
        });
    }

    pub fn domain(&self, kind: DomainPermissionKind) -> &DomainCache {
        match kind {
            DomainPermissionKind::Block => &self.domain_block,
            DomainPermissionKind::Allow => &self.domain_allow,
        }
    }

    /// Drop every cached value
    pub fn clear(&self) {
        self.account.clear();
        self.status.clear();
        self.conversation.clear();
        self.conversation_last_status_ids.clear();
        self.domain_block.clear();
        self.domain_allow.clear();
        self.marker.clear();
        self.instance_key.clear();

        tracing::debug!("Caches cleared");
    }
}
