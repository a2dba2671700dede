//! Domain blocks, domain allows and federation decisions
//!
//! Whether a domain is blocked depends on both lists and on the
//! instance's federation mode:
//!
//! | mode      | allowed                     | blocked                   |
//! |-----------|-----------------------------|---------------------------|
//! | blocklist | allow match, or no block    | block match without allow |
//! | allowlist | allow match without block   | block match, or no allow  |
//!
//! Every rule also covers all subdomains of its domain.

use futures::FutureExt;
use url::{Host, Url};

use super::Store;
use crate::config::FederationMode;
use crate::context::Ctx;
use crate::data::query;
use crate::data::{Allow, Block, DomainAllow, DomainBlock, DomainPermission, PermissionKind};
use crate::error::{AppError, Result};

/// Lowercase punycode form of `domain`, without a trailing dot
pub fn normalize_domain(domain: &str) -> Result<String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput(format!("empty domain: {domain:?}")));
    }

    match Host::parse(trimmed) {
        Ok(host) => Ok(host.to_string()),
        Err(err) => Err(AppError::InvalidInput(format!("invalid domain {domain:?}: {err}"))),
    }
}

/// Combine the two explicit matches under `mode`
pub fn resolve_blocked(mode: FederationMode, explicit_allow: bool, explicit_block: bool) -> bool {
    match mode {
        FederationMode::Blocklist => explicit_block && !explicit_allow,
        FederationMode::Allowlist => explicit_block || !explicit_allow,
    }
}

impl Store {
    pub async fn put_domain_block(&self, ctx: &Ctx, block: &mut DomainBlock) -> Result<()> {
        self.put_domain_permission(ctx, block).await
    }

    pub async fn get_domain_block(&self, ctx: &Ctx, domain: &str) -> Result<DomainBlock> {
        self.get_domain_permission(ctx, domain).await
    }

    pub async fn get_domain_blocks(&self, ctx: &Ctx) -> Result<Vec<DomainBlock>> {
        self.get_domain_permissions(ctx).await
    }

    pub async fn delete_domain_block(&self, ctx: &Ctx, domain: &str) -> Result<()> {
        self.delete_domain_permission::<Block>(ctx, domain).await
    }

    pub async fn put_domain_allow(&self, ctx: &Ctx, allow: &mut DomainAllow) -> Result<()> {
        self.put_domain_permission(ctx, allow).await
    }

    pub async fn get_domain_allow(&self, ctx: &Ctx, domain: &str) -> Result<DomainAllow> {
        self.get_domain_permission(ctx, domain).await
    }

    pub async fn get_domain_allows(&self, ctx: &Ctx) -> Result<Vec<DomainAllow>> {
        self.get_domain_permissions(ctx).await
    }

    pub async fn delete_domain_allow(&self, ctx: &Ctx, domain: &str) -> Result<()> {
        self.delete_domain_permission::<Allow>(ctx, domain).await
    }

    async fn put_domain_permission<K: PermissionKind>(
        &self,
        ctx: &Ctx,
        permission: &mut DomainPermission<K>,
    ) -> Result<()> {
        permission.domain = normalize_domain(&permission.domain)?;
        let row = permission.clone();

        self.db
            .query(ctx, "put_domain_permission", move |conn| {
                let row = row.clone();
                async move {
                    query::insert(&row).build().execute(conn).await?;
                    Ok(())
                }
                .boxed()
            })
            .await?;

        self.caches.domain(K::KIND).clear();
        tracing::info!(kind = K::KIND.as_str(), domain = %permission.domain, "Added domain permission");
        Ok(())
    }

    async fn get_domain_permission<K: PermissionKind>(&self, ctx: &Ctx, domain: &str) -> Result<DomainPermission<K>> {
        let domain = normalize_domain(domain)?;
        let sql = format!("SELECT * FROM {} WHERE domain = ?", K::KIND.table());

        self.db
            .query(ctx, "get_domain_permission", move |conn| {
                let domain = domain.clone();
                let sql = sql.clone();
                async move {
                    let permission = sqlx::query_as::<_, DomainPermission<K>>(&sql)
                        .bind(domain)
                        .fetch_one(conn)
                        .await?;
                    Ok(permission)
                }
                .boxed()
            })
            .await
    }

    async fn get_domain_permissions<K: PermissionKind>(&self, ctx: &Ctx) -> Result<Vec<DomainPermission<K>>> {
        let sql = format!("SELECT * FROM {} ORDER BY domain", K::KIND.table());

        self.db
            .query(ctx, "get_domain_permissions", move |conn| {
                let sql = sql.clone();
                async move {
                    let permissions = sqlx::query_as::<_, DomainPermission<K>>(&sql)
                        .fetch_all(conn)
                        .await?;
                    Ok(permissions)
                }
                .boxed()
            })
            .await
    }

    /// Remove the rule for exactly `domain`; rules for parent domains stay
    async fn delete_domain_permission<K: PermissionKind>(&self, ctx: &Ctx, domain: &str) -> Result<()> {
        let domain = normalize_domain(domain)?;
        let sql = format!("DELETE FROM {} WHERE domain = ?", K::KIND.table());
        let target = domain.clone();

        self.db
            .query(ctx, "delete_domain_permission", move |conn| {
                let target = target.clone();
                let sql = sql.clone();
                async move {
                    sqlx::query(&sql).bind(target).execute(conn).await?;
                    Ok(())
                }
                .boxed()
            })
            .await?;

        self.caches.domain(K::KIND).clear();
        tracing::info!(kind = K::KIND.as_str(), domain = %domain, "Removed domain permission");
        Ok(())
    }

    /// Whether a rule of kind `K` covers `domain` (already normalized)
    async fn domain_matches<K: PermissionKind>(&self, ctx: &Ctx, domain: &str) -> Result<bool> {
        let db = self.db.clone();
        let load_ctx = ctx.detached();
        let sql = format!("SELECT domain FROM {}", K::KIND.table());

        let loading = self
            .caches
            .domain(K::KIND)
            .matches(domain, async move {
                db.query(&load_ctx, "load_domain_permissions", move |conn| {
                    let sql = sql.clone();
                    async move {
                        let domains = sqlx::query_scalar::<_, String>(&sql).fetch_all(conn).await?;
                        Ok(domains)
                    }
                    .boxed()
                })
                .await
            });
        ctx.run(loading).await
    }

    fn is_self_domain(&self, domain: &str) -> bool {
        let host = Some(self.instance.host.as_str());
        let account_domain = self.instance.account_domain.as_deref();

        [host, account_domain]
            .into_iter()
            .flatten()
            .filter_map(|own| normalize_domain(own).ok())
            .any(|own| own == domain)
    }

    /// Whether federation with `domain` is blocked
    ///
    /// An empty domain and this instance's own domains are never
    /// blocked.
    ///
    /// # Errors
    /// Returns `AppError::Config` if the federation mode is not
    /// recognized.
    pub async fn is_domain_blocked(&self, ctx: &Ctx, domain: &str) -> Result<bool> {
        if domain.trim().is_empty() {
            return Ok(false);
        }

        let mode = self.instance.federation_mode()?;
        let domain = normalize_domain(domain)?;
        if self.is_self_domain(&domain) {
            return Ok(false);
        }

        let explicit_allow = self.domain_matches::<Allow>(ctx, &domain).await?;
        let explicit_block = self.domain_matches::<Block>(ctx, &domain).await?;
        let blocked = resolve_blocked(mode, explicit_allow, explicit_block);

        tracing::trace!(%domain, explicit_allow, explicit_block, blocked, "Resolved domain permission");
        Ok(blocked)
    }

    /// True as soon as any of `domains` is blocked
    pub async fn are_domains_blocked(&self, ctx: &Ctx, domains: &[String]) -> Result<bool> {
        for domain in domains {
            if self.is_domain_blocked(ctx, domain).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether the host of `uri` is blocked; URIs without a host are not
    pub async fn is_uri_blocked(&self, ctx: &Ctx, uri: &Url) -> Result<bool> {
        match uri.host_str() {
            Some(host) => self.is_domain_blocked(ctx, host).await,
            None => Ok(false),
        }
    }

    pub async fn are_uris_blocked(&self, ctx: &Ctx, uris: &[Url]) -> Result<bool> {
        for uri in uris {
            if self.is_uri_blocked(ctx, uri).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
