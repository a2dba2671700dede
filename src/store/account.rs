//! Account storage

use futures::FutureExt;

use super::{Store, select_in};
use crate::context::Ctx;
use crate::data::query;
use crate::data::{Account, AccountColumn};
use crate::error::{AppError, Result};

impl Store {
    pub async fn get_account_by_id(&self, ctx: &Ctx, id: &str) -> Result<Account> {
        self.get_account(ctx, "ID", "SELECT * FROM accounts WHERE id = ?", id)
            .await
    }

    pub async fn get_account_by_uri(&self, ctx: &Ctx, uri: &str) -> Result<Account> {
        self.get_account(ctx, "URI", "SELECT * FROM accounts WHERE uri = ?", uri)
            .await
    }

    async fn get_account(&self, ctx: &Ctx, index: &'static str, sql: &'static str, key: &str) -> Result<Account> {
        let db = self.db.clone();
        let load_ctx = ctx.detached();
        let arg = key.to_string();

        let loading = self
            .caches
            .account
            .load_one(index, key.to_string(), move || async move {
                db.query(&load_ctx, "get_account", move |conn| {
                    let arg = arg.clone();
                    async move {
                        let account = sqlx::query_as::<_, Account>(sql)
                            .bind(arg)
                            .fetch_one(conn)
                            .await?;
                        Ok(account)
                    }
                    .boxed()
                })
                .await
            });
        ctx.run(loading).await
    }

    /// Accounts for `ids` in the same order, omitting unknown IDs
    pub async fn get_accounts_by_ids(&self, ctx: &Ctx, ids: &[String]) -> Result<Vec<Account>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.db.clone();
        let load_ctx = ctx.detached();

        let loading = self
            .caches
            .account
            .load_ids("ID", ids, move |uncached| async move {
                db.query(&load_ctx, "get_accounts_by_ids", move |conn| {
                    let uncached = uncached.clone();
                    async move {
                        let mut qb = select_in("accounts", "id", &uncached);
                        let accounts = qb.build_query_as::<Account>().fetch_all(conn).await?;
                        Ok(accounts)
                    }
                    .boxed()
                })
                .await
            });
        ctx.run(loading).await
    }

    pub async fn put_account(&self, ctx: &Ctx, account: &mut Account) -> Result<()> {
        let row = account.clone();
        self.caches
            .account
            .store(
                account.clone(),
                self.db.query(ctx, "put_account", move |conn| {
                    let row = row.clone();
                    async move {
                        query::insert(&row).build().execute(conn).await?;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .await
    }

    /// Write `columns` of `account` (all columns when empty)
    pub async fn update_account(&self, ctx: &Ctx, account: &mut Account, columns: &[AccountColumn]) -> Result<()> {
        query::touch(account);
        let row = account.clone();
        let columns = columns.to_vec();

        self.caches
            .account
            .store(
                account.clone(),
                self.db.query(ctx, "update_account", move |conn| {
                    let row = row.clone();
                    let columns = columns.clone();
                    async move {
                        let result = query::update(&row, &columns).build().execute(conn).await?;
                        if result.rows_affected() == 0 {
                            return Err(AppError::NotFound);
                        }
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .await
    }

    /// Delete an account and everything it owns
    ///
    /// Its statuses go first so that conversations they were part of
    /// are repaired, then its own conversations and markers.
    pub async fn delete_account(&self, ctx: &Ctx, id: &str) -> Result<()> {
        let owner = id.to_string();
        let status_ids: Vec<String> = self
            .db
            .query(ctx, "select_account_status_ids", move |conn| {
                let owner = owner.clone();
                async move {
                    let ids = sqlx::query_scalar::<_, String>("SELECT id FROM statuses WHERE account_id = ?")
                        .bind(owner)
                        .fetch_all(conn)
                        .await?;
                    Ok(ids)
                }
                .boxed()
            })
            .await?;

        for status_id in &status_ids {
            self.delete_status_by_id(ctx, status_id).await?;
        }

        self.delete_conversations_by_owner_account_id(ctx, id).await?;
        self.delete_markers_by_account_id(ctx, id).await?;

        let account_id = id.to_string();
        let deleted: Option<Account> = self
            .db
            .query(ctx, "delete_account", move |conn| {
                let account_id = account_id.clone();
                async move {
                    let deleted = sqlx::query_as::<_, Account>("DELETE FROM accounts WHERE id = ? RETURNING *")
                        .bind(account_id)
                        .fetch_optional(conn)
                        .await?;
                    Ok(deleted)
                }
                .boxed()
            })
            .await?;

        self.caches.account.invalidate("ID", id).await;
        if let Some(deleted) = deleted {
            self.caches.account.run_invalidate_hook(deleted).await;
        }

        tracing::info!(account_id = id, statuses = status_ids.len(), "Deleted account");
        Ok(())
    }
}
