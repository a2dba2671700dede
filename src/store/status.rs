//! Status storage and relation population

use futures::FutureExt;

use super::conversation::unlink_status;
use super::{Store, drop_unpopulated, select_in};
use crate::context::Ctx;
use crate::data::query;
use crate::data::{Status, StatusColumn};
use crate::error::{AppError, MultiError, Result};

impl Store {
    pub async fn get_status_by_id(&self, ctx: &Ctx, id: &str) -> Result<Status> {
        self.get_status(ctx, "ID", "SELECT * FROM statuses WHERE id = ?", id)
            .await
    }

    pub async fn get_status_by_uri(&self, ctx: &Ctx, uri: &str) -> Result<Status> {
        self.get_status(ctx, "URI", "SELECT * FROM statuses WHERE uri = ?", uri)
            .await
    }

    async fn get_status(&self, ctx: &Ctx, index: &'static str, sql: &'static str, key: &str) -> Result<Status> {
        let db = self.db.clone();
        let load_ctx = ctx.detached();
        let arg = key.to_string();

        let loading = self
            .caches
            .status
            .load_one(index, key.to_string(), move || async move {
                db.query(&load_ctx, "get_status", move |conn| {
                    let arg = arg.clone();
                    async move {
                        let status = sqlx::query_as::<_, Status>(sql)
                            .bind(arg)
                            .fetch_one(conn)
                            .await?;
                        Ok(status)
                    }
                    .boxed()
                })
                .await
            });
        let mut status = ctx.run(loading).await?;

        if ctx.is_barebones() {
            return Ok(status);
        }

        self.populate_status(ctx, &mut status).await?;
        Ok(status)
    }

    /// Statuses for `ids` in the same order
    ///
    /// Unknown IDs are omitted, and so is any status whose relations
    /// fail to populate.
    pub async fn get_statuses_by_ids(&self, ctx: &Ctx, ids: &[String]) -> Result<Vec<Status>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.db.clone();
        let load_ctx = ctx.detached();

        let loading = self
            .caches
            .status
            .load_ids("ID", ids, move |uncached| async move {
                db.query(&load_ctx, "get_statuses_by_ids", move |conn| {
                    let uncached = uncached.clone();
                    async move {
                        let mut qb = select_in("statuses", "id", &uncached);
                        let statuses = qb.build_query_as::<Status>().fetch_all(conn).await?;
                        Ok(statuses)
                    }
                    .boxed()
                })
                .await
            });
        let statuses = ctx.run(loading).await?;

        if ctx.is_barebones() {
            return Ok(statuses);
        }

        let mut populated = Vec::with_capacity(statuses.len());
        for mut status in statuses {
            if let Err(err) = self.populate_status(ctx, &mut status).await {
                drop_unpopulated("status", &status.id, &err);
                continue;
            }
            populated.push(status);
        }
        Ok(populated)
    }

    /// Fill in any missing relations of `status`
    ///
    /// Relations that are already set are left alone. Each relation is
    /// fetched barebones; every failure is reported, and whatever did
    /// resolve stays on the status.
    pub async fn populate_status(&self, ctx: &Ctx, status: &mut Status) -> Result<()> {
        let bare = ctx.barebones();
        let mut errs = MultiError::new();

        if status.account.is_none() {
            match self.get_account_by_id(&bare, &status.account_id).await {
                Ok(account) => status.account = Some(account),
                Err(err) => errs.push("status author", err),
            }
        }

        if status.in_reply_to.is_none() {
            if let Some(in_reply_to_id) = status.in_reply_to_id.as_deref() {
                match Box::pin(self.get_status_by_id(&bare, in_reply_to_id)).await {
                    Ok(parent) => status.in_reply_to = Some(Box::new(parent)),
                    Err(err) => errs.push("status parent", err),
                }
            }
        }

        if status.boost_of.is_none() {
            if let Some(boost_of_id) = status.boost_of_id.as_deref() {
                match Box::pin(self.get_status_by_id(&bare, boost_of_id)).await {
                    Ok(boosted) => status.boost_of = Some(Box::new(boosted)),
                    Err(err) => errs.push("status boost", err),
                }
            }
        }

        errs.combine()
    }

    pub async fn put_status(&self, ctx: &Ctx, status: &mut Status) -> Result<()> {
        let row = status.barebones();
        self.caches
            .status
            .store(
                status.barebones(),
                self.db.query(ctx, "put_status", move |conn| {
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

    /// Write `columns` of `status` (all columns when empty)
    pub async fn update_status(&self, ctx: &Ctx, status: &mut Status, columns: &[StatusColumn]) -> Result<()> {
        query::touch(status);
        let row = status.barebones();
        let columns = columns.to_vec();

        self.caches
            .status
            .store(
                status.barebones(),
                self.db.query(ctx, "update_status", move |conn| {
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

    /// Delete a status everywhere, repairing conversations it was in
    ///
    /// Deleting an unknown status is not an error.
    pub async fn delete_status_by_id(&self, ctx: &Ctx, id: &str) -> Result<()> {
        let status_id = id.to_string();
        let (repaired, deleted) = self
            .db
            .run_in_tx(ctx, "delete_status", move |conn| {
                let status_id = status_id.clone();
                async move {
                    let repaired = unlink_status(&mut *conn, &status_id).await?;
                    let deleted = sqlx::query_as::<_, Status>("DELETE FROM statuses WHERE id = ? RETURNING *")
                        .bind(status_id.as_str())
                        .fetch_optional(&mut *conn)
                        .await?;
                    Ok((repaired, deleted))
                }
                .boxed()
            })
            .await?;

        self.forget_repaired_conversations(id, repaired).await;
        self.caches.status.invalidate("ID", id).await;
        if let Some(deleted) = deleted {
            self.caches.status.run_invalidate_hook(deleted).await;
        }
        Ok(())
    }
}
