//! Conversation storage and last-status maintenance
//!
//! A conversation's `last_status_id` is derived data: it must always
//! name the newest status still linked to the conversation. Adding a
//! status moves the pointer forward; deleting the pointed-at status
//! recomputes it from the remaining links, or deletes the conversation
//! when none are left.

use chrono::Utc;
use futures::FutureExt;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::{Store, drop_unpopulated};
use crate::cache::key;
use crate::context::Ctx;
use crate::data::query;
use crate::data::{Conversation, ConversationColumn, EntityId, Status, other_accounts_key};
use crate::error::{AppError, MultiError, Result};
use crate::paging::Page;

const INSERT_LINK: &str = "INSERT INTO conversation_to_statuses (conversation_id, status_id) VALUES (?, ?)";

impl Store {
    pub async fn get_conversation_by_id(&self, ctx: &Ctx, id: &str) -> Result<Conversation> {
        let db = self.db.clone();
        let load_ctx = ctx.detached();
        let conversation_id = id.to_string();

        let loading = self
            .caches
            .conversation
            .load_one("ID", id.to_string(), move || async move {
                db.query(&load_ctx, "get_conversation_by_id", move |conn| {
                    let conversation_id = conversation_id.clone();
                    async move {
                        let conversation =
                            sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
                                .bind(conversation_id)
                                .fetch_one(conn)
                                .await?;
                        Ok(conversation)
                    }
                    .boxed()
                })
                .await
            });
        let conversation = ctx.run(loading).await?;

        self.finish_conversation(ctx, conversation).await
    }

    /// The conversation `account_id` has in `thread_id` with exactly
    /// the accounts in `other_account_ids` (in any order)
    pub async fn get_conversation_by_thread_and_account_ids(
        &self,
        ctx: &Ctx,
        thread_id: &str,
        account_id: &str,
        other_account_ids: &[String],
    ) -> Result<Conversation> {
        let others_key = other_accounts_key(other_account_ids);
        let cache_key = key(&[thread_id, account_id, &others_key]);

        let db = self.db.clone();
        let load_ctx = ctx.detached();
        let thread_id = thread_id.to_string();
        let account_id = account_id.to_string();

        let loading = self
            .caches
            .conversation
            .load_one("ThreadID,AccountID,OtherAccountsKey", cache_key, move || async move {
                db.query(&load_ctx, "get_conversation_by_thread_and_account_ids", move |conn| {
                    let thread_id = thread_id.clone();
                    let account_id = account_id.clone();
                    let others_key = others_key.clone();
                    async move {
                        let conversation = sqlx::query_as::<_, Conversation>(
                            "SELECT * FROM conversations \
                             WHERE thread_id = ? AND account_id = ? AND other_accounts_key = ?",
                        )
                        .bind(thread_id)
                        .bind(account_id)
                        .bind(others_key)
                        .fetch_one(conn)
                        .await?;
                        Ok(conversation)
                    }
                    .boxed()
                })
                .await
            });
        let conversation = ctx.run(loading).await?;

        self.finish_conversation(ctx, conversation).await
    }

    async fn finish_conversation(&self, ctx: &Ctx, mut conversation: Conversation) -> Result<Conversation> {
        if !ctx.is_barebones() {
            self.populate_conversation(ctx, &mut conversation).await?;
        }
        Ok(conversation)
    }

    /// A page of the owner's conversations, most recently active first
    ///
    /// Conversations that fail to populate are left out.
    pub async fn get_conversations_by_owner_account_id(
        &self,
        ctx: &Ctx,
        account_id: &str,
        page: Option<&Page>,
    ) -> Result<Vec<Conversation>> {
        let last_status_ids = self.get_conversation_last_status_ids(ctx, account_id, page).await?;
        if last_status_ids.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.db.clone();
        let load_ctx = ctx.detached();

        let loading = self
            .caches
            .conversation
            .load_ids_2part(
                "AccountID,LastStatusID",
                account_id,
                &last_status_ids,
                move |owner, uncached| async move {
                    db.query(&load_ctx, "get_conversations_by_last_status_ids", move |conn| {
                        let owner = owner.clone();
                        let uncached = uncached.clone();
                        async move {
                            let mut qb = select_by_last_status_ids(&owner, &uncached);
                            let conversations = qb.build_query_as::<Conversation>().fetch_all(conn).await?;
                            Ok(conversations)
                        }
                        .boxed()
                    })
                    .await
                },
            );
        let conversations = ctx.run(loading).await?;

        if ctx.is_barebones() {
            return Ok(conversations);
        }

        let mut populated = Vec::with_capacity(conversations.len());
        for mut conversation in conversations {
            if let Err(err) = self.populate_conversation(ctx, &mut conversation).await {
                drop_unpopulated("conversation", &conversation.id, &err);
                continue;
            }
            populated.push(conversation);
        }
        Ok(populated)
    }

    async fn get_conversation_last_status_ids(
        &self,
        ctx: &Ctx,
        account_id: &str,
        page: Option<&Page>,
    ) -> Result<Vec<String>> {
        let db = self.db.clone();
        let load_ctx = ctx.detached();
        let owner = account_id.to_string();

        let loading = self
            .caches
            .conversation_last_status_ids
            .load(account_id, page, async move {
                db.query(&load_ctx, "get_conversation_last_status_ids", move |conn| {
                    let owner = owner.clone();
                    async move {
                        let ids = sqlx::query_scalar::<_, String>(
                            "SELECT last_status_id FROM conversations \
                             WHERE account_id = ? AND last_status_id IS NOT NULL \
                             ORDER BY last_status_id DESC",
                        )
                        .bind(owner)
                        .fetch_all(conn)
                        .await?;
                        Ok(ids)
                    }
                    .boxed()
                })
                .await
            });
        ctx.run(loading).await
    }

    /// Fill in the owner, the other participants and the last status
    pub async fn populate_conversation(&self, ctx: &Ctx, conversation: &mut Conversation) -> Result<()> {
        let bare = ctx.barebones();
        let mut errs = MultiError::new();

        if conversation.account.is_none() {
            match self.get_account_by_id(&bare, &conversation.account_id).await {
                Ok(account) => conversation.account = Some(account),
                Err(err) => errs.push("conversation owner", err),
            }
        }

        if conversation.other_accounts.is_none() && !conversation.other_account_ids.is_empty() {
            match self.get_accounts_by_ids(&bare, &conversation.other_account_ids).await {
                Ok(accounts) => conversation.other_accounts = Some(accounts),
                Err(err) => errs.push("conversation other accounts", err),
            }
        }

        if conversation.last_status.is_none() {
            if let Some(last_status_id) = conversation.last_status_id.as_deref() {
                match self.get_status_by_id(&bare, last_status_id).await {
                    Ok(status) => conversation.last_status = Some(Box::new(status)),
                    Err(err) => errs.push("conversation last status", err),
                }
            }
        }

        errs.combine()
    }

    /// Insert `conversation`, or write `columns` of it over the existing row
    pub async fn upsert_conversation(
        &self,
        ctx: &Ctx,
        conversation: &mut Conversation,
        columns: &[ConversationColumn],
    ) -> Result<()> {
        query::touch(conversation);
        let row = conversation.barebones();
        let columns = columns.to_vec();

        self.caches
            .conversation
            .store(
                conversation.barebones(),
                self.db.query(ctx, "upsert_conversation", move |conn| {
                    let row = row.clone();
                    let columns = columns.clone();
                    async move {
                        query::upsert(&row, &columns).build().execute(conn).await?;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .await
    }

    pub async fn link_conversation_to_status(&self, ctx: &Ctx, conversation_id: &str, status_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        let status_id = status_id.to_string();

        self.db
            .query(ctx, "link_conversation_to_status", move |conn| {
                let conversation_id = conversation_id.clone();
                let status_id = status_id.clone();
                async move {
                    sqlx::query(INSERT_LINK)
                        .bind(conversation_id)
                        .bind(status_id)
                        .execute(conn)
                        .await?;
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    /// Record that `status` belongs to `conversation`
    ///
    /// Moves the last status pointer if `status` is newer than the
    /// current one and marks the conversation unread when someone other
    /// than the owner wrote it. The conversation row and the link are
    /// written in one transaction.
    pub async fn add_status_to_conversation(
        &self,
        ctx: &Ctx,
        conversation: &mut Conversation,
        status: &Status,
    ) -> Result<()> {
        if let Some(last_status_id) = conversation.last_status_id.clone() {
            if conversation.last_status.is_none() {
                match self.get_status_by_id(&ctx.barebones(), &last_status_id).await {
                    Ok(last) => conversation.last_status = Some(Box::new(last)),
                    // Dangling pointer: any status replaces it.
                    Err(AppError::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        let newer = match conversation.last_status.as_deref() {
            Some(last) => (status.created_at, status.id.as_str()) > (last.created_at, last.id.as_str()),
            None => true,
        };
        if newer {
            conversation.last_status_id = Some(status.id.clone());
            conversation.last_status = Some(Box::new(status.barebones()));
        }

        if status.account_id != conversation.account_id {
            conversation.read = false;
        }

        query::touch(conversation);
        let row = conversation.barebones();
        let status_id = status.id.clone();

        self.caches
            .conversation
            .store(
                conversation.barebones(),
                self.db.run_in_tx(ctx, "add_status_to_conversation", move |conn| {
                    let row = row.clone();
                    let status_id = status_id.clone();
                    async move {
                        query::upsert(&row, &[ConversationColumn::LastStatusId, ConversationColumn::Read])
                            .build()
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query(&format!("{INSERT_LINK} ON CONFLICT DO NOTHING"))
                            .bind(row.id.as_str())
                            .bind(status_id)
                            .execute(&mut *conn)
                            .await?;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .await?;

        tracing::debug!(
            conversation_id = %conversation.id,
            status_id = %status.id,
            moved_last_status = newer,
            "Added status to conversation"
        );
        Ok(())
    }

    /// Unlink a status from every conversation, repairing last statuses
    ///
    /// Each conversation whose last status was `status_id` is pointed
    /// at its newest remaining status (ties go to the greater ID), or
    /// deleted if it has none left.
    pub async fn delete_status_from_conversations(&self, ctx: &Ctx, status_id: &str) -> Result<()> {
        let deleted_status_id = status_id.to_string();

        let repaired = self
            .db
            .run_in_tx(ctx, "delete_status_from_conversations", move |conn| {
                let status_id = deleted_status_id.clone();
                async move { unlink_status(conn, &status_id).await }.boxed()
            })
            .await?;

        self.forget_repaired_conversations(status_id, repaired).await;
        Ok(())
    }

    /// Invalidate conversations changed by [`unlink_status`] once its
    /// transaction has committed
    pub(crate) async fn forget_repaired_conversations(&self, status_id: &str, repaired: Repaired) {
        let Repaired { updated, deleted } = repaired;
        if updated.is_empty() && deleted.is_empty() {
            return;
        }

        let touched: Vec<String> = updated
            .iter()
            .chain(deleted.iter())
            .map(|conversation| conversation.id.clone())
            .collect();
        self.caches.conversation.invalidate_ids("ID", &touched).await;
        for conversation in updated.iter().chain(deleted.iter()) {
            self.caches
                .conversation
                .run_invalidate_hook(conversation.clone())
                .await;
        }

        tracing::debug!(
            status_id,
            updated = updated.len(),
            deleted = deleted.len(),
            "Repaired conversations after status removal"
        );
    }

    /// Delete one conversation and its links
    pub async fn delete_conversation_by_id(&self, ctx: &Ctx, id: &str) -> Result<()> {
        let conversation_id = id.to_string();

        let deleted: Option<Conversation> = self
            .db
            .run_in_tx(ctx, "delete_conversation_by_id", move |conn| {
                let conversation_id = conversation_id.clone();
                async move {
                    sqlx::query("DELETE FROM conversation_to_statuses WHERE conversation_id = ?")
                        .bind(conversation_id.as_str())
                        .execute(&mut *conn)
                        .await?;
                    let deleted =
                        sqlx::query_as::<_, Conversation>("DELETE FROM conversations WHERE id = ? RETURNING *")
                            .bind(conversation_id.as_str())
                            .fetch_optional(&mut *conn)
                            .await?;
                    Ok(deleted)
                }
                .boxed()
            })
            .await?;

        self.caches.conversation.invalidate("ID", id).await;
        if let Some(deleted) = deleted {
            self.caches.conversation.run_invalidate_hook(deleted).await;
        }
        Ok(())
    }

    /// Delete every conversation owned by `account_id`, with their links
    pub async fn delete_conversations_by_owner_account_id(&self, ctx: &Ctx, account_id: &str) -> Result<()> {
        let owner = account_id.to_string();

        let deleted_ids: Vec<String> = self
            .db
            .run_in_tx(ctx, "delete_conversations_by_owner_account_id", move |conn| {
                let owner = owner.clone();
                async move {
                    let ids = sqlx::query_scalar::<_, String>(
                        "DELETE FROM conversations WHERE account_id = ? RETURNING id",
                    )
                    .bind(owner)
                    .fetch_all(&mut *conn)
                    .await?;

                    if !ids.is_empty() {
                        let mut qb: QueryBuilder<Sqlite> =
                            QueryBuilder::new("DELETE FROM conversation_to_statuses WHERE conversation_id IN (");
                        let mut separated = qb.separated(", ");
                        for id in &ids {
                            separated.push_bind(id.as_str());
                        }
                        separated.push_unseparated(")");
                        qb.build().execute(&mut *conn).await?;
                    }
                    Ok(ids)
                }
                .boxed()
            })
            .await?;

        self.caches.conversation.invalidate("AccountID", account_id).await;
        self.caches
            .conversation_last_status_ids
            .invalidate(account_id)
            .await;

        tracing::debug!(account_id, count = deleted_ids.len(), "Deleted owned conversations");
        Ok(())
    }
}

/// Conversations of `owner` whose last status is one of `last_status_ids`
/// Conversations touched by [`unlink_status`]
pub(crate) struct Repaired {
    updated: Vec<Conversation>,
    deleted: Vec<Conversation>,
}

/// Drop every link to `status_id` and repair the conversations that
/// pointed at it, on a connection already inside a transaction
pub(crate) async fn unlink_status(conn: &mut SqliteConnection, status_id: &str) -> Result<Repaired> {
    let suffix = EntityId::new().0.to_lowercase();
    let candidates = format!("conversation_candidates_{suffix}");
    let latest = format!("conversation_latest_{suffix}");

    sqlx::query("DELETE FROM conversation_to_statuses WHERE status_id = ?")
        .bind(status_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(&format!(
        "CREATE TEMP TABLE {candidates} (conversation_id TEXT NOT NULL, status_id TEXT, created_at TEXT)"
    ))
    .execute(&mut *conn)
    .await?;

    // Every conversation pointing at the status, joined to
    // what it still links to; a NULL status means nothing.
    sqlx::query(&format!(
        "INSERT INTO {candidates} (conversation_id, status_id, created_at) \
         SELECT c.id, cand.status_id, cand.created_at \
         FROM conversations c \
         LEFT JOIN ( \
             SELECT cts.conversation_id, s.id AS status_id, s.created_at \
             FROM conversation_to_statuses cts \
             JOIN statuses s ON s.id = cts.status_id \
         ) cand ON cand.conversation_id = c.id \
         WHERE c.last_status_id = ?"
    ))
    .bind(status_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "CREATE TEMP TABLE {latest} (conversation_id TEXT NOT NULL, status_id TEXT)"
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "INSERT INTO {latest} (conversation_id, status_id) \
         SELECT cand.conversation_id, cand.status_id \
         FROM {candidates} cand \
         LEFT JOIN {candidates} later \
             ON later.conversation_id = cand.conversation_id \
             AND (later.created_at > cand.created_at \
                  OR (later.created_at = cand.created_at AND later.status_id > cand.status_id)) \
         WHERE later.conversation_id IS NULL"
    ))
    .execute(&mut *conn)
    .await?;

    let updated = sqlx::query_as::<_, Conversation>(&format!(
        "UPDATE conversations \
         SET last_status_id = ( \
                 SELECT latest.status_id FROM {latest} latest \
                 WHERE latest.conversation_id = conversations.id \
             ), \
             updated_at = ? \
         WHERE id IN (SELECT conversation_id FROM {latest} WHERE status_id IS NOT NULL) \
         RETURNING *"
    ))
    .bind(Utc::now())
    .fetch_all(&mut *conn)
    .await?;

    let deleted = sqlx::query_as::<_, Conversation>(&format!(
        "DELETE FROM conversations \
         WHERE id IN (SELECT conversation_id FROM {latest} WHERE status_id IS NULL) \
         RETURNING *"
    ))
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query(&format!("DROP TABLE {candidates}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!("DROP TABLE {latest}"))
        .execute(&mut *conn)
        .await?;

    Ok(Repaired { updated, deleted })
}

fn select_by_last_status_ids<'a>(owner: &'a str, last_status_ids: &'a [String]) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new("SELECT * FROM conversations WHERE account_id = ");
    qb.push_bind(owner);
    qb.push(" AND last_status_id IN (");
    let mut separated = qb.separated(", ");
    for id in last_status_ids {
        separated.push_bind(id.as_str());
    }
    separated.push_unseparated(")");
    qb
}

#[cfg(test)]
mod tests {
    use crate::context::Ctx;
    use crate::data::{Account, Conversation, EntityId, Status};
    use crate::error::AppError;
    use crate::paging::Page;
    use crate::store::Store;
    use crate::store::test_support::*;

    async fn conversation_for(store: &Store, owner: &Account, other: &Account) -> Conversation {
        let mut conversation = Conversation::new(owner.id.clone(), "thread", vec![other.id.clone()]);
        store
            .upsert_conversation(&Ctx::new(), &mut conversation, &[])
            .await
            .unwrap();
        conversation
    }

    async fn add(store: &Store, conversation: &mut Conversation, status: &Status) {
        store
            .add_status_to_conversation(&Ctx::new(), conversation, status)
            .await
            .unwrap();
    }

    async fn last_status_id(store: &Store, id: &str) -> Option<String> {
        store
            .get_conversation_by_id(&Ctx::new().barebones(), id)
            .await
            .unwrap()
            .last_status_id
    }

    #[tokio::test]
    async fn newest_status_wins_regardless_of_link_order() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let other = put_account(&store, "other").await;
        let mut conversation = conversation_for(&store, &owner, &other).await;

        let newer = put_status(&store, &other, minutes_ago(1)).await;
        let older = put_status(&store, &other, minutes_ago(5)).await;

        add(&store, &mut conversation, &newer).await;
        add(&store, &mut conversation, &older).await;

        assert_eq!(conversation.last_status_id.as_deref(), Some(newer.id.as_str()));
        store.caches().clear();
        assert_eq!(last_status_id(&store, &conversation.id).await, Some(newer.id));
    }

    #[tokio::test]
    async fn foreign_status_marks_unread_but_own_status_does_not_mark_read() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let other = put_account(&store, "other").await;
        let mut conversation = conversation_for(&store, &owner, &other).await;

        conversation.read = true;
        let own = put_status(&store, &owner, minutes_ago(3)).await;
        add(&store, &mut conversation, &own).await;
        assert!(conversation.read);

        let foreign = put_status(&store, &other, minutes_ago(2)).await;
        add(&store, &mut conversation, &foreign).await;
        assert!(!conversation.read);

        let own_again = put_status(&store, &owner, minutes_ago(1)).await;
        add(&store, &mut conversation, &own_again).await;
        assert!(!conversation.read);
    }

    #[tokio::test]
    async fn adding_the_same_status_twice_is_harmless() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let other = put_account(&store, "other").await;
        let mut conversation = conversation_for(&store, &owner, &other).await;
        let status = put_status(&store, &other, minutes_ago(1)).await;

        add(&store, &mut conversation, &status).await;
        add(&store, &mut conversation, &status).await;

        let result = store
            .link_conversation_to_status(&Ctx::new(), &conversation.id, &status.id)
            .await;
        assert!(matches!(result, Err(AppError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn deleting_last_status_falls_back_then_deletes_conversation() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let other = put_account(&store, "other").await;
        let mut conversation = conversation_for(&store, &owner, &other).await;

        let s1 = put_status(&store, &other, minutes_ago(2)).await;
        let mut s2 = status_at(&other, minutes_ago(1));
        s2.in_reply_to_id = Some(s1.id.clone());
        store.put_status(&Ctx::new(), &mut s2).await.unwrap();

        add(&store, &mut conversation, &s1).await;
        add(&store, &mut conversation, &s2).await;
        assert_eq!(last_status_id(&store, &conversation.id).await, Some(s2.id.clone()));

        store.delete_status_by_id(&Ctx::new(), &s2.id).await.unwrap();
        assert_eq!(last_status_id(&store, &conversation.id).await, Some(s1.id.clone()));

        store.delete_status_by_id(&Ctx::new(), &s1.id).await.unwrap();
        let result = store.get_conversation_by_id(&Ctx::new(), &conversation.id).await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_greatest_id() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let other = put_account(&store, "other").await;
        let mut conversation = conversation_for(&store, &owner, &other).await;

        let at = minutes_ago(2);
        let base = EntityId::at(at).0;
        let mut low = status_at(&other, at);
        low.id = format!("{}0", &base[..25]);
        low.uri = format!("https://remote.example/statuses/{}", low.id);
        let mut high = status_at(&other, at);
        high.id = format!("{}Z", &base[..25]);
        high.uri = format!("https://remote.example/statuses/{}", high.id);
        for status in [&mut low, &mut high] {
            store.put_status(&Ctx::new(), status).await.unwrap();
        }
        let newest = put_status(&store, &other, minutes_ago(1)).await;

        for status in [&high, &low, &newest] {
            add(&store, &mut conversation, status).await;
        }

        store.delete_status_by_id(&Ctx::new(), &newest.id).await.unwrap();
        assert_eq!(last_status_id(&store, &conversation.id).await, Some(high.id));
    }

    #[tokio::test]
    async fn deleting_an_older_status_leaves_pointer_alone() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let other = put_account(&store, "other").await;
        let mut conversation = conversation_for(&store, &owner, &other).await;

        let older = put_status(&store, &other, minutes_ago(2)).await;
        let newer = put_status(&store, &other, minutes_ago(1)).await;
        add(&store, &mut conversation, &older).await;
        add(&store, &mut conversation, &newer).await;
        let before = store
            .get_conversation_by_id(&Ctx::new().barebones(), &conversation.id)
            .await
            .unwrap();

        store.delete_status_by_id(&Ctx::new(), &older.id).await.unwrap();
        let after = store
            .get_conversation_by_id(&Ctx::new().barebones(), &conversation.id)
            .await
            .unwrap();
        assert_eq!(after.last_status_id, Some(newer.id));
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn owner_listing_is_paged_by_last_status() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let other = put_account(&store, "other").await;

        let mut conversations = Vec::new();
        for i in 0..3 {
            let mut conversation =
                Conversation::new(owner.id.clone(), format!("thread-{i}"), vec![other.id.clone()]);
            let status = put_status(&store, &other, minutes_ago(10 - i)).await;
            add(&store, &mut conversation, &status).await;
            conversations.push(conversation);
        }

        let page = store
            .get_conversations_by_owner_account_id(&Ctx::new(), &owner.id, Some(&Page::newest(2)))
            .await
            .unwrap();
        let got: Vec<_> = page.iter().map(|c| c.id.clone()).collect();
        assert_eq!(got, vec![conversations[2].id.clone(), conversations[1].id.clone()]);
        assert!(page[0].last_status.is_some());
        assert_eq!(page[0].other_accounts.as_ref().map(Vec::len), Some(1));

        // Fresh activity in the oldest conversation moves it to the top.
        let fresh = put_status(&store, &other, minutes_ago(0)).await;
        add(&store, &mut conversations[0], &fresh).await;
        let page = store
            .get_conversations_by_owner_account_id(&Ctx::new(), &owner.id, Some(&Page::newest(1)))
            .await
            .unwrap();
        assert_eq!(page[0].id, conversations[0].id);
    }

    #[tokio::test]
    async fn lookup_by_thread_ignores_participant_order() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let a = put_account(&store, "a").await;
        let b = put_account(&store, "b").await;

        let mut conversation =
            Conversation::new(owner.id.clone(), "thread", vec![a.id.clone(), b.id.clone()]);
        store
            .upsert_conversation(&Ctx::new(), &mut conversation, &[])
            .await
            .unwrap();
        store.caches().clear();

        let found = store
            .get_conversation_by_thread_and_account_ids(
                &Ctx::new(),
                "thread",
                &owner.id,
                &[b.id.clone(), a.id.clone()],
            )
            .await
            .unwrap();
        assert_eq!(found.id, conversation.id);
        assert_eq!(found.account.map(|account| account.id), Some(owner.id));
    }

    #[tokio::test]
    async fn deleting_by_owner_removes_conversations_and_list() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let other = put_account(&store, "other").await;
        let mut conversation = conversation_for(&store, &owner, &other).await;
        let status = put_status(&store, &other, minutes_ago(1)).await;
        add(&store, &mut conversation, &status).await;

        let listed = store
            .get_conversations_by_owner_account_id(&Ctx::new(), &owner.id, None)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        store
            .delete_conversations_by_owner_account_id(&Ctx::new(), &owner.id)
            .await
            .unwrap();

        let listed = store
            .get_conversations_by_owner_account_id(&Ctx::new(), &owner.id, None)
            .await
            .unwrap();
        assert!(listed.is_empty());
        let result = store.get_conversation_by_id(&Ctx::new(), &conversation.id).await;
        assert!(matches!(result, Err(AppError::NotFound)));

        // Links went with it.
        store
            .link_conversation_to_status(&Ctx::new(), &conversation.id, &status.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deleting_uncached_conversation_refreshes_owner_list() {
        let (store, _temp_dir) = create_test_store().await;
        let owner = put_account(&store, "owner").await;
        let other = put_account(&store, "other").await;
        let mut conversation = conversation_for(&store, &owner, &other).await;
        let status = put_status(&store, &other, minutes_ago(1)).await;
        add(&store, &mut conversation, &status).await;

        store
            .get_conversations_by_owner_account_id(&Ctx::new(), &owner.id, None)
            .await
            .unwrap();
        store.caches().conversation.clear();

        store
            .delete_conversation_by_id(&Ctx::new(), &conversation.id)
            .await
            .unwrap();
        let ids = store
            .caches()
            .conversation_last_status_ids
            .load(&owner.id, None, async { Ok(vec!["reloaded".to_string()]) })
            .await
            .unwrap();
        assert_eq!(ids, vec!["reloaded".to_string()]);
    }
}
