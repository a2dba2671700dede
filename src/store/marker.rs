//! Timeline markers with optimistic concurrency

use chrono::Utc;
use futures::FutureExt;

use super::Store;
use crate::cache::key;
use crate::context::Ctx;
use crate::data::query;
use crate::data::{Marker, MarkerName};
use crate::error::{AppError, Result};
use crate::metrics::MARKER_CONFLICTS_TOTAL;

impl Store {
    pub async fn get_marker(&self, ctx: &Ctx, account_id: &str, name: MarkerName) -> Result<Marker> {
        let db = self.db.clone();
        let load_ctx = ctx.detached();
        let owner = account_id.to_string();

        let loading = self
            .caches
            .marker
            .load_one("AccountID,Name", key(&[account_id, name.as_str()]), move || async move {
                db.query(&load_ctx, "get_marker", move |conn| {
                    let owner = owner.clone();
                    async move {
                        let marker =
                            sqlx::query_as::<_, Marker>("SELECT * FROM markers WHERE account_id = ? AND name = ?")
                                .bind(owner)
                                .bind(name)
                                .fetch_one(conn)
                                .await?;
                        Ok(marker)
                    }
                    .boxed()
                })
                .await
            });
        ctx.run(loading).await
    }

    /// Markers of `account_id` for each of `names` that has one
    pub async fn get_markers(&self, ctx: &Ctx, account_id: &str, names: &[MarkerName]) -> Result<Vec<Marker>> {
        let mut markers = Vec::with_capacity(names.len());
        for name in names {
            match self.get_marker(ctx, account_id, *name).await {
                Ok(marker) => markers.push(marker),
                Err(AppError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(markers)
    }

    /// Move a marker, refusing to overwrite a concurrent update
    ///
    /// The first write for a key inserts it at version 0. Later writes
    /// only apply if the stored version is still the one this process
    /// last saw; otherwise [`AppError::Conflict`] is returned and the
    /// caller should re-read and retry. On success `marker` carries the
    /// new version and timestamp.
    pub async fn update_marker(&self, ctx: &Ctx, marker: &mut Marker) -> Result<()> {
        let previous = match self.get_marker(ctx, &marker.account_id, marker.name).await {
            Ok(previous) => Some(previous),
            Err(AppError::NotFound) => None,
            Err(err) => return Err(err),
        };

        match previous {
            Some(previous) => self.swap_marker(ctx, marker, previous.version).await,
            None => self.insert_marker(ctx, marker).await,
        }
    }

    async fn insert_marker(&self, ctx: &Ctx, marker: &mut Marker) -> Result<()> {
        marker.version = 0;
        query::touch(marker);
        let row = marker.clone();

        let result = self
            .caches
            .marker
            .store(
                marker.clone(),
                self.db.query(ctx, "insert_marker", move |conn| {
                    let row = row.clone();
                    async move {
                        query::insert(&row).build().execute(conn).await?;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .await;

        match result {
            // Another writer created the key first.
            Err(AppError::AlreadyExists(_)) => Err(marker_conflict(marker)),
            other => other,
        }
    }

    /// Write `marker` as version `previous_version + 1`, provided the
    /// stored row is still at `previous_version`
    pub(crate) async fn swap_marker(&self, ctx: &Ctx, marker: &mut Marker, previous_version: i64) -> Result<()> {
        let next = Marker {
            version: previous_version + 1,
            updated_at: Utc::now(),
            ..marker.clone()
        };
        let row = next.clone();

        let result = self
            .caches
            .marker
            .store(
                next.clone(),
                self.db.run_in_tx(ctx, "update_marker", move |conn| {
                    let row = row.clone();
                    async move {
                        let mut qb = query::update(&row, &[]);
                        qb.push(" AND version = ");
                        qb.push_bind(previous_version);
                        let result = qb.build().execute(conn).await?;

                        match result.rows_affected() {
                            0 => Err(AppError::Conflict("marker version changed".to_string())),
                            1 => Ok(()),
                            n => Err(AppError::Invariant(format!(
                                "marker update affected {n} rows"
                            ))),
                        }
                    }
                    .boxed()
                }),
            )
            .await;

        match result {
            Ok(()) => {
                *marker = next;
                Ok(())
            }
            Err(AppError::Conflict(_)) => Err(marker_conflict(marker)),
            Err(err) => Err(err),
        }
    }

    /// Delete every marker of `account_id`
    pub async fn delete_markers_by_account_id(&self, ctx: &Ctx, account_id: &str) -> Result<()> {
        let owner = account_id.to_string();
        self.db
            .query(ctx, "delete_markers_by_account_id", move |conn| {
                let owner = owner.clone();
                async move {
                    sqlx::query("DELETE FROM markers WHERE account_id = ?")
                        .bind(owner)
                        .execute(conn)
                        .await?;
                    Ok(())
                }
                .boxed()
            })
            .await?;

        self.caches.marker.invalidate("AccountID", account_id).await;
        Ok(())
    }
}

fn marker_conflict(marker: &Marker) -> AppError {
    MARKER_CONFLICTS_TOTAL.inc();
    tracing::debug!(
        account_id = %marker.account_id,
        name = %marker.name,
        "Marker update lost a version race"
    );
    AppError::Conflict(format!("marker {} of {} was updated concurrently", marker.name, marker.account_id))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::context::Ctx;
    use crate::data::{Marker, MarkerName};
    use crate::error::AppError;
    use crate::store::test_support::*;

    #[tokio::test]
    async fn first_update_inserts_at_version_zero() {
        let (store, _temp_dir) = create_test_store().await;
        let mut marker = Marker::new("alice", MarkerName::Home, "status-1");

        store.update_marker(&Ctx::new(), &mut marker).await.unwrap();
        assert_eq!(marker.version, 0);

        store.caches().clear();
        let stored = store
            .get_marker(&Ctx::new(), "alice", MarkerName::Home)
            .await
            .unwrap();
        assert_eq!(stored.last_read_id, "status-1");
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn each_update_bumps_version_by_one() {
        let (store, _temp_dir) = create_test_store().await;
        let mut marker = Marker::new("alice", MarkerName::Home, "status-1");
        store.update_marker(&Ctx::new(), &mut marker).await.unwrap();

        for (i, last_read) in ["status-2", "status-3"].iter().enumerate() {
            marker.last_read_id = last_read.to_string();
            store.update_marker(&Ctx::new(), &mut marker).await.unwrap();
            assert_eq!(marker.version, i as i64 + 1);
        }

        store.caches().clear();
        let stored = store
            .get_marker(&Ctx::new(), "alice", MarkerName::Home)
            .await
            .unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.last_read_id, "status-3");
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let (store, _temp_dir) = create_test_store().await;
        let mut marker = Marker::new("alice", MarkerName::Notifications, "n-1");
        store.update_marker(&Ctx::new(), &mut marker).await.unwrap();
        marker.last_read_id = "n-2".to_string();
        store.update_marker(&Ctx::new(), &mut marker).await.unwrap();

        let mut stale = marker.clone();
        stale.last_read_id = "n-3".to_string();
        let result = store.swap_marker(&Ctx::new(), &mut stale, 0).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(stale.version, 1);

        let stored = store
            .get_marker(&Ctx::new(), "alice", MarkerName::Notifications)
            .await
            .unwrap();
        assert_eq!(stored.last_read_id, "n-2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_swaps_from_one_version_succeed_once() {
        let (store, _temp_dir) = create_test_store().await;
        let mut marker = Marker::new("alice", MarkerName::Home, "status-1");
        store.update_marker(&Ctx::new(), &mut marker).await.unwrap();

        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let tasks: Vec<_> = ["status-a", "status-b"]
            .into_iter()
            .map(|last_read| {
                let store = store.clone();
                let barrier = barrier.clone();
                let mut mine = marker.clone();
                mine.last_read_id = last_read.to_string();
                tokio::spawn(async move {
                    barrier.wait().await;
                    store.swap_marker(&Ctx::new(), &mut mine, 0).await
                })
            })
            .collect();

        let mut successes = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => successes += 1,
                Err(AppError::Conflict(_)) => conflicts += 1,
                Err(err) => panic!("unexpected error: {err:?}"),
            }
        }
        assert_eq!((successes, conflicts), (1, 1));

        store.caches().clear();
        let stored = store
            .get_marker(&Ctx::new(), "alice", MarkerName::Home)
            .await
            .unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn get_markers_skips_missing_names() {
        let (store, _temp_dir) = create_test_store().await;
        let mut marker = Marker::new("alice", MarkerName::Home, "status-1");
        store.update_marker(&Ctx::new(), &mut marker).await.unwrap();

        let markers = store
            .get_markers(
                &Ctx::new(),
                "alice",
                &[MarkerName::Home, MarkerName::Notifications],
            )
            .await
            .unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].name, MarkerName::Home);
    }

    #[tokio::test]
    async fn delete_by_account_clears_cached_markers() {
        let (store, _temp_dir) = create_test_store().await;
        let mut marker = Marker::new("alice", MarkerName::Home, "status-1");
        store.update_marker(&Ctx::new(), &mut marker).await.unwrap();

        store
            .delete_markers_by_account_id(&Ctx::new(), "alice")
            .await
            .unwrap();
        let result = store.get_marker(&Ctx::new(), "alice", MarkerName::Home).await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }
}
