//! The instance's own signing key pair

use futures::FutureExt;

use super::Store;
use crate::context::Ctx;
use crate::data::InstanceKey;
use crate::error::Result;

impl Store {
    pub async fn get_instance_key(&self, ctx: &Ctx) -> Result<InstanceKey> {
        let db = self.db.clone();
        let load_ctx = ctx.detached();

        let loading = self
            .caches
            .instance_key
            .get_or_load(async move {
                db.query(&load_ctx, "get_instance_key", |conn| {
                    async move {
                        let key = sqlx::query_as::<_, InstanceKey>(
                            "SELECT public_key_pem, private_key_pem, created_at FROM instance_keys WHERE id = 1",
                        )
                        .fetch_one(conn)
                        .await?;
                        Ok(key)
                    }
                    .boxed()
                })
                .await
            });
        ctx.run(loading).await
    }

    /// Store the key pair, replacing any existing one
    pub async fn put_instance_key(&self, ctx: &Ctx, key: &InstanceKey) -> Result<()> {
        let row = key.clone();
        self.db
            .query(ctx, "put_instance_key", move |conn| {
                let row = row.clone();
                async move {
                    sqlx::query(
                        "INSERT INTO instance_keys (id, public_key_pem, private_key_pem, created_at) \
                         VALUES (1, ?, ?, ?) \
                         ON CONFLICT (id) DO UPDATE SET \
                             public_key_pem = excluded.public_key_pem, \
                             private_key_pem = excluded.private_key_pem, \
                             created_at = excluded.created_at",
                    )
                    .bind(row.public_key_pem)
                    .bind(row.private_key_pem)
                    .bind(row.created_at)
                    .execute(conn)
                    .await?;
                    Ok(())
                }
                .boxed()
            })
            .await?;

        self.caches.instance_key.set(key.clone()).await;
        tracing::info!("Stored instance key");
        Ok(())
    }
}
