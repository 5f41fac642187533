//! TagIdfService (spec §4.3): keeps `node_tags` rows in sync with each
//! node's tag set and maintains the `tag_idf` cache used by the Scorer.

use std::collections::BTreeSet;

use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::config::IdfContext;
use crate::error::Result;

pub struct TagIdfService {
    pool: SqlitePool,
}

/// Replace all `(node_id, *)` rows with the given tag set against an
/// already-open transaction, so a caller can fold the tag sync into a
/// larger atomic unit (e.g. node insert + edge writes).
pub async fn sync_node_tags_tx(tx: &mut Transaction<'_, Sqlite>, node_id: Uuid, tags: &BTreeSet<String>) -> Result<()> {
    sqlx::query("DELETE FROM node_tags WHERE node_id = ?")
        .bind(node_id.to_string())
        .execute(&mut **tx)
        .await?;
    for tag in tags {
        sqlx::query("INSERT INTO node_tags (node_id, tag) VALUES (?, ?)")
            .bind(node_id.to_string())
            .bind(tag)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

impl TagIdfService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomically replace all `(node_id, *)` rows with the given tag set.
    pub async fn sync_node_tags(&self, node_id: Uuid, tags: &BTreeSet<String>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sync_node_tags_tx(&mut tx, node_id, tags).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Transactional multi-node version used by migrations and bulk import.
    pub async fn bulk_sync(&self, entries: &[(Uuid, BTreeSet<String>)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (node_id, tags) in entries {
            sqlx::query("DELETE FROM node_tags WHERE node_id = ?")
                .bind(node_id.to_string())
                .execute(&mut *tx)
                .await?;
            for tag in tags {
                sqlx::query("INSERT INTO node_tags (node_id, tag) VALUES (?, ?)")
                    .bind(node_id.to_string())
                    .bind(tag)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Recompute per-tag document frequencies from a full scan and rewrite
    /// `tag_idf`. IDF is plain `ln(N / df)` — the Laplace-smoothed variant
    /// some corpora use is deliberately not applied here (spec keeps IDF
    /// exact rather than smoothed).
    pub async fn rebuild(&self) -> Result<()> {
        let total_nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT tag, COUNT(DISTINCT node_id) FROM node_tags GROUP BY tag")
                .fetch_all(&self.pool)
                .await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tag_idf").execute(&mut *tx).await?;
        for (tag, df) in &rows {
            let idf = if *df > 0 && total_nodes > 0 {
                ((total_nodes as f64) / (*df as f64)).ln()
            } else {
                0.0
            };
            sqlx::query("INSERT INTO tag_idf (tag, doc_freq, idf) VALUES (?, ?, ?)")
                .bind(tag)
                .bind(df)
                .bind(idf)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Single consistent IDF snapshot for one linking pass.
    pub async fn context(&self) -> Result<IdfContext> {
        let total_nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        let rows: Vec<(String, f64)> = sqlx::query_as("SELECT tag, idf FROM tag_idf")
            .fetch_all(&self.pool)
            .await?;

        let max_idf = if total_nodes > 0 { (total_nodes as f64).ln() } else { 0.0 };
        let idf_by_tag = rows.into_iter().collect();

        Ok(IdfContext { total_nodes: total_nodes.max(0) as u64, max_idf, idf_by_tag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn test_service() -> (TagIdfService, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let service = TagIdfService::new(store.pool().clone());
        (service, store)
    }

    #[tokio::test]
    async fn sync_and_rebuild_roundtrip() {
        let (service, store) = test_service().await;
        let a = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO nodes (id, title, body, created_at, updated_at, is_chunk, accepted_degree, approximate_scored) VALUES (?,?,?,datetime('now'),datetime('now'),0,0,0)",
        )
        .bind(a.to_string())
        .bind("A")
        .bind("body a")
        .execute(store.pool())
        .await
        .unwrap();
        service.sync_node_tags(a, &BTreeSet::from(["rust".to_string()])).await.unwrap();
        service.rebuild().await.unwrap();
        let ctx = service.context().await.unwrap();
        assert!(ctx.idf_by_tag.contains_key("rust"));
    }
}
