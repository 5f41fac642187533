//! Store (spec §2, §3, §5): the single durable-state owner. Persists nodes,
//! edges, node_tags, tag_idf, documents, document_chunks, edge_events, and
//! node_history in a single SQLite file via `sqlx`.
//!
//! Concurrency follows the teacher's `Arc<RwLock<ServerState>>` pattern in
//! spirit, generalized to a single-writer discipline: a `tokio::sync::Mutex`
//! serializes writes while reads use their own pooled connections and never
//! block behind it, giving the snapshot-isolation reads spec.md §5 asks for.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ForestError, Result};
use crate::id::IdIndex;
use crate::model::{
    Document, DocumentChunk, DocumentMetadata, Edge, EdgeEvent, EdgeStatus, EdgeType, HistoryOp, Metadata, Node,
    NodeHistory,
};

const SCHEMA: &str = include_str!("schema.sql");

/// Durable-state owner. Cheap to clone (wraps an `Arc` internally via the
/// pool and write mutex).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ForestError::StorageError(e.to_string()))?;
            }
        }
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        Self::open_with(options).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .shared_cache(true);
        Self::open_with(options).await
    }

    async fn open_with(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(options).await?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| ForestError::StorageError(format!("schema init: {e}")))?;
        }
        Ok(Self { pool, write_lock: Arc::new(Mutex::new(())) })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Build the in-memory shortest-unique-prefix index from all node ids
    /// currently on disk. Called once on open; the Linker/refs resolver
    /// maintains it incrementally afterward.
    pub async fn load_id_index(&self) -> Result<IdIndex> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM nodes").fetch_all(&self.pool).await?;
        let ids = rows
            .into_iter()
            .filter_map(|(s,)| Uuid::parse_str(&s).ok());
        Ok(IdIndex::build(ids))
    }

    // -- Node CRUD ----------------------------------------------------

    pub async fn insert_node(&self, node: &Node) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        insert_node_tx(&mut tx, node).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_node(&self, id: Uuid) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_node).transpose()
    }

    pub async fn update_node(&self, node: &Node) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        update_node_tx(&mut tx, node).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Deletes the node, cascading: all incident edges are removed (with
    /// the surviving neighbor's `acceptedDegree` decremented), chunk
    /// mapping and `node_tags` rows are removed.
    pub async fn delete_node(&self, id: Uuid) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let incident: Vec<(String, String, String)> =
            sqlx::query_as("SELECT id, source_id, target_id FROM edges WHERE source_id = ? OR target_id = ?")
                .bind(id.to_string())
                .bind(id.to_string())
                .fetch_all(&mut *tx)
                .await?;

        for (edge_id, source_id, target_id) in incident {
            let other = if source_id == id.to_string() { target_id } else { source_id };
            sqlx::query("DELETE FROM edges WHERE id = ?").bind(&edge_id).execute(&mut *tx).await?;
            sqlx::query("UPDATE nodes SET accepted_degree = accepted_degree - 1 WHERE id = ?")
                .bind(&other)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM document_chunks WHERE node_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM node_tags WHERE node_id = ?").bind(id.to_string()).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM nodes WHERE id = ?").bind(id.to_string()).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn all_node_ids(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM nodes").fetch_all(&self.pool).await?;
        Ok(rows.into_iter().filter_map(|(s,)| Uuid::parse_str(&s).ok()).collect())
    }

    pub async fn all_nodes_except(&self, id: Uuid) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE id != ?")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_node).collect()
    }

    // -- Edge CRUD ------------------------------------------------------

    pub async fn edges_of(&self, node_id: Uuid) -> Result<Vec<Edge>> {
        let rows = sqlx::query("SELECT * FROM edges WHERE source_id = ? OR target_id = ?")
            .bind(node_id.to_string())
            .bind(node_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_edge).collect()
    }

    pub async fn find_edge(&self, a: Uuid, b: Uuid) -> Result<Option<Edge>> {
        let (lo, hi) = Edge::canonical_pair(a, b);
        let row = sqlx::query("SELECT * FROM edges WHERE source_id = ? AND target_id = ?")
            .bind(lo.to_string())
            .bind(hi.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_edge).transpose()
    }

    /// Insert a new accepted edge, incrementing both endpoints'
    /// `acceptedDegree` by one, within the caller's transaction scope.
    pub async fn upsert_edge(&self, edge: &Edge) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        upsert_edge_tx(&mut tx, edge).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_edge(&self, edge: &Edge) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        delete_edge_tx(&mut tx, edge).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Acquire the single-writer lock. The Linker holds this for the
    /// duration of a linking pass (node insert plus every resulting edge
    /// write) so the whole pass commits as one transaction.
    pub async fn lock_writer(&self) -> tokio::sync::OwnedMutexGuard<()> {
        self.write_lock.clone().lock_owned().await
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // -- Document / chunk -------------------------------------------------

    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let metadata_json = doc.metadata.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO documents (id, title, body, metadata, version, root_node_id, created_at, updated_at) VALUES (?,?,?,?,?,?,?,?)",
        )
        .bind(doc.id.to_string())
        .bind(&doc.title)
        .bind(&doc.body)
        .bind(metadata_json)
        .bind(doc.version)
        .bind(doc.root_node_id.map(|id| id.to_string()))
        .bind(doc.created_at.to_rfc3339())
        .bind(doc.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_document).transpose()
    }

    pub async fn insert_chunk(&self, chunk: &DocumentChunk) -> Result<()> {
        sqlx::query(
            "INSERT INTO document_chunks (document_id, segment_id, node_id, offset_bytes, length_bytes, chunk_order, checksum, created_at, updated_at) VALUES (?,?,?,?,?,?,?,?,?)",
        )
        .bind(chunk.document_id.to_string())
        .bind(&chunk.segment_id)
        .bind(chunk.node_id.to_string())
        .bind(chunk.offset)
        .bind(chunk.length)
        .bind(chunk.chunk_order)
        .bind(&chunk.checksum)
        .bind(chunk.created_at.to_rfc3339())
        .bind(chunk.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn chunks_of_document(&self, document_id: Uuid) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query("SELECT * FROM document_chunks WHERE document_id = ? ORDER BY chunk_order ASC")
            .bind(document_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_chunk).collect()
    }

    pub async fn chunk_document_id_for_node(&self, node_id: Uuid) -> Result<Option<Uuid>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT document_id FROM document_chunks WHERE node_id = ?")
            .bind(node_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|(s,)| Uuid::parse_str(&s).ok()))
    }

    /// Deletes a document and cascades to its root node and every chunk
    /// node (whose own edge cascade then fires via [`Store::delete_node`]).
    pub async fn delete_document(&self, id: Uuid) -> Result<()> {
        let chunks = self.chunks_of_document(id).await?;
        for chunk in &chunks {
            self.delete_node(chunk.node_id).await?;
        }
        if let Some(doc) = self.get_document(id).await? {
            if let Some(root) = doc.root_node_id {
                self.delete_node(root).await?;
            }
        }
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM documents WHERE id = ?").bind(id.to_string()).execute(&self.pool).await?;
        Ok(())
    }

    // -- EdgeEvent / NodeHistory ------------------------------------------

    pub async fn record_edge_event(&self, event: &EdgeEventDraft) -> Result<i64> {
        let payload = event.payload.as_ref().map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            "INSERT INTO edge_events (edge_id, source_id, target_id, prev_status, next_status, payload, created_at, undone) VALUES (?,?,?,?,?,?,?,0)",
        )
        .bind(event.edge_id.map(|id| id.to_string()))
        .bind(event.source_id.to_string())
        .bind(event.target_id.to_string())
        .bind(&event.prev_status)
        .bind(&event.next_status)
        .bind(payload)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn last_undoable_event(&self) -> Result<Option<EdgeEvent>> {
        let row = sqlx::query("SELECT * FROM edge_events WHERE undone = 0 ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_edge_event).transpose()
    }

    pub async fn mark_event_undone(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE edge_events SET undone = 1 WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn append_node_history(&self, entry: &NodeHistory) -> Result<()> {
        let tags_json = serde_json::to_string(&entry.tags)?;
        let counts_json = serde_json::to_string(&entry.token_counts)?;
        let metadata_json = entry.metadata.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO node_history (node_id, version, title, body, tags, token_counts, metadata, operation, restored_from_version, created_at) VALUES (?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(entry.node_id.to_string())
        .bind(entry.version)
        .bind(&entry.title)
        .bind(&entry.body)
        .bind(tags_json)
        .bind(counts_json)
        .bind(metadata_json)
        .bind(format!("{:?}", entry.operation).to_lowercase())
        .bind(entry.restored_from_version)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn history_of(&self, node_id: Uuid) -> Result<Vec<NodeHistory>> {
        let rows = sqlx::query("SELECT * FROM node_history WHERE node_id = ? ORDER BY version ASC")
            .bind(node_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_history).collect()
    }

    pub async fn latest_history_version(&self, node_id: Uuid) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT MAX(version) FROM node_history WHERE node_id = ?")
                .bind(node_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(v,)| Some(v)).unwrap_or(0))
    }
}

/// Minimal draft used when logging an edge transition; `id`/`undone` are
/// assigned by the store.
pub struct EdgeEventDraft {
    pub edge_id: Option<Uuid>,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub prev_status: Option<String>,
    pub next_status: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

pub fn sha256_hex(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

// -- transactional helpers shared by Store and Linker ---------------------

pub(crate) async fn insert_node_tx(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, node: &Node) -> Result<()> {
    let tags_json = serde_json::to_string(&node.tags)?;
    let counts_json = serde_json::to_string(&node.token_counts)?;
    let metadata_json = node.metadata.as_ref().map(serde_json::to_string).transpose()?;
    let embedding_blob = node.embedding.as_ref().map(|v| f32_vec_to_blob(v));
    sqlx::query(
        "INSERT INTO nodes (id, title, body, tags, token_counts, embedding, created_at, updated_at, is_chunk, parent_document_id, chunk_order, metadata, accepted_degree, approximate_scored) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
    )
    .bind(node.id.to_string())
    .bind(&node.title)
    .bind(&node.body)
    .bind(tags_json)
    .bind(counts_json)
    .bind(embedding_blob)
    .bind(node.created_at.to_rfc3339())
    .bind(node.updated_at.to_rfc3339())
    .bind(node.is_chunk)
    .bind(node.parent_document_id.map(|id| id.to_string()))
    .bind(node.chunk_order)
    .bind(metadata_json)
    .bind(node.accepted_degree)
    .bind(node.approximate_scored)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn update_node_tx(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, node: &Node) -> Result<()> {
    let tags_json = serde_json::to_string(&node.tags)?;
    let counts_json = serde_json::to_string(&node.token_counts)?;
    let metadata_json = node.metadata.as_ref().map(serde_json::to_string).transpose()?;
    let embedding_blob = node.embedding.as_ref().map(|v| f32_vec_to_blob(v));
    sqlx::query(
        "UPDATE nodes SET title=?, body=?, tags=?, token_counts=?, embedding=?, updated_at=?, metadata=?, accepted_degree=?, approximate_scored=? WHERE id=?",
    )
    .bind(&node.title)
    .bind(&node.body)
    .bind(tags_json)
    .bind(counts_json)
    .bind(embedding_blob)
    .bind(node.updated_at.to_rfc3339())
    .bind(metadata_json)
    .bind(node.accepted_degree)
    .bind(node.approximate_scored)
    .bind(node.id.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn upsert_edge_tx(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, edge: &Edge) -> Result<()> {
    let shared_json = serde_json::to_string(&edge.shared_tags)?;
    let metadata_json = edge.metadata.as_ref().map(serde_json::to_string).transpose()?;
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT id FROM edges WHERE source_id = ? AND target_id = ?")
            .bind(edge.source_id.to_string())
            .bind(edge.target_id.to_string())
            .fetch_optional(&mut **tx)
            .await?;

    sqlx::query(
        "INSERT INTO edges (id, source_id, target_id, score, semantic_score, tag_score, shared_tags, status, edge_type, metadata, created_at, updated_at) VALUES (?,?,?,?,?,?,?,?,?,?,?,?)
         ON CONFLICT(source_id, target_id) DO UPDATE SET score=excluded.score, semantic_score=excluded.semantic_score, tag_score=excluded.tag_score, shared_tags=excluded.shared_tags, edge_type=excluded.edge_type, metadata=excluded.metadata, updated_at=excluded.updated_at",
    )
    .bind(edge.id.to_string())
    .bind(edge.source_id.to_string())
    .bind(edge.target_id.to_string())
    .bind(edge.score)
    .bind(edge.semantic_score)
    .bind(edge.tag_score)
    .bind(shared_json)
    .bind("accepted")
    .bind(edge.edge_type.as_str())
    .bind(metadata_json)
    .bind(edge.created_at.to_rfc3339())
    .bind(edge.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    if existing.is_none() {
        for id in [edge.source_id, edge.target_id] {
            sqlx::query("UPDATE nodes SET accepted_degree = accepted_degree + 1 WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

pub(crate) async fn delete_edge_tx(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, edge: &Edge) -> Result<()> {
    sqlx::query("DELETE FROM edges WHERE id = ?").bind(edge.id.to_string()).execute(&mut **tx).await?;
    for id in [edge.source_id, edge.target_id] {
        sqlx::query("UPDATE nodes SET accepted_degree = accepted_degree - 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn f32_vec_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_f32_vec(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

fn row_to_node(row: sqlx::sqlite::SqliteRow) -> Result<Node> {
    let id: String = row.try_get("id")?;
    let tags_json: String = row.try_get("tags")?;
    let counts_json: String = row.try_get("token_counts")?;
    let metadata_json: Option<String> = row.try_get("metadata")?;
    let embedding_blob: Option<Vec<u8>> = row.try_get("embedding")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let parent_document_id: Option<String> = row.try_get("parent_document_id")?;

    Ok(Node {
        id: Uuid::parse_str(&id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        tags: serde_json::from_str::<BTreeSet<String>>(&tags_json)?,
        token_counts: serde_json::from_str::<BTreeMap<String, u32>>(&counts_json)?,
        embedding: embedding_blob.map(|b| blob_to_f32_vec(&b)),
        created_at: DateTime::parse_from_rfc3339(&created_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
        is_chunk: row.try_get("is_chunk")?,
        parent_document_id: parent_document_id.map(|s| Uuid::parse_str(&s)).transpose().map_err(|e| ForestError::StorageError(e.to_string()))?,
        chunk_order: row.try_get("chunk_order")?,
        metadata: metadata_json.map(|s| serde_json::from_str::<Metadata>(&s)).transpose()?,
        accepted_degree: row.try_get::<i64, _>("accepted_degree")? as u32,
        approximate_scored: row.try_get("approximate_scored")?,
    })
}

fn row_to_edge(row: sqlx::sqlite::SqliteRow) -> Result<Edge> {
    let id: String = row.try_get("id")?;
    let source_id: String = row.try_get("source_id")?;
    let target_id: String = row.try_get("target_id")?;
    let shared_json: String = row.try_get("shared_tags")?;
    let metadata_json: Option<String> = row.try_get("metadata")?;
    let edge_type: String = row.try_get("edge_type")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Edge {
        id: Uuid::parse_str(&id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        source_id: Uuid::parse_str(&source_id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        target_id: Uuid::parse_str(&target_id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        score: row.try_get("score")?,
        semantic_score: row.try_get("semantic_score")?,
        tag_score: row.try_get("tag_score")?,
        shared_tags: serde_json::from_str(&shared_json)?,
        status: EdgeStatus::Accepted,
        edge_type: EdgeType::parse(&edge_type),
        metadata: metadata_json.map(|s| serde_json::from_str(&s)).transpose()?,
        created_at: DateTime::parse_from_rfc3339(&created_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
    })
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Result<Document> {
    let id: String = row.try_get("id")?;
    let metadata_json: Option<String> = row.try_get("metadata")?;
    let root_node_id: Option<String> = row.try_get("root_node_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Document {
        id: Uuid::parse_str(&id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        metadata: metadata_json.map(|s| serde_json::from_str::<DocumentMetadata>(&s)).transpose()?,
        version: row.try_get("version")?,
        root_node_id: root_node_id.map(|s| Uuid::parse_str(&s)).transpose().map_err(|e| ForestError::StorageError(e.to_string()))?,
        created_at: DateTime::parse_from_rfc3339(&created_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
    })
}

fn row_to_chunk(row: sqlx::sqlite::SqliteRow) -> Result<DocumentChunk> {
    let document_id: String = row.try_get("document_id")?;
    let node_id: String = row.try_get("node_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(DocumentChunk {
        document_id: Uuid::parse_str(&document_id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        segment_id: row.try_get("segment_id")?,
        node_id: Uuid::parse_str(&node_id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        offset: row.try_get("offset_bytes")?,
        length: row.try_get("length_bytes")?,
        chunk_order: row.try_get("chunk_order")?,
        checksum: row.try_get("checksum")?,
        created_at: DateTime::parse_from_rfc3339(&created_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
    })
}

fn row_to_edge_event(row: sqlx::sqlite::SqliteRow) -> Result<EdgeEvent> {
    let edge_id: Option<String> = row.try_get("edge_id")?;
    let source_id: String = row.try_get("source_id")?;
    let target_id: String = row.try_get("target_id")?;
    let payload: Option<String> = row.try_get("payload")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(EdgeEvent {
        id: row.try_get("id")?,
        edge_id: edge_id.map(|s| Uuid::parse_str(&s)).transpose().map_err(|e| ForestError::StorageError(e.to_string()))?,
        source_id: Uuid::parse_str(&source_id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        target_id: Uuid::parse_str(&target_id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        prev_status: row.try_get("prev_status")?,
        next_status: row.try_get("next_status")?,
        payload: payload.map(|s| serde_json::from_str(&s)).transpose()?,
        created_at: DateTime::parse_from_rfc3339(&created_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
        undone: row.try_get("undone")?,
    })
}

fn row_to_history(row: sqlx::sqlite::SqliteRow) -> Result<NodeHistory> {
    let node_id: String = row.try_get("node_id")?;
    let tags_json: String = row.try_get("tags")?;
    let counts_json: String = row.try_get("token_counts")?;
    let metadata_json: Option<String> = row.try_get("metadata")?;
    let operation: String = row.try_get("operation")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(NodeHistory {
        node_id: Uuid::parse_str(&node_id).map_err(|e| ForestError::StorageError(e.to_string()))?,
        version: row.try_get("version")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        tags: serde_json::from_str(&tags_json)?,
        token_counts: serde_json::from_str(&counts_json)?,
        metadata: metadata_json.map(|s| serde_json::from_str(&s)).transpose()?,
        operation: match operation.as_str() {
            "create" => HistoryOp::Create,
            "restore" => HistoryOp::Restore,
            _ => HistoryOp::Update,
        },
        restored_from_version: row.try_get("restored_from_version")?,
        created_at: DateTime::parse_from_rfc3339(&created_at).map_err(|e| ForestError::StorageError(e.to_string()))?.with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_fetch_node_roundtrips() {
        let store = Store::open_in_memory().await.unwrap();
        let node = Node::new("Title", "Body text");
        store.insert_node(&node).await.unwrap();
        let fetched = store.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Title");
        assert_eq!(fetched.accepted_degree, 0);
    }

    #[tokio::test]
    async fn edge_insert_increments_degree_once() {
        let store = Store::open_in_memory().await.unwrap();
        let a = Node::new("A", "a");
        let b = Node::new("B", "b");
        store.insert_node(&a).await.unwrap();
        store.insert_node(&b).await.unwrap();

        let (lo, hi) = Edge::canonical_pair(a.id, b.id);
        let edge = Edge {
            id: Uuid::new_v4(),
            source_id: lo,
            target_id: hi,
            score: 0.9,
            semantic_score: Some(0.9),
            tag_score: None,
            shared_tags: vec![],
            status: EdgeStatus::Accepted,
            edge_type: EdgeType::Semantic,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_edge(&edge).await.unwrap();

        let a_after = store.get_node(a.id).await.unwrap().unwrap();
        let b_after = store.get_node(b.id).await.unwrap().unwrap();
        assert_eq!(a_after.accepted_degree, 1);
        assert_eq!(b_after.accepted_degree, 1);

        // Re-upserting the same pair must not double-increment.
        store.upsert_edge(&edge).await.unwrap();
        let a_again = store.get_node(a.id).await.unwrap().unwrap();
        assert_eq!(a_again.accepted_degree, 1);
    }

    #[tokio::test]
    async fn delete_node_cascades_edges_and_decrements_neighbor() {
        let store = Store::open_in_memory().await.unwrap();
        let a = Node::new("A", "a");
        let b = Node::new("B", "b");
        store.insert_node(&a).await.unwrap();
        store.insert_node(&b).await.unwrap();
        let (lo, hi) = Edge::canonical_pair(a.id, b.id);
        let edge = Edge {
            id: Uuid::new_v4(),
            source_id: lo,
            target_id: hi,
            score: 0.9,
            semantic_score: Some(0.9),
            tag_score: None,
            shared_tags: vec![],
            status: EdgeStatus::Accepted,
            edge_type: EdgeType::Semantic,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_edge(&edge).await.unwrap();
        store.delete_node(a.id).await.unwrap();

        let b_after = store.get_node(b.id).await.unwrap().unwrap();
        assert_eq!(b_after.accepted_degree, 0);
        assert!(store.edges_of(b.id).await.unwrap().is_empty());
    }
}
