//! HistoryLedger (spec §4.9): per-node version log and edge-event log,
//! backing `restore(k)` and `undoLast(sourceId, targetId)`.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{ForestError, Result};
use crate::model::{EdgeStatus, HistoryOp, Node, NodeHistory};
use crate::store::{update_node_tx, EdgeEventDraft, Store};

pub struct HistoryLedger {
    store: Store,
}

impl HistoryLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append a version snapshot for `node` tagged with `operation`.
    pub async fn record(&self, node: &Node, operation: HistoryOp, restored_from: Option<i64>) -> Result<()> {
        let version = self.store.latest_history_version(node.id).await? + 1;
        let entry = NodeHistory {
            node_id: node.id,
            version,
            title: node.title.clone(),
            body: node.body.clone(),
            tags: node.tags.clone(),
            token_counts: node.token_counts.clone(),
            metadata: node.metadata.clone(),
            operation,
            restored_from_version: restored_from,
            created_at: Utc::now(),
        };
        self.store.append_node_history(&entry).await
    }

    /// Fetch version `k`, write its content into the node, append a new
    /// `restore` version referencing `k`.
    pub async fn restore(&self, node_id: Uuid, version: i64) -> Result<Node> {
        let history = self.store.history_of(node_id).await?;
        let target = history
            .into_iter()
            .find(|h| h.version == version)
            .ok_or_else(|| ForestError::not_found(format!("node {node_id} has no history version {version}")))?;

        let mut node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ForestError::not_found(format!("node {node_id}")))?;

        node.title = target.title;
        node.body = target.body;
        node.tags = target.tags;
        node.token_counts = target.token_counts;
        node.metadata = target.metadata;
        node.updated_at = Utc::now();

        let mut tx = self.store.begin().await?;
        update_node_tx(&mut tx, &node).await?;
        tx.commit().await?;

        self.record(&node, HistoryOp::Restore, Some(version)).await?;
        Ok(node)
    }

    /// Record an edge status transition.
    pub async fn record_edge_event(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        edge_id: Option<Uuid>,
        prev_status: Option<EdgeStatus>,
        next_status: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<i64> {
        let draft = EdgeEventDraft {
            edge_id,
            source_id,
            target_id,
            prev_status: prev_status.map(|s| format!("{s:?}").to_lowercase()),
            next_status: next_status.to_string(),
            payload,
            created_at: Utc::now(),
        };
        self.store.record_edge_event(&draft).await
    }

    /// Find the most recent non-undone event for `(sourceId, targetId)`,
    /// reverse it (delete → recreate with prior score; create → delete),
    /// and mark it undone.
    pub async fn undo_last(&self, source_id: Uuid, target_id: Uuid) -> Result<()> {
        let event = self
            .store
            .last_undoable_event()
            .await?
            .filter(|e| (e.source_id == source_id && e.target_id == target_id) || (e.source_id == target_id && e.target_id == source_id))
            .ok_or_else(|| ForestError::not_found("no undoable edge event for this pair"))?;

        match event.next_status.as_str() {
            "accepted" => {
                if let Some(edge) = self.store.find_edge(source_id, target_id).await? {
                    self.store.delete_edge(&edge).await?;
                }
            }
            "deleted" => {
                if let Some(payload) = &event.payload {
                    if let Ok(edge) = serde_json::from_value::<crate::model::Edge>(payload.clone()) {
                        self.store.upsert_edge(&edge).await?;
                    }
                }
            }
            _ => {}
        }

        self.store.mark_event_undone(event.id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EdgeType;

    #[tokio::test]
    async fn record_and_restore_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let ledger = HistoryLedger::new(store.clone());

        let mut node = Node::new("Original", "Original body");
        store.insert_node(&node).await.unwrap();
        ledger.record(&node, HistoryOp::Create, None).await.unwrap();

        node.title = "Edited".to_string();
        node.body = "Edited body".to_string();
        let mut tx = store.begin().await.unwrap();
        crate::store::update_node_tx(&mut tx, &node).await.unwrap();
        tx.commit().await.unwrap();
        ledger.record(&node, HistoryOp::Update, None).await.unwrap();

        let restored = ledger.restore(node.id, 1).await.unwrap();
        assert_eq!(restored.title, "Original");

        let history = store.history_of(node.id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().operation, HistoryOp::Restore);
    }

    #[tokio::test]
    async fn undo_last_removes_most_recent_accept() {
        let store = Store::open_in_memory().await.unwrap();
        let ledger = HistoryLedger::new(store.clone());
        let a = Node::new("A", "a");
        let b = Node::new("B", "b");
        store.insert_node(&a).await.unwrap();
        store.insert_node(&b).await.unwrap();

        let (lo, hi) = crate::model::Edge::canonical_pair(a.id, b.id);
        let edge = crate::model::Edge {
            id: Uuid::new_v4(),
            source_id: lo,
            target_id: hi,
            score: 0.8,
            semantic_score: Some(0.8),
            tag_score: None,
            shared_tags: vec![],
            status: EdgeStatus::Accepted,
            edge_type: EdgeType::Semantic,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_edge(&edge).await.unwrap();
        ledger.record_edge_event(lo, hi, Some(edge.id), None, "accepted", None).await.unwrap();

        ledger.undo_last(a.id, b.id).await.unwrap();
        assert!(store.find_edge(a.id, b.id).await.unwrap().is_none());
    }
}
