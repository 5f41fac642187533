//! Linker (spec §4.5): on node insert/update, scans candidate peers,
//! invokes the Scorer, applies the acceptance policy including the
//! project-tag cap, and writes edges under a single transaction per pass.

use std::cmp::Ordering;

use chrono::Utc;
use rayon::prelude::*;
use uuid::Uuid;

use crate::config::LinkingContext;
use crate::error::Result;
use crate::model::{Edge, EdgeStatus, EdgeType, Node};
use crate::scorer::{classify, fused_score, is_project_tag, semantic_score, tag_score, AcceptReason, Classification};
use crate::store::{delete_edge_tx, insert_node_tx, upsert_edge_tx, Store};
use crate::tagidf::sync_node_tags_tx;

pub struct Linker {
    store: Store,
}

#[derive(Debug, Clone)]
struct Candidate {
    peer_id: Uuid,
    semantic: Option<f64>,
    tag: Option<f64>,
    shared_tags: Vec<String>,
    reason: AcceptReason,
}

impl Candidate {
    fn fused(&self) -> f64 {
        fused_score(self.semantic, self.tag)
    }

    fn has_project_tag(&self) -> bool {
        self.shared_tags.iter().any(|t| is_project_tag(t))
    }

    fn best_channel(&self) -> f64 {
        self.semantic.unwrap_or(0.0).max(self.tag.unwrap_or(0.0))
    }
}

impl Linker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Candidate scanning runs across the thread pool — the same
    /// `rayon`-parallel shape the teacher uses for bulk symbol/semantic
    /// scans over a repo, here scanning every other node in the graph.
    fn score_candidates(node: &Node, candidates: &[Node], ctx: &LinkingContext) -> Vec<Candidate> {
        candidates
            .par_iter()
            .filter_map(|peer| {
                let semantic = semantic_score(node.embedding.as_deref(), peer.embedding.as_deref());
                let tag = tag_score(&node.tags, &peer.tags, &ctx.idf);
                let shared_tags = tag.as_ref().map(|t| t.shared_tags.clone()).unwrap_or_default();
                let classification = classify(
                    semantic,
                    tag.as_ref().map(|t| t.score),
                    &shared_tags,
                    ctx.semantic_threshold,
                    ctx.tag_threshold,
                    ctx.project_floor,
                );
                match classification {
                    Classification::Accepted(reason) => Some(Candidate {
                        peer_id: peer.id,
                        semantic,
                        tag: tag.map(|t| t.score),
                        shared_tags,
                        reason,
                    }),
                    Classification::Discard => None,
                }
            })
            .collect()
    }

    /// Apply the project-tag cap. The cap only ever truncates candidates
    /// that were accepted *solely* via the project-floor fallback
    /// (`AcceptReason::ProjectFloor`): an edge that independently cleared
    /// the semantic or tag threshold is kept unconditionally, no matter how
    /// many project-tagged peers the node has (spec.md §9).
    fn apply_project_cap(accepted: Vec<Candidate>, cap: u32) -> Vec<Candidate> {
        let (mut floor_only, unconditional): (Vec<Candidate>, Vec<Candidate>) =
            accepted.into_iter().partition(|c| c.reason == AcceptReason::ProjectFloor);

        floor_only.sort_by(|a, b| {
            b.fused()
                .partial_cmp(&a.fused())
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.best_channel().partial_cmp(&a.best_channel()).unwrap_or(Ordering::Equal))
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        floor_only.truncate(cap as usize);

        let mut result = unconditional;
        result.extend(floor_only);
        result
    }

    /// Score `node` against every other node, apply the project cap and
    /// the single-strongest-peer fallback, without touching the store.
    fn classify_candidates(node: &Node, candidates: &[Node], ctx: &LinkingContext) -> Vec<Candidate> {
        let accepted = Self::score_candidates(node, candidates, ctx);
        let mut kept = Self::apply_project_cap(accepted, ctx.project_cap);

        if kept.iter().all(|c| !c.has_project_tag()) {
            if let Some(fallback) = Self::strongest_project_peer(node, candidates, ctx) {
                kept.push(fallback);
            }
        }
        kept
    }

    /// Write one edge per kept candidate against an already-open
    /// transaction.
    async fn write_edges_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        node_id: Uuid,
        kept: &[Candidate],
        ctx: &LinkingContext,
    ) -> Result<Vec<Edge>> {
        let mut edges = Vec::with_capacity(kept.len());
        for candidate in kept {
            let (lo, hi) = Edge::canonical_pair(node_id, candidate.peer_id);
            let edge = Edge {
                id: Uuid::new_v4(),
                source_id: lo,
                target_id: hi,
                score: candidate.fused(),
                semantic_score: candidate.semantic,
                tag_score: candidate.tag,
                shared_tags: candidate.shared_tags.clone(),
                status: EdgeStatus::Accepted,
                edge_type: EdgeType::Semantic,
                metadata: None,
                created_at: ctx.now,
                updated_at: ctx.now,
            };
            upsert_edge_tx(tx, &edge).await?;
            edges.push(edge);
        }
        Ok(edges)
    }

    /// `linkNew`: scan all other nodes, score, classify, apply the project
    /// cap and fallback, then insert the node, sync its tag-IDF membership
    /// rows, and write accepted edges — all in one transaction, the atomic
    /// unit a capture requires.
    pub async fn link_new(&self, node: &Node, ctx: &LinkingContext) -> Result<Vec<Edge>> {
        let candidates = self.store.all_nodes_except(node.id).await?;
        let kept = Self::classify_candidates(node, &candidates, ctx);

        let _guard = self.store.lock_writer().await;
        let mut tx = self.store.begin().await?;
        insert_node_tx(&mut tx, node).await?;
        sync_node_tags_tx(&mut tx, node.id, &node.tags).await?;
        let edges = Self::write_edges_tx(&mut tx, node.id, &kept, ctx).await?;
        tx.commit().await?;
        Ok(edges)
    }

    /// Link an already-persisted node against its peers without
    /// re-inserting it — used when a caller has batched node insertion
    /// separately (e.g. a document import that must insert all of its
    /// chunks as a single transaction before any of them are linked).
    pub async fn link_existing(&self, node: &Node, ctx: &LinkingContext) -> Result<Vec<Edge>> {
        let candidates = self.store.all_nodes_except(node.id).await?;
        let kept = Self::classify_candidates(node, &candidates, ctx);

        let _guard = self.store.lock_writer().await;
        let mut tx = self.store.begin().await?;
        let edges = Self::write_edges_tx(&mut tx, node.id, &kept, ctx).await?;
        tx.commit().await?;
        Ok(edges)
    }

    /// A project peer outside the accepted set, if any, scored for the
    /// fallback rule: "if no project-based accept passes thresholds but
    /// the node has at least one project peer, keep the single strongest".
    fn strongest_project_peer(node: &Node, candidates: &[Node], ctx: &LinkingContext) -> Option<Candidate> {
        let is_project_node = node.tags.iter().any(|t| is_project_tag(t));
        if !is_project_node {
            return None;
        }
        candidates
            .iter()
            .filter(|peer| peer.tags.intersection(&node.tags).any(|t| is_project_tag(t)))
            .map(|peer| {
                let semantic = semantic_score(node.embedding.as_deref(), peer.embedding.as_deref());
                let tag = tag_score(&node.tags, &peer.tags, &ctx.idf);
                let shared_tags = tag.as_ref().map(|t| t.shared_tags.clone()).unwrap_or_default();
                Candidate { peer_id: peer.id, semantic, tag: tag.map(|t| t.score), shared_tags, reason: AcceptReason::ProjectFloor }
            })
            .max_by(|a, b| a.fused().partial_cmp(&b.fused()).unwrap_or(Ordering::Equal))
    }

    /// `relink`: rescore all incident edges of `node` (only `semantic`-typed
    /// ones — parent-child/sequential/manual edges are never touched),
    /// dropping any that no longer classify as accepted and upserting the
    /// rest with fresh scores.
    pub async fn relink(&self, node: &Node, ctx: &LinkingContext) -> Result<Vec<Edge>> {
        let incident = self.store.edges_of(node.id).await?;
        let candidates = self.store.all_nodes_except(node.id).await?;

        let _guard = self.store.lock_writer().await;
        let mut tx = self.store.begin().await?;
        let mut surviving = Vec::new();

        for edge in incident.into_iter().filter(|e| e.edge_type == EdgeType::Semantic) {
            let peer_id = if edge.source_id == node.id { edge.target_id } else { edge.source_id };
            let Some(peer) = candidates.iter().find(|n| n.id == peer_id) else {
                continue;
            };
            let semantic = semantic_score(node.embedding.as_deref(), peer.embedding.as_deref());
            let tag = tag_score(&node.tags, &peer.tags, &ctx.idf);
            let shared_tags = tag.as_ref().map(|t| t.shared_tags.clone()).unwrap_or_default();
            let classification = classify(
                semantic,
                tag.as_ref().map(|t| t.score),
                &shared_tags,
                ctx.semantic_threshold,
                ctx.tag_threshold,
                ctx.project_floor,
            );
            match classification {
                Classification::Discard => {
                    delete_edge_tx(&mut tx, &edge).await?;
                }
                Classification::Accepted(_) => {
                    let mut updated = edge.clone();
                    updated.semantic_score = semantic;
                    updated.tag_score = tag.map(|t| t.score);
                    updated.shared_tags = shared_tags;
                    updated.score = fused_score(updated.semantic_score, updated.tag_score);
                    updated.updated_at = ctx.now;
                    upsert_edge_tx(&mut tx, &updated).await?;
                    surviving.push(updated);
                }
            }
        }

        // New candidate peers not yet connected may now qualify.
        let connected: std::collections::HashSet<Uuid> =
            surviving.iter().map(|e| if e.source_id == node.id { e.target_id } else { e.source_id }).collect();
        let fresh_candidates: Vec<Node> = candidates.into_iter().filter(|n| !connected.contains(&n.id)).collect();
        let new_accepted = Self::score_candidates(node, &fresh_candidates, ctx);
        let capped = Self::apply_project_cap(new_accepted, ctx.project_cap);
        for candidate in capped {
            let (lo, hi) = Edge::canonical_pair(node.id, candidate.peer_id);
            let edge = Edge {
                id: Uuid::new_v4(),
                source_id: lo,
                target_id: hi,
                score: candidate.fused(),
                semantic_score: candidate.semantic,
                tag_score: candidate.tag,
                shared_tags: candidate.shared_tags,
                status: EdgeStatus::Accepted,
                edge_type: EdgeType::Semantic,
                metadata: None,
                created_at: ctx.now,
                updated_at: ctx.now,
            };
            upsert_edge_tx(&mut tx, &edge).await?;
            surviving.push(edge);
        }

        tx.commit().await?;
        Ok(surviving)
    }

    /// `link(a, b, name?)`: adds a synthetic `link/<name>` tag to both
    /// nodes' tag sets and re-links both. Rare `link/*` tags trip the
    /// bridge bonus in the Scorer, producing a strong tag edge.
    pub async fn link(&self, mut a: Node, mut b: Node, name: Option<&str>, ctx: &LinkingContext) -> Result<Edge> {
        let tag_name = name.map(str::to_string).unwrap_or_else(|| format!("link/{}", Uuid::new_v4().simple()));
        let tag = format!("link/{tag_name}").replace("link/link/", "link/");
        a.tags.insert(tag.clone());
        b.tags.insert(tag.clone());
        a.updated_at = ctx.now;
        b.updated_at = ctx.now;

        let _guard = self.store.lock_writer().await;
        let mut tx = self.store.begin().await?;
        crate::store::update_node_tx(&mut tx, &a).await?;
        crate::store::update_node_tx(&mut tx, &b).await?;

        let semantic = semantic_score(a.embedding.as_deref(), b.embedding.as_deref());
        let tag_result = tag_score(&a.tags, &b.tags, &ctx.idf);
        let shared_tags = tag_result.as_ref().map(|t| t.shared_tags.clone()).unwrap_or_default();
        let (lo, hi) = Edge::canonical_pair(a.id, b.id);
        let edge = Edge {
            id: Uuid::new_v4(),
            source_id: lo,
            target_id: hi,
            score: fused_score(semantic, tag_result.as_ref().map(|t| t.score)),
            semantic_score: semantic,
            tag_score: tag_result.map(|t| t.score),
            shared_tags,
            status: EdgeStatus::Accepted,
            edge_type: EdgeType::Manual,
            metadata: None,
            created_at: ctx.now,
            updated_at: ctx.now,
        };
        upsert_edge_tx(&mut tx, &edge).await?;
        tx.commit().await?;
        Ok(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdfContext;
    use crate::embedder::create_embedder;
    use std::collections::BTreeSet;

    fn ctx() -> LinkingContext {
        LinkingContext {
            idf: IdfContext { total_nodes: 2, max_idf: 1.0, idf_by_tag: Default::default() },
            semantic_threshold: 0.5,
            tag_threshold: 0.3,
            project_floor: 0.3,
            project_cap: 10,
            embedder: create_embedder("mock"),
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn link_new_writes_edge_and_degree() {
        let store = Store::open_in_memory().await.unwrap();
        let linker = Linker::new(store.clone());
        let c = ctx();

        let mut a = Node::new("Rust ownership", "Rust ownership and borrowing basics");
        a.tags = BTreeSet::from(["rust".to_string()]);
        a.embedding = Some(vec![1.0, 0.0]);
        store.insert_node(&a).await.unwrap();

        let mut b = Node::new("Rust borrowing", "More on Rust borrowing rules");
        b.tags = BTreeSet::from(["rust".to_string()]);
        b.embedding = Some(vec![0.9, 0.1]);

        let edges = linker.link_new(&b, &c).await.unwrap();
        assert_eq!(edges.len(), 1);

        let a_after = store.get_node(a.id).await.unwrap().unwrap();
        let b_after = store.get_node(b.id).await.unwrap().unwrap();
        assert_eq!(a_after.accepted_degree, 1);
        assert_eq!(b_after.accepted_degree, 1);
    }

    #[tokio::test]
    async fn project_cap_keeps_only_strongest_peers() {
        let store = Store::open_in_memory().await.unwrap();
        let linker = Linker::new(store.clone());
        let mut c = ctx();
        c.project_cap = 1;
        c.semantic_threshold = 2.0; // unreachable, force project-floor path
        c.tag_threshold = 2.0;
        c.project_floor = 0.0;

        for i in 0..3 {
            let mut peer = Node::new(format!("peer {i}"), "shared project note");
            peer.tags = BTreeSet::from(["project:forest".to_string()]);
            store.insert_node(&peer).await.unwrap();
        }

        let mut node = Node::new("new", "shared project note");
        node.tags = BTreeSet::from(["project:forest".to_string()]);

        let edges = linker.link_new(&node, &c).await.unwrap();
        assert_eq!(edges.len(), 1);
    }

    /// Edges that independently clear the semantic threshold must never be
    /// dropped by the project cap, even when they also share a project tag
    /// and outnumber the cap.
    #[tokio::test]
    async fn project_cap_does_not_truncate_threshold_passing_accepts() {
        let store = Store::open_in_memory().await.unwrap();
        let linker = Linker::new(store.clone());
        let mut c = ctx();
        c.project_cap = 1;
        c.semantic_threshold = 0.5;

        for i in 0..3 {
            let mut peer = Node::new(format!("peer {i}"), "shared project note");
            peer.tags = BTreeSet::from(["project:forest".to_string()]);
            peer.embedding = Some(vec![1.0, 0.0]);
            store.insert_node(&peer).await.unwrap();
        }

        let mut node = Node::new("new", "shared project note");
        node.tags = BTreeSet::from(["project:forest".to_string()]);
        node.embedding = Some(vec![1.0, 0.0]);

        let edges = linker.link_new(&node, &c).await.unwrap();
        assert_eq!(edges.len(), 3);
    }
}
