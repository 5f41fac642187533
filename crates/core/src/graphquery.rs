//! GraphQuery (spec §4.7): read-only operations over the Store — semantic
//! top-k, metadata search, neighborhood expansion, shortest path, and
//! token-budgeted context bundles.
//!
//! Context bundles reuse the teacher's token-budget shape (a default
//! budget, tiered allocation by an importance proxy) generalized from
//! "file importance" to "node acceptedDegree plus hub/bridge/periphery
//! tier."

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::embedder::Embedder;
use crate::error::Result;
use crate::model::{Edge, Node};
use crate::scorer::semantic_score;
use crate::store::Store;
use crate::tokenizer::tokenize;

/// Mirrors the teacher's `budget.rs::DEFAULT_TOKEN_BUDGET`.
pub const DEFAULT_TOKEN_BUDGET: u32 = 50_000;

pub struct GraphQuery {
    store: Store,
}

#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub node_id: Uuid,
    pub score: f64,
}

impl GraphQuery {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Embed `query`, score cosine against every stored embedding, rank
    /// descending, then substitute each chunk hit with its parent
    /// document's root node (keeping the best per-document score), and
    /// return `limit` results starting at `offset`.
    pub async fn semantic_search(
        &self,
        query: &str,
        embedder: &dyn Embedder,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SemanticHit>> {
        let Some(query_vec) = embedder.embed(query).await? else {
            return Ok(Vec::new());
        };

        let ids = self.store.all_node_ids().await?;
        let mut scored: HashMap<Uuid, f64> = HashMap::new();
        for id in ids {
            let Some(node) = self.store.get_node(id).await? else { continue };
            let Some(score) = semantic_score(Some(&query_vec), node.embedding.as_deref()) else {
                continue;
            };

            let dedup_key = if node.is_chunk {
                self.document_root(node.parent_document_id).await?.unwrap_or(node.id)
            } else {
                node.id
            };

            scored.entry(dedup_key).and_modify(|s| *s = s.max(score)).or_insert(score);
        }

        let mut hits: Vec<SemanticHit> = scored.into_iter().map(|(node_id, score)| SemanticHit { node_id, score }).collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.node_id.cmp(&b.node_id)));
        Ok(hits.into_iter().skip(offset).take(limit).collect())
    }

    /// Conjunctive metadata filter over title substring, tags, and an
    /// `updatedAt` window; sorted by the requested order.
    pub async fn metadata_search(&self, filter: &MetadataFilter) -> Result<Vec<Node>> {
        let ids = self.store.all_node_ids().await?;
        let mut matches = Vec::new();
        for id in ids {
            let Some(node) = self.store.get_node(id).await? else { continue };
            if !filter.matches(&node) {
                continue;
            }
            matches.push(node);
        }
        match filter.sort_by {
            SortOrder::Recency => matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
            SortOrder::AcceptedDegree => matches.sort_by(|a, b| b.accepted_degree.cmp(&a.accepted_degree)),
            SortOrder::Textual => matches.sort_by(|a, b| {
                textual_score(b, &filter.term).partial_cmp(&textual_score(a, &filter.term)).unwrap_or(std::cmp::Ordering::Equal)
            }),
        }
        Ok(matches)
    }

    /// BFS from `center` up to `depth` hops, bounded by `limit` returned
    /// nodes; collects every traversed edge.
    pub async fn neighborhood(&self, center: Uuid, depth: u32, limit: usize) -> Result<Neighborhood> {
        let mut visited = HashSet::new();
        visited.insert(center);
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut edge_ids_seen = HashSet::new();
        let mut frontier = VecDeque::new();
        frontier.push_back((center, 0u32));

        if let Some(node) = self.store.get_node(center).await? {
            nodes.push(node);
        }

        while let Some((current, hop)) = frontier.pop_front() {
            if hop >= depth || nodes.len() >= limit {
                continue;
            }
            for edge in self.store.edges_of(current).await? {
                if edge_ids_seen.insert(edge.id) {
                    edges.push(edge.clone());
                }
                let peer = if edge.source_id == current { edge.target_id } else { edge.source_id };
                if visited.insert(peer) {
                    if let Some(node) = self.store.get_node(peer).await? {
                        if nodes.len() < limit {
                            nodes.push(node);
                        }
                    }
                    frontier.push_back((peer, hop + 1));
                }
            }
        }

        Ok(Neighborhood { center_node: center, nodes, edges })
    }

    /// BFS shortest path on the accepted-edge graph from `a` to `b`.
    pub async fn shortest_path(&self, a: Uuid, b: Uuid) -> Result<Option<PathResult>> {
        if a == b {
            return Ok(Some(PathResult { steps: vec![PathStep { node_id: a, edge_id: None, edge_score: None }], total_score: 1.0, hop_count: 0 }));
        }

        let mut visited = HashSet::new();
        visited.insert(a);
        let mut queue = VecDeque::new();
        queue.push_back(a);
        let mut parent: HashMap<Uuid, (Uuid, Edge)> = HashMap::new();

        while let Some(current) = queue.pop_front() {
            if current == b {
                break;
            }
            for edge in self.store.edges_of(current).await? {
                let peer = if edge.source_id == current { edge.target_id } else { edge.source_id };
                if visited.insert(peer) {
                    parent.insert(peer, (current, edge));
                    queue.push_back(peer);
                }
            }
        }

        if !visited.contains(&b) {
            return Ok(None);
        }

        let mut steps = vec![PathStep { node_id: b, edge_id: None, edge_score: None }];
        let mut total_score = 1.0;
        let mut cursor = b;
        while cursor != a {
            let (prev, edge) = parent.get(&cursor).expect("path reconstructed from visited BFS");
            total_score *= edge.score;
            steps.push(PathStep { node_id: *prev, edge_id: Some(edge.id), edge_score: Some(edge.score) });
            cursor = *prev;
        }
        steps.reverse();
        let hop_count = steps.len() as u32 - 1;
        Ok(Some(PathResult { steps, total_score, hop_count }))
    }

    /// Partition `nodes` into hubs (top `acceptedDegree`), bridges (high
    /// ratio of external-to-internal degree within the set), and
    /// periphery, cutting off once `budget_tokens` is spent.
    pub async fn context_bundle(&self, nodes: Vec<Node>, budget_tokens: u32) -> Result<ContextBundle> {
        let ids: HashSet<Uuid> = nodes.iter().map(|n| n.id).collect();
        let mut internal_degree: HashMap<Uuid, u32> = HashMap::new();
        let mut external_degree: HashMap<Uuid, u32> = HashMap::new();
        for node in &nodes {
            for edge in self.store.edges_of(node.id).await? {
                let peer = if edge.source_id == node.id { edge.target_id } else { edge.source_id };
                if ids.contains(&peer) {
                    *internal_degree.entry(node.id).or_insert(0) += 1;
                } else {
                    *external_degree.entry(node.id).or_insert(0) += 1;
                }
            }
        }

        let mut ranked = nodes;
        ranked.sort_by(|a, b| b.accepted_degree.cmp(&a.accepted_degree));

        let hub_count = (ranked.len() / 10).max(1).min(ranked.len());
        let hubs: Vec<Node> = ranked.iter().take(hub_count).cloned().collect();
        let hub_ids: HashSet<Uuid> = hubs.iter().map(|n| n.id).collect();

        let mut remaining: Vec<&Node> = ranked.iter().filter(|n| !hub_ids.contains(&n.id)).collect();
        remaining.sort_by(|a, b| {
            bridge_ratio(b.id, &internal_degree, &external_degree)
                .partial_cmp(&bridge_ratio(a.id, &internal_degree, &external_degree))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let bridge_count = (remaining.len() / 5).min(remaining.len());
        let bridges: Vec<Node> = remaining.iter().take(bridge_count).map(|n| (*n).clone()).collect();
        let bridge_ids: HashSet<Uuid> = bridges.iter().map(|n| n.id).collect();
        let periphery_all: Vec<Node> = remaining.iter().filter(|n| !bridge_ids.contains(&n.id)).map(|n| (*n).clone()).collect();

        let mut spent = 0u32;
        let mut cap = |items: Vec<Node>, spent: &mut u32| -> (Vec<Node>, bool) {
            let mut kept = Vec::new();
            let mut truncated = false;
            for node in items {
                let cost = estimated_node_tokens(&node);
                if *spent + cost > budget_tokens {
                    truncated = true;
                    break;
                }
                *spent += cost;
                kept.push(node);
            }
            (kept, truncated)
        };

        let (hubs, t1) = cap(hubs, &mut spent);
        let (bridges, t2) = cap(bridges, &mut spent);
        let (periphery, t3) = cap(periphery_all, &mut spent);

        Ok(ContextBundle { hubs, bridges, periphery, budget_spent: spent, truncated: t1 || t2 || t3 })
    }
}

fn bridge_ratio(id: Uuid, internal: &HashMap<Uuid, u32>, external: &HashMap<Uuid, u32>) -> f64 {
    let int = *internal.get(&id).unwrap_or(&0) as f64;
    let ext = *external.get(&id).unwrap_or(&0) as f64;
    if int == 0.0 {
        ext
    } else {
        ext / int
    }
}

fn estimated_node_tokens(node: &Node) -> u32 {
    (node.title.len() / 4 + node.body.len() / 4 + 1) as u32
}

fn textual_score(node: &Node, term: &str) -> f64 {
    if term.is_empty() {
        return 0.0;
    }
    let counts = tokenize(&format!("{} {}", node.title, node.body));
    let needle = tokenize(term);
    needle.keys().map(|t| *counts.get(t).unwrap_or(&0) as f64).sum()
}

#[derive(Debug, Clone, Copy)]
pub enum SortOrder {
    Recency,
    Textual,
    AcceptedDegree,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub id_prefix: Option<String>,
    pub title_substring: Option<String>,
    pub term: String,
    pub tags_all: Vec<String>,
    pub tags_any: Vec<String>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub origin: Option<String>,
    pub created_by: Option<String>,
    pub sort_by: SortOrder,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Recency
    }
}

impl MetadataFilter {
    fn matches(&self, node: &Node) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !crate::id::hex(node.id).starts_with(&prefix.to_ascii_lowercase()) {
                return false;
            }
        }
        if let Some(sub) = &self.title_substring {
            if !node.title.to_lowercase().contains(&sub.to_lowercase()) {
                return false;
            }
        }
        if !self.term.is_empty() {
            let haystack = format!("{} {} {}", node.title, node.body, node.tags.iter().cloned().collect::<Vec<_>>().join(" ")).to_lowercase();
            if !haystack.contains(&self.term.to_lowercase()) {
                return false;
            }
        }
        if !self.tags_all.is_empty() && !self.tags_all.iter().all(|t| node.tags.contains(t)) {
            return false;
        }
        if !self.tags_any.is_empty() && !self.tags_any.iter().any(|t| node.tags.contains(t)) {
            return false;
        }
        if let Some(after) = self.updated_after {
            if node.updated_at < after {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if node.updated_at > before {
                return false;
            }
        }
        if let Some(origin) = &self.origin {
            if node.metadata.as_ref().and_then(|m| m.origin.as_ref()) != Some(origin) {
                return false;
            }
        }
        if let Some(created_by) = &self.created_by {
            if node.metadata.as_ref().and_then(|m| m.created_by.as_ref()) != Some(created_by) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct Neighborhood {
    pub center_node: Uuid,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone)]
pub struct PathStep {
    pub node_id: Uuid,
    pub edge_id: Option<Uuid>,
    pub edge_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PathResult {
    pub steps: Vec<PathStep>,
    pub total_score: f64,
    pub hop_count: u32,
}

#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub hubs: Vec<Node>,
    pub bridges: Vec<Node>,
    pub periphery: Vec<Node>,
    pub budget_spent: u32,
    pub truncated: bool,
}

impl GraphQuery {
    async fn document_root(&self, parent_document_id: Option<Uuid>) -> Result<Option<Uuid>> {
        let Some(parent_document_id) = parent_document_id else { return Ok(None) };
        let Some(document) = self.store.get_document(parent_document_id).await? else {
            return Ok(None);
        };
        Ok(document.root_node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::create_embedder;
    use crate::model::{EdgeStatus, EdgeType};
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn neighborhood_collects_one_hop() {
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

        let query = GraphQuery::new(store);
        let result = query.neighborhood(a.id, 1, 10).await.unwrap();
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.edges.len(), 1);
    }

    #[tokio::test]
    async fn shortest_path_same_node_is_trivial() {
        let store = Store::open_in_memory().await.unwrap();
        let a = Node::new("A", "a");
        store.insert_node(&a).await.unwrap();
        let query = GraphQuery::new(store);
        let path = query.shortest_path(a.id, a.id).await.unwrap().unwrap();
        assert_eq!(path.hop_count, 0);
    }

    #[tokio::test]
    async fn metadata_search_filters_by_tag() {
        let store = Store::open_in_memory().await.unwrap();
        let mut a = Node::new("A", "a");
        a.tags = BTreeSet::from(["rust".to_string()]);
        store.insert_node(&a).await.unwrap();
        let mut b = Node::new("B", "b");
        b.tags = BTreeSet::from(["go".to_string()]);
        store.insert_node(&b).await.unwrap();

        let query = GraphQuery::new(store);
        let filter = MetadataFilter { tags_any: vec!["rust".to_string()], ..Default::default() };
        let results = query.metadata_search(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, a.id);
    }

    #[tokio::test]
    async fn semantic_search_returns_empty_without_embedder_vector() {
        let store = Store::open_in_memory().await.unwrap();
        let query = GraphQuery::new(store);
        let embedder = create_embedder("none");
        let hits = query.semantic_search("hello", embedder.as_ref(), 10, 0).await.unwrap();
        assert!(hits.is_empty());
    }
}
