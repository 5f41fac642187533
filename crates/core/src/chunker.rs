//! Chunker / Importer (spec §4.6): splits a long document into ordered
//! chunk nodes, writes the canonical `Document` row and `DocumentChunk`
//! mappings, and delegates semantic linking to the [`Linker`].
//!
//! Heading detection is a small regex over `&str`, not a markdown AST —
//! the same "line-pattern, not parser" style the teacher uses for its own
//! lightweight structural scans.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::config::LinkingContext;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::linker::Linker;
use crate::model::{Document, DocumentChunk, DocumentMetadata, Edge, EdgeStatus, EdgeType, Metadata, Node};
use crate::store::{insert_node_tx, sha256_hex, Store};
use crate::tokenizer::{extract_tags, tokenize};

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    Headers,
    Size,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub chunk_strategy: ChunkStrategy,
    pub max_tokens: u32,
    pub overlap: u32,
    pub auto_link: bool,
    pub create_parent: bool,
    pub link_sequential: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            chunk_strategy: ChunkStrategy::Hybrid,
            max_tokens: 512,
            overlap: 50,
            auto_link: true,
            create_parent: true,
            link_sequential: true,
        }
    }
}

struct RawChunk {
    title: String,
    body: String,
}

fn estimated_tokens(text: &str) -> usize {
    text.len() / 4
}

/// First level-1 heading, else first non-empty line (trimmed, ≤100 chars,
/// leading `#` stripped), else a generic fallback.
pub fn extract_title(body: &str) -> String {
    for cap in HEADING.captures_iter(body) {
        if &cap[1] == "#" {
            return cap[2].trim().to_string();
        }
    }
    for line in body.lines() {
        let trimmed = line.trim().trim_start_matches('#').trim();
        if !trimmed.is_empty() {
            return trimmed.chars().take(100).collect();
        }
    }
    "Imported Document".to_string()
}

fn split_headers(body: &str, max_tokens: u32) -> Vec<RawChunk> {
    let mut chunks = Vec::new();
    let mut current_title = String::new();
    let mut current_lines: Vec<&str> = Vec::new();

    let mut flush = |title: &str, lines: &[&str], out: &mut Vec<RawChunk>| {
        if lines.is_empty() {
            return;
        }
        let body = lines.join("\n");
        out.push(RawChunk { title: title.to_string(), body });
    };

    for line in body.lines() {
        if let Some(cap) = HEADING.captures(line) {
            flush(&current_title, &current_lines, &mut chunks);
            current_title = cap[2].trim().to_string();
            current_lines = vec![line];
            continue;
        }
        current_lines.push(line);
        let joined_len: usize = current_lines.iter().map(|l| l.len() + 1).sum();
        if joined_len / 4 > max_tokens as usize && current_lines.len() > 1 {
            let split_at = current_lines.len() - 1;
            let (head, tail) = current_lines.split_at(split_at);
            flush(&current_title, head, &mut chunks);
            current_title = format!("{current_title} (cont.)");
            current_lines = tail.to_vec();
        }
    }
    flush(&current_title, &current_lines, &mut chunks);
    if chunks.is_empty() {
        chunks.push(RawChunk { title: extract_title(body), body: body.to_string() });
    }
    chunks
}

fn split_size(body: &str, max_tokens: u32, overlap: u32) -> Vec<RawChunk> {
    let window = (max_tokens as usize) * 4;
    let bytes = body.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < bytes.len() {
        let mut end = (start + window).min(bytes.len());
        if end < bytes.len() {
            let tail_search_start = start + (window * 7 / 10);
            let slice = &body[tail_search_start.min(body.len())..end.min(body.len())];
            if let Some(pos) = slice.rfind("\n\n").or_else(|| slice.rfind(". ")) {
                end = tail_search_start + pos + 1;
            }
        }
        let end = end.max(start + 1).min(bytes.len());
        let segment = &body[start..end];
        chunks.push(RawChunk { title: String::new(), body: segment.to_string() });
        if end >= bytes.len() {
            break;
        }
        start = end.saturating_sub(overlap as usize).max(start + 1);
    }
    chunks
}

fn split_hybrid(body: &str, max_tokens: u32, overlap: u32) -> Vec<RawChunk> {
    let headers = split_headers(body, max_tokens);
    let mut result = Vec::new();
    for chunk in headers {
        if estimated_tokens(&chunk.body) <= max_tokens as usize {
            result.push(chunk);
            continue;
        }
        let parts = split_size(&chunk.body, max_tokens, overlap);
        let total = parts.len();
        for (i, part) in parts.into_iter().enumerate() {
            let title = if total > 1 {
                format!("{} (part {})", chunk.title, i + 1)
            } else {
                chunk.title.clone()
            };
            result.push(RawChunk { title, body: part.body });
        }
    }
    result
}

pub struct Chunker {
    store: Store,
    linker: Linker,
}

impl Chunker {
    pub fn new(store: Store) -> Self {
        let linker = Linker::new(store.clone());
        Self { store, linker }
    }

    /// Ingest `body` under `title`/`tags` per `options`, writing chunk
    /// nodes, the canonical `Document` row, `DocumentChunk` mappings, and
    /// (per options) parent-child/sequential/semantic edges.
    pub async fn import(
        &self,
        body: &str,
        title: Option<&str>,
        tags: std::collections::BTreeSet<String>,
        options: &ImportOptions,
        embedder: &dyn Embedder,
        ctx: &LinkingContext,
    ) -> Result<Uuid> {
        let doc_title = title.map(str::to_string).unwrap_or_else(|| extract_title(body));
        let raw_chunks = match options.chunk_strategy {
            ChunkStrategy::Headers => split_headers(body, options.max_tokens),
            ChunkStrategy::Size => split_size(body, options.max_tokens, options.overlap),
            ChunkStrategy::Hybrid => split_hybrid(body, options.max_tokens, options.overlap),
        };
        let total_chunks = raw_chunks.len();

        let document_id = Uuid::new_v4();
        let mut chunk_nodes = Vec::with_capacity(total_chunks);
        for (index, raw) in raw_chunks.iter().enumerate() {
            let counts = tokenize(&raw.body);
            let chunk_tags = if tags.is_empty() {
                extract_tags(&raw.body, &counts, 6)
            } else {
                tags.clone()
            };
            let embedding = embedder.embed(&raw.body).await.ok().flatten();
            let chunk_title = if raw.title.is_empty() {
                format!("{doc_title} (part {})", index + 1)
            } else {
                raw.title.clone()
            };

            let mut node = Node::new(chunk_title, raw.body.clone());
            node.tags = chunk_tags;
            node.token_counts = counts;
            node.embedding = embedding;
            node.is_chunk = true;
            node.parent_document_id = Some(document_id);
            node.chunk_order = Some(index as u32);
            node.metadata = Some(Metadata {
                origin: Some("import".to_string()),
                ..Default::default()
            });

            chunk_nodes.push(node);
        }

        let mut root = None;
        if options.create_parent {
            let mut r = Node::new(doc_title.clone(), body.to_string());
            r.tags = tags.clone();
            r.token_counts = tokenize(body);
            root = Some(r);
        }

        // Insert every chunk node (and the parent, if any) as one atomic
        // unit — a crash partway through must never leave a half-imported
        // document behind.
        {
            let _guard = self.store.lock_writer().await;
            let mut tx = self.store.begin().await?;
            for node in &chunk_nodes {
                insert_node_tx(&mut tx, node).await?;
            }
            if let Some(root) = &root {
                insert_node_tx(&mut tx, root).await?;
            }
            tx.commit().await?;
        }

        let root_node_id = root.as_ref().map(|r| r.id);
        if let Some(root) = &root {
            let _guard = self.store.lock_writer().await;
            let mut tx = self.store.begin().await?;
            for chunk in &chunk_nodes {
                let (lo, hi) = Edge::canonical_pair(root.id, chunk.id);
                let edge = Edge {
                    id: Uuid::new_v4(),
                    source_id: lo,
                    target_id: hi,
                    score: 1.0,
                    semantic_score: None,
                    tag_score: None,
                    shared_tags: vec![],
                    status: EdgeStatus::Accepted,
                    edge_type: EdgeType::ParentChild,
                    metadata: Some(serde_json::json!({"relationship": "parent-child"})),
                    created_at: ctx.now,
                    updated_at: ctx.now,
                };
                crate::store::upsert_edge_tx(&mut tx, &edge).await?;
            }
            tx.commit().await?;
        }

        if options.auto_link {
            for node in &chunk_nodes {
                self.linker.link_existing(node, ctx).await?;
            }
            if let Some(root) = &root {
                self.linker.link_existing(root, ctx).await?;
            }
        }

        if options.link_sequential {
            let _guard = self.store.lock_writer().await;
            let mut tx = self.store.begin().await?;
            for pair in chunk_nodes.windows(2) {
                let (lo, hi) = Edge::canonical_pair(pair[0].id, pair[1].id);
                let edge = Edge {
                    id: Uuid::new_v4(),
                    source_id: lo,
                    target_id: hi,
                    score: 1.0,
                    semantic_score: None,
                    tag_score: None,
                    shared_tags: vec![],
                    status: EdgeStatus::Accepted,
                    edge_type: EdgeType::Sequential,
                    metadata: None,
                    created_at: ctx.now,
                    updated_at: ctx.now,
                };
                crate::store::upsert_edge_tx(&mut tx, &edge).await?;
            }
            tx.commit().await?;
        }

        self.write_document(document_id, &doc_title, &chunk_nodes, root_node_id, options, ctx).await?;
        Ok(document_id)
    }

    async fn write_document(
        &self,
        document_id: Uuid,
        title: &str,
        chunks: &[Node],
        root_node_id: Option<Uuid>,
        options: &ImportOptions,
        ctx: &LinkingContext,
    ) -> Result<()> {
        let mut body = String::new();
        let mut offset = 0i64;
        let mut chunk_rows = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            if index > 0 {
                body.push_str("\n\n");
                offset += 2;
            }
            let checksum = sha256_hex(&chunk.body);
            chunk_rows.push(DocumentChunk {
                document_id,
                segment_id: format!("seg-{index:04}"),
                node_id: chunk.id,
                offset,
                length: chunk.body.len() as i64,
                chunk_order: index as i64,
                checksum,
                created_at: ctx.now,
                updated_at: ctx.now,
            });
            body.push_str(&chunk.body);
            offset += chunk.body.len() as i64;
        }

        let document = Document {
            id: document_id,
            title: title.to_string(),
            body,
            metadata: Some(DocumentMetadata {
                chunk_strategy: Some(match options.chunk_strategy {
                    ChunkStrategy::Headers => "headers".to_string(),
                    ChunkStrategy::Size => "size".to_string(),
                    ChunkStrategy::Hybrid => "hybrid".to_string(),
                }),
                max_tokens: Some(options.max_tokens as i64),
                overlap: Some(options.overlap as i64),
                chunk_count: Some(chunks.len() as i64),
                auto_link: Some(options.auto_link),
                create_parent: Some(options.create_parent),
                link_sequential: Some(options.link_sequential),
                last_edited_at: Some(ctx.now),
                backfill: None,
                extra: Default::default(),
            }),
            version: 1,
            root_node_id,
            created_at: ctx.now,
            updated_at: ctx.now,
        };

        self.store.insert_document(&document).await?;
        for row in chunk_rows {
            self.store.insert_chunk(&row).await?;
        }
        Ok(())
    }

    /// For every `parentDocumentId` referenced by chunk nodes but lacking
    /// a `Document` row, reconstruct one from the chunk rows in order.
    /// Idempotent: documents already present are left untouched.
    pub async fn backfill_missing_documents(&self, ctx: &LinkingContext) -> Result<Vec<Uuid>> {
        let node_ids = self.store.all_node_ids().await?;
        let mut missing = std::collections::BTreeSet::new();
        for id in node_ids {
            if let Some(node) = self.store.get_node(id).await? {
                if let Some(parent) = node.parent_document_id {
                    if self.store.get_document(parent).await?.is_none() {
                        missing.insert(parent);
                    }
                }
            }
        }

        let mut backfilled = Vec::new();
        for document_id in missing {
            let existing_chunks = self.store.chunks_of_document(document_id).await?;
            if existing_chunks.is_empty() {
                continue;
            }
            let mut body = String::new();
            let mut root_candidate_title = None;
            for (index, chunk_row) in existing_chunks.iter().enumerate() {
                if let Some(node) = self.store.get_node(chunk_row.node_id).await? {
                    if index == 0 {
                        root_candidate_title = Some(node.title.clone());
                    }
                    if index > 0 {
                        body.push_str("\n\n");
                    }
                    body.push_str(&node.body);
                }
            }
            let document = Document {
                id: document_id,
                title: root_candidate_title.unwrap_or_else(|| "Imported Document".to_string()),
                body,
                metadata: Some(DocumentMetadata { backfill: Some(true), ..Default::default() }),
                version: 1,
                root_node_id: None,
                created_at: ctx.now,
                updated_at: ctx.now,
            };
            self.store.insert_document(&document).await?;
            backfilled.push(document_id);
        }
        Ok(backfilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdfContext;
    use crate::embedder::create_embedder;

    fn ctx() -> LinkingContext {
        LinkingContext {
            idf: IdfContext::default(),
            semantic_threshold: 0.99,
            tag_threshold: 0.99,
            project_floor: 0.99,
            project_cap: 10,
            embedder: create_embedder("mock"),
            now: chrono::Utc::now(),
        }
    }

    #[test]
    fn extract_title_prefers_level_one_heading() {
        assert_eq!(extract_title("# Hello World\nbody"), "Hello World");
        assert_eq!(extract_title("no heading here\nmore text"), "no heading here");
        assert_eq!(extract_title(""), "Imported Document");
    }

    #[test]
    fn split_headers_produces_one_chunk_per_section() {
        let body = "# One\nfirst\n## Two\nsecond\n## Three\nthird";
        let chunks = split_headers(body, 512);
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn import_writes_document_and_chunk_rows() {
        let store = Store::open_in_memory().await.unwrap();
        let chunker = Chunker::new(store.clone());
        let c = ctx();
        let embedder = create_embedder("mock");

        let body = "# One\nfirst section\n## Two\nsecond section\n## Three\nthird section";
        let options = ImportOptions { auto_link: false, ..Default::default() };
        let document_id =
            chunker.import(body, None, Default::default(), &options, embedder.as_ref(), &c).await.unwrap();

        let document = store.get_document(document_id).await.unwrap().unwrap();
        assert_eq!(document.version, 1);
        let chunks = store.chunks_of_document(document_id).await.unwrap();
        assert_eq!(chunks.len(), 3);
        for pair in chunks.windows(2) {
            assert!(pair[1].offset > pair[0].offset);
        }

        // auto_link was disabled: no semantic edges should have been scored
        // for any chunk (parent-child and sequential edges are separate,
        // always-on mechanisms and are unaffected).
        for chunk_row in &chunks {
            let edges = store.edges_of(chunk_row.node_id).await.unwrap();
            assert!(edges.iter().all(|e| e.edge_type != crate::model::EdgeType::Semantic));
        }
    }

    #[tokio::test]
    async fn auto_link_true_scores_semantic_edges_between_chunks() {
        let store = Store::open_in_memory().await.unwrap();
        let chunker = Chunker::new(store.clone());
        let mut c = ctx();
        c.semantic_threshold = 0.0; // trivially reachable
        let embedder = create_embedder("mock");

        let body = "# One\nfirst section\n## Two\nsecond section";
        let options = ImportOptions { auto_link: true, link_sequential: false, create_parent: false, ..Default::default() };
        let document_id =
            chunker.import(body, None, Default::default(), &options, embedder.as_ref(), &c).await.unwrap();

        let chunks = store.chunks_of_document(document_id).await.unwrap();
        let mut saw_semantic_edge = false;
        for chunk_row in &chunks {
            let edges = store.edges_of(chunk_row.node_id).await.unwrap();
            saw_semantic_edge |= edges.iter().any(|e| e.edge_type == crate::model::EdgeType::Semantic);
        }
        assert!(saw_semantic_edge);
    }
}
