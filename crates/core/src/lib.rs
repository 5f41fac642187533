//! forest-core: the linking engine behind Forest, a local-first,
//! graph-native knowledge base. See the module docs for the data model,
//! scoring/fusion rule, linker, chunker, and query surface.

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod graphquery;
pub mod history;
pub mod id;
pub mod linker;
pub mod model;
pub mod refs;
pub mod scorer;
pub mod store;
pub mod tagidf;
pub mod tokenizer;

pub use chunker::{ChunkStrategy, Chunker, ImportOptions};
pub use config::{Config, IdfContext, LinkingContext};
pub use embedder::{create_embedder, Embedder};
pub use error::{ForestError, Result};
pub use graphquery::{ContextBundle, GraphQuery, MetadataFilter, Neighborhood, PathResult, SemanticHit, SortOrder};
pub use history::HistoryLedger;
pub use id::IdIndex;
pub use linker::Linker;
pub use model::{
    Document, DocumentChunk, DocumentMetadata, Edge, EdgeEvent, EdgeStatus, EdgeType, HistoryOp, Metadata,
    Node, NodeHistory, NodeTag, TagIdf,
};
pub use refs::{resolve as resolve_ref, NodeRef};
pub use store::Store;
pub use tagidf::TagIdfService;

use std::path::Path;

/// Wires the Store, TagIdfService, Linker, Chunker, GraphQuery, and
/// HistoryLedger together into one handle — the composition root capture
/// and import flows use, mirroring spec.md §2's composition diagram.
#[derive(Clone)]
pub struct Forest {
    pub store: Store,
    pub tag_idf: std::sync::Arc<TagIdfService>,
    pub linker: std::sync::Arc<Linker>,
    pub chunker: std::sync::Arc<Chunker>,
    pub query: std::sync::Arc<GraphQuery>,
    pub history: std::sync::Arc<HistoryLedger>,
    pub embedder: std::sync::Arc<dyn Embedder>,
}

impl Forest {
    pub async fn open(path: &Path, config: &Config) -> Result<Self> {
        let store = Store::open(path).await?;
        Self::from_store(store, config).await
    }

    pub async fn open_in_memory(config: &Config) -> Result<Self> {
        let store = Store::open_in_memory().await?;
        Self::from_store(store, config).await
    }

    async fn from_store(store: Store, config: &Config) -> Result<Self> {
        let embedder = create_embedder(&config.embed_provider);
        let tag_idf = TagIdfService::new(store.pool().clone());
        let chunker = Chunker::new(store.clone());
        chunker.backfill_missing_documents(&LinkingContext::new(config, Default::default(), embedder.clone(), chrono::Utc::now())).await?;

        Ok(Self {
            store: store.clone(),
            tag_idf: std::sync::Arc::new(tag_idf),
            linker: std::sync::Arc::new(Linker::new(store.clone())),
            chunker: std::sync::Arc::new(chunker),
            query: std::sync::Arc::new(GraphQuery::new(store.clone())),
            history: std::sync::Arc::new(HistoryLedger::new(store)),
            embedder,
        })
    }

    /// A fresh [`LinkingContext`] snapshot for one capture/import/relink
    /// pass against the current IDF state.
    pub async fn linking_context(&self, config: &Config) -> Result<LinkingContext> {
        let idf = self.tag_idf.context().await?;
        Ok(LinkingContext::new(config, idf, self.embedder.clone(), chrono::Utc::now()))
    }

    /// Capture: tokenize, tag, embed, then insert the node, sync its
    /// node_tags rows, and score/write its edges in a single transaction
    /// ([`Linker::link_new`] owns that atomic unit). The IDF cache rebuild
    /// and history record are best-effort follow-ups that never unwind the
    /// already-committed mutation — node_tags is allowed to lag ahead of a
    /// rebuilt `tag_idf` cache, and a failed event log must never prevent
    /// the primary mutation from standing.
    pub async fn capture(&self, title: &str, body: &str, config: &Config) -> Result<Node> {
        let counts = tokenizer::tokenize(body);
        let tags = tokenizer::extract_tags(body, &counts, 6);
        let embedding = self.embedder.embed(body).await.unwrap_or(None);

        let mut node = Node::new(title, body);
        node.token_counts = counts;
        node.tags = tags;
        node.embedding = embedding;
        node.approximate_scored = node.embedding.is_none();

        let ctx = self.linking_context(config).await?;
        self.linker.link_new(&node, &ctx).await?;

        if let Err(err) = self.tag_idf.rebuild().await {
            tracing::warn!(error = %err, node_id = %node.id, "tag idf rebuild failed after capture");
        }
        if let Err(err) = self.history.record(&node, HistoryOp::Create, None).await {
            tracing::warn!(error = %err, node_id = %node.id, "history record failed after capture");
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_inserts_and_links_node() {
        let mut config = Config::from_env();
        config.embed_provider = "mock".to_string();
        let forest = Forest::open_in_memory(&config).await.unwrap();

        let first = forest.capture("First", "Rust ownership basics #rust", &config).await.unwrap();
        let second = forest.capture("Second", "More Rust ownership notes #rust", &config).await.unwrap();

        assert_ne!(first.id, second.id);
        assert!(forest.store.get_node(second.id).await.unwrap().is_some());
    }
}
