//! Command-line shell over forest-core: capture, import, link, search, and
//! administer a local knowledge graph. Mirrors the teacher's `main.rs`
//! shape — a `clap` derive `Cli`/`Commands`, `tracing_subscriber` set up
//! from `RUST_LOG`, and each subcommand mapping straight onto a core
//! operation rather than reimplementing logic here.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use forest_core::{ChunkStrategy, Config, Forest, ImportOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forest", version, about = "Local-first, graph-native knowledge base")]
struct Cli {
    /// Override the database file path (else FOREST_DB_PATH / platform default).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a short note.
    Capture {
        title: String,
        body: String,
    },
    /// Import a long document, chunking it per the configured strategy.
    Import {
        path: PathBuf,
        #[arg(long, value_enum, default_value = "hybrid")]
        strategy: CliChunkStrategy,
        #[arg(long, default_value_t = 512)]
        max_tokens: u32,
    },
    /// Explicitly link two nodes by reference.
    Link {
        a: String,
        b: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Semantic search over captured nodes.
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show the neighborhood of a node.
    Neighborhood {
        node: String,
        #[arg(long, default_value_t = 1)]
        depth: u32,
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// Undo the most recent edge transition between two nodes.
    Undo {
        a: String,
        b: String,
    },
    /// Restore a node to an earlier history version.
    Restore {
        node: String,
        version: i64,
    },
    /// Recompute tag IDF and relink every node against current thresholds.
    Rescore,
}

#[derive(Clone, clap::ValueEnum)]
enum CliChunkStrategy {
    Headers,
    Size,
    Hybrid,
}

impl From<CliChunkStrategy> for ChunkStrategy {
    fn from(value: CliChunkStrategy) -> Self {
        match value {
            CliChunkStrategy::Headers => ChunkStrategy::Headers,
            CliChunkStrategy::Size => ChunkStrategy::Size,
            CliChunkStrategy::Hybrid => ChunkStrategy::Hybrid,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let forest = Forest::open(&config.db_path, &config).await?;

    match cli.command {
        Commands::Capture { title, body } => {
            let node = forest.capture(&title, &body, &config).await?;
            println!("captured {} ({} tag(s))", forest_core::id::hex(node.id), node.tags.len());
        }
        Commands::Import { path, strategy, max_tokens } => {
            let body = tokio::fs::read_to_string(&path).await?;
            let options = ImportOptions { chunk_strategy: strategy.into(), max_tokens, ..Default::default() };
            let ctx = forest.linking_context(&config).await?;
            let document_id = forest
                .chunker
                .import(&body, None, BTreeSet::new(), &options, forest.embedder.as_ref(), &ctx)
                .await?;
            println!("imported document {}", forest_core::id::hex(document_id));
        }
        Commands::Link { a, b, name } => {
            let idx = forest.store.load_id_index().await?;
            let a_id = forest_core::resolve_ref(&a, &forest.store, &idx).await?;
            let b_id = forest_core::resolve_ref(&b, &forest.store, &idx).await?;
            let a_node = forest.store.get_node(a_id).await?.expect("resolved id exists");
            let b_node = forest.store.get_node(b_id).await?.expect("resolved id exists");
            let ctx = forest.linking_context(&config).await?;
            let edge = forest.linker.link(a_node, b_node, name.as_deref(), &ctx).await?;
            println!("linked, fused score {:.3}", edge.score);
        }
        Commands::Search { query, limit } => {
            let hits = forest.query.semantic_search(&query, forest.embedder.as_ref(), limit, 0).await?;
            for hit in hits {
                println!("{:.3}  {}", hit.score, forest_core::id::hex(hit.node_id));
            }
        }
        Commands::Neighborhood { node, depth, limit } => {
            let idx = forest.store.load_id_index().await?;
            let id = forest_core::resolve_ref(&node, &forest.store, &idx).await?;
            let result = forest.query.neighborhood(id, depth, limit).await?;
            for n in &result.nodes {
                println!("{}  {}", forest_core::id::hex(n.id), n.title);
            }
        }
        Commands::Undo { a, b } => {
            let idx = forest.store.load_id_index().await?;
            let a_id = forest_core::resolve_ref(&a, &forest.store, &idx).await?;
            let b_id = forest_core::resolve_ref(&b, &forest.store, &idx).await?;
            forest.history.undo_last(a_id, b_id).await?;
            println!("undone");
        }
        Commands::Restore { node, version } => {
            let idx = forest.store.load_id_index().await?;
            let id = forest_core::resolve_ref(&node, &forest.store, &idx).await?;
            let restored = forest.history.restore(id, version).await?;
            println!("restored {} to version {}", forest_core::id::hex(restored.id), version);
        }
        Commands::Rescore => {
            forest.tag_idf.rebuild().await?;
            let ctx = forest.linking_context(&config).await?;
            let ids = forest.store.all_node_ids().await?;
            for id in ids {
                if let Some(node) = forest.store.get_node(id).await? {
                    forest.linker.relink(&node, &ctx).await?;
                }
            }
            println!("rescored graph");
        }
    }

    Ok(())
}
