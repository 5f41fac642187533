//! Process configuration (spec §6) and the [`LinkingContext`] passed through
//! every entry point that needs thresholds, IDF state, or the active
//! embedder — never read from globals, so the Linker and Scorer stay
//! deterministic and unit-testable with fixtures.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::embedder::Embedder;

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Process-wide configuration, read once at startup from the environment
/// (spec's enumerated `FOREST_*` variables).
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub embed_provider: String,
    pub embed_model: String,
    pub or_key: Option<String>,
    pub openai_key: Option<String>,
    pub semantic_threshold: f64,
    pub tag_threshold: f64,
    pub project_edge_floor: f64,
    pub project_edge_limit: u32,
}

impl Config {
    /// Resolve configuration from the environment, falling back to the
    /// platform application-data directory for the database path when
    /// `FOREST_DB_PATH` is unset.
    pub fn from_env() -> Self {
        let db_path = env::var("FOREST_DB_PATH").map(PathBuf::from).unwrap_or_else(|_| {
            default_data_dir().join("com.ettio.forest.desktop").join("forest.db")
        });

        let embed_provider = env::var("FOREST_EMBED_PROVIDER").unwrap_or_else(|_| "openrouter".into());
        let embed_model = env::var("FOREST_EMBED_MODEL").unwrap_or_else(|_| default_model_for(&embed_provider));

        Self {
            db_path,
            embed_provider,
            embed_model,
            or_key: env::var("FOREST_OR_KEY").ok(),
            openai_key: env::var("OPENAI_API_KEY").ok(),
            semantic_threshold: env_f64("FOREST_SEMANTIC_THRESHOLD", 0.5),
            tag_threshold: env_f64("FOREST_TAG_THRESHOLD", 0.3),
            project_edge_floor: env_f64("FOREST_PROJECT_EDGE_FLOOR", 0.3).clamp(0.0, 1.0),
            project_edge_limit: env_u32("FOREST_PROJECT_EDGE_LIMIT", 10).max(1),
        }
    }
}

fn default_model_for(provider: &str) -> String {
    match provider {
        "openai" => "text-embedding-3-small".into(),
        "mock" => "hashed-384".into(),
        _ => "qwen/qwen3-embedding-8b".into(),
    }
}

fn default_data_dir() -> PathBuf {
    dirs_fallback().join(".local").join("share")
}

/// Minimal `$HOME`-based fallback; the teacher pulls in a platform-dirs
/// crate only for desktop packaging concerns this crate doesn't own.
fn dirs_fallback() -> PathBuf {
    env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

/// Snapshot of IDF state handed to the Scorer for a single linking pass
/// (spec §4.3's `context()` read).
#[derive(Debug, Clone, Default)]
pub struct IdfContext {
    pub total_nodes: u64,
    pub max_idf: f64,
    pub idf_by_tag: BTreeMap<String, f64>,
}

impl IdfContext {
    pub fn idf_of(&self, tag: &str) -> f64 {
        self.idf_by_tag.get(tag).copied().unwrap_or(0.0)
    }
}

/// Everything the Linker and Scorer need for one consistent pass: acceptance
/// thresholds, a single IDF snapshot, the active embedder, and the instant
/// used to timestamp writes (fixed per pass so fixtures are reproducible).
#[derive(Clone)]
pub struct LinkingContext {
    pub idf: IdfContext,
    pub semantic_threshold: f64,
    pub tag_threshold: f64,
    pub project_floor: f64,
    pub project_cap: u32,
    pub embedder: Arc<dyn Embedder>,
    pub now: DateTime<Utc>,
}

impl LinkingContext {
    pub fn new(config: &Config, idf: IdfContext, embedder: Arc<dyn Embedder>, now: DateTime<Utc>) -> Self {
        Self {
            idf,
            semantic_threshold: config.semantic_threshold,
            tag_threshold: config.tag_threshold,
            project_floor: config.project_edge_floor,
            project_cap: config.project_edge_limit,
            embedder,
            now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_matches_provider() {
        assert_eq!(default_model_for("openai"), "text-embedding-3-small");
        assert_eq!(default_model_for("mock"), "hashed-384");
        assert_eq!(default_model_for("openrouter"), "qwen/qwen3-embedding-8b");
    }

    #[test]
    fn idf_context_missing_tag_is_zero() {
        let ctx = IdfContext::default();
        assert_eq!(ctx.idf_of("missing"), 0.0);
    }
}
