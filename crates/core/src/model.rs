//! Data model (spec §3): nodes, edges, and the derived/auxiliary records that
//! back tag IDF, documents, chunk mappings, and the history/event logs.
//!
//! Field names mirror the original product's wire schema (`camelCase` via
//! `serde(rename_all)`), the same convention the teacher's own record types
//! use for on-disk/over-the-wire compatibility.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub tags: BTreeSet<String>,
    pub token_counts: BTreeMap<String, u32>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_chunk: bool,
    pub parent_document_id: Option<Uuid>,
    pub chunk_order: Option<u32>,
    pub metadata: Option<Metadata>,
    pub accepted_degree: u32,
    pub approximate_scored: bool,
}

impl Node {
    /// A fresh node with no peers yet, as produced by capture or import
    /// before the Linker has scanned the graph for it.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            body: body.into(),
            tags: BTreeSet::new(),
            token_counts: BTreeMap::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
            is_chunk: false,
            parent_document_id: None,
            chunk_order: None,
            metadata: None,
            accepted_degree: 0,
            approximate_scored: true,
        }
    }
}

/// Provenance record carried on nodes created by import or by an external
/// collaborator (e.g. an LLM-backed tagger/writer).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_nodes: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Extension point for scoring-component breakdowns and import
    /// bookkeeping (chunk strategy, backfill markers, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Accepted,
}

/// Serializes as its plain string form (`"semantic"`, `"parent-child"`, or
/// the raw custom value) rather than as a tagged enum, since `Custom`'s
/// payload must round-trip through the exact same wire representation as
/// the well-known variants. A derive can't express that without the derive
/// unsupported `untagged` attribute on a single variant, so (de)serialize by
/// hand through [`EdgeType::as_str`] / [`EdgeType::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeType {
    Semantic,
    ParentChild,
    Sequential,
    Manual,
    /// Any user-supplied edge type string not among the well-known values.
    Custom(String),
}

impl EdgeType {
    pub fn as_str(&self) -> &str {
        match self {
            EdgeType::Semantic => "semantic",
            EdgeType::ParentChild => "parent-child",
            EdgeType::Sequential => "sequential",
            EdgeType::Manual => "manual",
            EdgeType::Custom(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "semantic" => EdgeType::Semantic,
            "parent-child" => EdgeType::ParentChild,
            "sequential" => EdgeType::Sequential,
            "manual" => EdgeType::Manual,
            other => EdgeType::Custom(other.to_string()),
        }
    }
}

impl Serialize for EdgeType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EdgeType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(EdgeType::parse(&s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub score: f64,
    pub semantic_score: Option<f64>,
    pub tag_score: Option<f64>,
    pub shared_tags: Vec<String>,
    pub status: EdgeStatus,
    pub edge_type: EdgeType,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Edge {
    /// Canonical orientation: `source_id < target_id` lexicographically.
    pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

// ---------------------------------------------------------------------------
// NodeTag / TagIdf
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeTag {
    pub node_id: Uuid,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagIdf {
    pub tag: String,
    pub doc_freq: u64,
    pub idf: f64,
}

// ---------------------------------------------------------------------------
// Document / DocumentChunk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub metadata: Option<DocumentMetadata>,
    pub version: i64,
    pub root_node_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_link: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_parent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_sequential: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_edited_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    pub document_id: Uuid,
    pub segment_id: String,
    pub node_id: Uuid,
    pub offset: i64,
    pub length: i64,
    pub chunk_order: i64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// EdgeEvent / NodeHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeEvent {
    pub id: i64,
    pub edge_id: Option<Uuid>,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub prev_status: Option<String>,
    pub next_status: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub undone: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOp {
    Create,
    Update,
    Restore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHistory {
    pub node_id: Uuid,
    pub version: i64,
    pub title: String,
    pub body: String,
    pub tags: BTreeSet<String>,
    pub token_counts: BTreeMap<String, u32>,
    pub metadata: Option<Metadata>,
    pub operation: HistoryOp,
    pub restored_from_version: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_pair_orders_lexicographically() {
        let a = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let b = Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap();
        assert_eq!(Edge::canonical_pair(b, a), (a, b));
        assert_eq!(Edge::canonical_pair(a, b), (a, b));
    }

    #[test]
    fn edge_type_round_trips_custom_values() {
        assert_eq!(EdgeType::parse("semantic"), EdgeType::Semantic);
        assert_eq!(EdgeType::parse("parent-child"), EdgeType::ParentChild);
        assert_eq!(EdgeType::parse("reference"), EdgeType::Custom("reference".into()));
        assert_eq!(EdgeType::Custom("reference".into()).as_str(), "reference");
    }
}
