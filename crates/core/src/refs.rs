//! Boundary reference resolution (spec §6): callers may address a node by
//! a full or abbreviated hex id, a recency reference (`@`, `@1`, `@2`, …),
//! a tag reference (`#tag`), or a quoted title substring. All hex matching
//! is case-insensitive.

use uuid::Uuid;

use crate::error::{ForestError, Result};
use crate::id::{IdIndex, MIN_PREFIX_LEN};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    Id(String),
    Recency(u32),
    Tag(String),
    TitleSubstring(String),
}

/// Parse the raw reference text into a [`NodeRef`] without touching the
/// store; resolution against live data happens in [`resolve`].
pub fn parse(raw: &str) -> NodeRef {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('@') {
        let n: u32 = if rest.is_empty() { 0 } else { rest.parse().unwrap_or(0) };
        return NodeRef::Recency(n);
    }
    if let Some(tag) = trimmed.strip_prefix('#') {
        return NodeRef::Tag(tag.to_lowercase());
    }
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        return NodeRef::TitleSubstring(trimmed[1..trimmed.len() - 1].to_string());
    }
    NodeRef::Id(trimmed.to_lowercase())
}

/// Resolve a reference against the store, consulting `id_index` for hex
/// prefix lookups so no `LIKE` scan is ever issued.
pub async fn resolve(raw: &str, store: &Store, id_index: &IdIndex) -> Result<Uuid> {
    match parse(raw) {
        NodeRef::Id(hex) => resolve_hex(&hex, id_index),
        NodeRef::Recency(n) => resolve_recency(n, store).await,
        NodeRef::Tag(tag) => resolve_tag(&tag, store).await,
        NodeRef::TitleSubstring(substring) => resolve_title_substring(&substring, store).await,
    }
}

fn resolve_hex(hex: &str, id_index: &IdIndex) -> Result<Uuid> {
    let stripped: String = hex.chars().filter(|c| *c != '-').collect();
    if stripped.len() < MIN_PREFIX_LEN {
        return Err(ForestError::invalid(format!(
            "id prefix '{hex}' is shorter than the minimum of {MIN_PREFIX_LEN} hex characters"
        )));
    }
    match id_index.resolve(&stripped) {
        Ok(Some(id)) => Ok(id),
        Ok(None) => Err(ForestError::not_found(format!("no node matches id prefix '{hex}'"))),
        Err(candidates) => Err(ForestError::AmbiguousReference { prefix: hex.to_string(), candidates }),
    }
}

/// `@` is the most recently updated node, `@1` the next most recent, etc.
async fn resolve_recency(n: u32, store: &Store) -> Result<Uuid> {
    let mut ids = store.all_node_ids().await?;
    let mut nodes = Vec::with_capacity(ids.len());
    for id in ids.drain(..) {
        if let Some(node) = store.get_node(id).await? {
            nodes.push(node);
        }
    }
    nodes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    nodes
        .get(n as usize)
        .map(|n| n.id)
        .ok_or_else(|| ForestError::not_found(format!("no node at recency offset @{n}")))
}

/// Most recently updated node carrying `tag`.
async fn resolve_tag(tag: &str, store: &Store) -> Result<Uuid> {
    let ids = store.all_node_ids().await?;
    let mut best: Option<(Uuid, chrono::DateTime<chrono::Utc>)> = None;
    for id in ids {
        if let Some(node) = store.get_node(id).await? {
            if node.tags.contains(tag) && best.as_ref().map_or(true, |(_, ts)| node.updated_at > *ts) {
                best = Some((node.id, node.updated_at));
            }
        }
    }
    best.map(|(id, _)| id).ok_or_else(|| ForestError::not_found(format!("no node tagged '#{tag}'")))
}

async fn resolve_title_substring(substring: &str, store: &Store) -> Result<Uuid> {
    let needle = substring.to_lowercase();
    let ids = store.all_node_ids().await?;
    let mut matches = Vec::new();
    for id in ids {
        if let Some(node) = store.get_node(id).await? {
            if node.title.to_lowercase().contains(&needle) {
                matches.push(node.id);
            }
        }
    }
    match matches.len() {
        0 => Err(ForestError::not_found(format!("no node with title containing \"{substring}\""))),
        1 => Ok(matches[0]),
        _ => Err(ForestError::AmbiguousReference { prefix: format!("\"{substring}\""), candidates: matches }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognizes_each_form() {
        assert_eq!(parse("@"), NodeRef::Recency(0));
        assert_eq!(parse("@2"), NodeRef::Recency(2));
        assert_eq!(parse("#rust"), NodeRef::Tag("rust".to_string()));
        assert_eq!(parse("\"My Title\""), NodeRef::TitleSubstring("My Title".to_string()));
        assert_eq!(parse("abcd1234"), NodeRef::Id("abcd1234".to_string()));
    }

    #[tokio::test]
    async fn resolve_hex_rejects_short_prefix() {
        let store = Store::open_in_memory().await.unwrap();
        let idx = store.load_id_index().await.unwrap();
        let err = resolve("abc", &store, &idx).await.unwrap_err();
        assert!(matches!(err, ForestError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn resolve_tag_picks_most_recently_updated() {
        use crate::model::Node;
        use std::collections::BTreeSet;

        let store = Store::open_in_memory().await.unwrap();
        let mut a = Node::new("A", "a");
        a.tags = BTreeSet::from(["rust".to_string()]);
        store.insert_node(&a).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        let mut b = Node::new("B", "b");
        b.tags = BTreeSet::from(["rust".to_string()]);
        store.insert_node(&b).await.unwrap();

        let idx = store.load_id_index().await.unwrap();
        let resolved = resolve("#rust", &store, &idx).await.unwrap();
        assert_eq!(resolved, b.id);
    }
}
