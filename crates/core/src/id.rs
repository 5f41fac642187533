//! Opaque node/edge identifiers and shortest-unique-prefix resolution.
//!
//! Ids are 128-bit (`uuid::Uuid`), rendered lowercase hex with dashes per
//! spec. Abbreviations are display-only: a caller may address a node by any
//! prefix of its id (minimum 4 hex chars) and the index below resolves it to
//! the unique match, or reports the ambiguity. The index is a sorted table
//! over the undashed hex form rather than a database `LIKE` scan — this is
//! the one structure in the crate built and maintained entirely in memory.

use std::collections::BTreeSet;

use uuid::Uuid;

/// Minimum prefix length accepted for id abbreviation.
pub const MIN_PREFIX_LEN: usize = 4;

/// Maximum number of candidates reported in an ambiguity error.
pub const MAX_AMBIGUOUS_CANDIDATES: usize = 10;

/// Render an id as lowercase hex without dashes (used for prefix matching
/// and for the edge "ref" display form in spec.md §6).
pub fn hex(id: Uuid) -> String {
    id.as_simple().to_string()
}

/// A sorted prefix index over a set of ids, supporting shortest-unique-prefix
/// resolution. Maintained incrementally as nodes are inserted and removed.
#[derive(Default)]
pub struct IdIndex {
    // Sorted by hex representation; a BTreeSet gives log-n prefix range scans
    // via `range` without needing a dedicated trie.
    hexes: BTreeSet<String>,
}

impl IdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build<I: IntoIterator<Item = Uuid>>(ids: I) -> Self {
        let mut idx = Self::new();
        for id in ids {
            idx.insert(id);
        }
        idx
    }

    pub fn insert(&mut self, id: Uuid) {
        self.hexes.insert(hex(id));
    }

    pub fn remove(&mut self, id: Uuid) {
        self.hexes.remove(&hex(id));
    }

    pub fn len(&self) -> usize {
        self.hexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hexes.is_empty()
    }

    /// Resolve a case-insensitive hex prefix to the ids that match it.
    pub fn candidates(&self, prefix: &str) -> Vec<Uuid> {
        let prefix = prefix.to_ascii_lowercase();
        self.hexes
            .range(prefix.clone()..)
            .take_while(|h| h.starts_with(&prefix))
            .filter_map(|h| Uuid::parse_str(h).ok())
            .collect()
    }

    /// Resolve a prefix to exactly one id.
    ///
    /// Returns `Ok(None)` when nothing matches, `Ok(Some(id))` for a unique
    /// match, and `Err(candidates)` (capped at [`MAX_AMBIGUOUS_CANDIDATES`])
    /// when more than one id shares the prefix.
    pub fn resolve(&self, prefix: &str) -> Result<Option<Uuid>, Vec<Uuid>> {
        let matches = self.candidates(prefix);
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => Err(matches.into_iter().take(MAX_AMBIGUOUS_CANDIDATES).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_prefix_resolves() {
        let a = Uuid::parse_str("aaaaaaaa-0000-0000-0000-000000000000").unwrap();
        let b = Uuid::parse_str("bbbbbbbb-0000-0000-0000-000000000000").unwrap();
        let idx = IdIndex::build([a, b]);
        assert_eq!(idx.resolve("aaaa"), Ok(Some(a)));
        assert_eq!(idx.resolve("bbbb"), Ok(Some(b)));
    }

    #[test]
    fn ambiguous_prefix_lists_candidates() {
        let a = Uuid::parse_str("aaaa1111-0000-0000-0000-000000000000").unwrap();
        let b = Uuid::parse_str("aaaa2222-0000-0000-0000-000000000000").unwrap();
        let idx = IdIndex::build([a, b]);
        let err = idx.resolve("aaaa").unwrap_err();
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn missing_prefix_is_none() {
        let a = Uuid::parse_str("aaaaaaaa-0000-0000-0000-000000000000").unwrap();
        let idx = IdIndex::build([a]);
        assert_eq!(idx.resolve("ffff"), Ok(None));
    }

    #[test]
    fn remove_drops_from_index() {
        let a = Uuid::parse_str("aaaaaaaa-0000-0000-0000-000000000000").unwrap();
        let mut idx = IdIndex::build([a]);
        idx.remove(a);
        assert_eq!(idx.resolve("aaaa"), Ok(None));
        assert!(idx.is_empty());
    }
}
