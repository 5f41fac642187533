//! Scorer (spec §4.4): pure functional computation of edge scores between
//! two node records. No I/O, no mutable state — takes an [`IdfContext`]
//! snapshot and returns plain values, so linking passes are reproducible
//! from fixtures alone.

use std::collections::BTreeSet;

use crate::config::IdfContext;

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// `clamp01(cosine(a, b))`, or `None` if either vector is absent. Zero
/// magnitude on either side scores 0 rather than dividing by zero.
pub fn semantic_score(a: Option<&[f32]>, b: Option<&[f32]>) -> Option<f64> {
    let (a, b) = (a?, b?);
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| *x as f64 * *x as f64).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| *x as f64 * *x as f64).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some(clamp01(dot / (norm_a * norm_b)))
}

#[derive(Debug, Clone, Default)]
pub struct TagScoreComponents {
    pub jaccard: f64,
    pub avg_idf: f64,
    pub max_idf: f64,
    pub normalized_idf: f64,
    pub avg_bridge_idf: Option<f64>,
    pub bridge_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TagScoreResult {
    pub score: f64,
    pub shared_tags: Vec<String>,
    pub components: TagScoreComponents,
}

/// IDF-weighted Jaccard over two tag sets, with a bridge bonus for
/// `link/*` tags. Returns `None` when the sets share no tags.
pub fn tag_score(a: &BTreeSet<String>, b: &BTreeSet<String>, idf: &IdfContext) -> Option<TagScoreResult> {
    let shared: BTreeSet<&String> = a.intersection(b).collect();
    if shared.is_empty() {
        return None;
    }
    let union_size = a.union(b).count();
    let jaccard = shared.len() as f64 / union_size as f64;

    let avg_idf = shared.iter().map(|t| idf.idf_of(t)).sum::<f64>() / shared.len() as f64;
    let normalized_idf = if idf.max_idf > 0.0 { avg_idf / idf.max_idf } else { 0.0 };
    let base = clamp01(jaccard * normalized_idf);

    let bridge_tags: Vec<&&String> = shared.iter().filter(|t| t.starts_with("link/")).collect();
    let (avg_bridge_idf, bridge_score) = if !bridge_tags.is_empty() && idf.max_idf > 0.0 {
        let avg = bridge_tags.iter().map(|t| idf.idf_of(t)).sum::<f64>() / bridge_tags.len() as f64;
        (Some(avg), Some(clamp01(avg / idf.max_idf)))
    } else {
        (None, None)
    };

    let score = match bridge_score {
        Some(b) => base.max(b),
        None => base,
    };

    Some(TagScoreResult {
        score,
        shared_tags: shared.into_iter().cloned().collect(),
        components: TagScoreComponents {
            jaccard,
            avg_idf,
            max_idf: idf.max_idf,
            normalized_idf,
            avg_bridge_idf,
            bridge_score,
        },
    })
}

/// `fused = clamp01(0.7*dom + 0.2*sub + 0.1*geo - 0.1*dis)` where
/// `dom = max(s,t)`, `sub = min(s,t)`, `geo = sqrt(s*t)`, `dis = |s-t|`.
pub fn fused_score(semantic: Option<f64>, tag: Option<f64>) -> f64 {
    let s = semantic.unwrap_or(0.0);
    let t = tag.unwrap_or(0.0);
    let dom = s.max(t);
    let sub = s.min(t);
    let geo = (s * t).sqrt();
    let dis = (s - t).abs();
    clamp01(0.7 * dom + 0.2 * sub + 0.1 * geo - 0.1 * dis)
}

pub const PROJECT_TAG_PREFIX: &str = "project:";

pub fn is_project_tag(tag: &str) -> bool {
    tag.starts_with(PROJECT_TAG_PREFIX)
}

/// Why a candidate was accepted — the project-tag edge cap (spec.md §9)
/// only ever truncates [`AcceptReason::ProjectFloor`] accepts; a candidate
/// that independently cleared the semantic or tag threshold keeps its edge
/// no matter how many project-tagged peers a node has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptReason {
    Threshold,
    ProjectFloor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Accepted(AcceptReason),
    Discard,
}

/// An edge is accepted iff semantic or tag score clears its threshold, or
/// the shared tags include a project tag and fused clears the project
/// floor.
pub fn classify(
    semantic: Option<f64>,
    tag: Option<f64>,
    shared_tags: &[String],
    semantic_threshold: f64,
    tag_threshold: f64,
    project_floor: f64,
) -> Classification {
    if semantic.map_or(false, |s| s >= semantic_threshold) {
        return Classification::Accepted(AcceptReason::Threshold);
    }
    if tag.map_or(false, |t| t >= tag_threshold) {
        return Classification::Accepted(AcceptReason::Threshold);
    }
    let has_project_tag = shared_tags.iter().any(|t| is_project_tag(t));
    if has_project_tag && fused_score(semantic, tag) >= project_floor {
        return Classification::Accepted(AcceptReason::ProjectFloor);
    }
    Classification::Discard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantic_score_zero_magnitude_is_zero() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 0.0];
        assert_eq!(semantic_score(Some(&a), Some(&b)), Some(0.0));
    }

    #[test]
    fn semantic_score_missing_embedding_is_none() {
        assert_eq!(semantic_score(None, Some(&[1.0])), None);
    }

    #[test]
    fn tag_score_empty_intersection_is_none() {
        let a: BTreeSet<String> = ["x".into()].into();
        let b: BTreeSet<String> = ["y".into()].into();
        assert!(tag_score(&a, &b, &IdfContext::default()).is_none());
    }

    #[test]
    fn tag_score_applies_bridge_bonus() {
        let a: BTreeSet<String> = ["link/foo".into(), "other".into()].into();
        let b: BTreeSet<String> = ["link/foo".into()].into();
        let idf = IdfContext {
            total_nodes: 10,
            max_idf: 2.0,
            idf_by_tag: [("link/foo".to_string(), 2.0), ("other".to_string(), 0.1)].into(),
        };
        let result = tag_score(&a, &b, &idf).unwrap();
        assert!(result.components.bridge_score.is_some());
        assert!(result.score >= result.components.bridge_score.unwrap() - 1e-9);
    }

    #[test]
    fn fused_score_rewards_agreement() {
        let agree = fused_score(Some(0.8), Some(0.8));
        let disagree = fused_score(Some(0.8), Some(0.1));
        assert!(agree > disagree);
    }

    #[test]
    fn classify_accepts_on_project_fallback() {
        let shared = vec!["project:forest".to_string()];
        let c = classify(Some(0.2), Some(0.1), &shared, 0.5, 0.3, 0.15);
        assert_eq!(c, Classification::Accepted(AcceptReason::ProjectFloor));
    }

    #[test]
    fn classify_accepts_on_threshold_even_with_project_tag() {
        let shared = vec!["project:forest".to_string()];
        let c = classify(Some(0.6), Some(0.1), &shared, 0.5, 0.3, 0.9);
        assert_eq!(c, Classification::Accepted(AcceptReason::Threshold));
    }

    #[test]
    fn classify_discards_below_all_thresholds() {
        let shared = vec!["misc".to_string()];
        let c = classify(Some(0.1), Some(0.1), &shared, 0.5, 0.3, 0.3);
        assert_eq!(c, Classification::Discard);
    }
}
