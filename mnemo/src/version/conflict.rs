//! Value-overlap conflict detection between an incoming fact and the
//! stored versions of its concept.
//!
//! The matcher is token-set Jaccard over lowercased alphanumeric tokens:
//! cheap, symmetric, and usable for blocks that were admitted without a
//! summary vector.

use std::collections::HashSet;

use serde_derive::{Deserialize, Serialize};

use crate::block::BlockId;

/// Overlap at or above which two values are the same claim.
pub const DUPLICATE_OVERLAP: f64 = 0.9;

/// Overlap at or above which the new value reads as a revision.
pub const UPDATE_OVERLAP: f64 = 0.5;

/// Overlap at or above which the values share a subject but diverge.
pub const CONTRADICTION_OVERLAP: f64 = 0.25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    Contradiction,
    Update,
    Duplicate,
}

/// One detected conflict against an existing node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub node_id: BlockId,
    pub kind: ConflictKind,
    pub overlap: f64,
}

/// Token-set Jaccard similarity of two values.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - intersection;
    intersection as f64 / union as f64
}

/// Maps an overlap score to a conflict kind, if it crosses a threshold.
pub fn classify(overlap: f64) -> Option<ConflictKind> {
    if overlap >= DUPLICATE_OVERLAP {
        Some(ConflictKind::Duplicate)
    } else if overlap >= UPDATE_OVERLAP {
        Some(ConflictKind::Update)
    } else if overlap >= CONTRADICTION_OVERLAP {
        Some(ConflictKind::Contradiction)
    } else {
        None
    }
}

fn tokens(value: &str) -> HashSet<String> {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_values_are_duplicates() {
        let overlap = jaccard("the sky is blue", "The sky is BLUE");
        assert!(overlap >= DUPLICATE_OVERLAP);
        assert_eq!(classify(overlap), Some(ConflictKind::Duplicate));
    }

    #[test]
    fn revisions_are_updates() {
        let overlap = jaccard("the sky is blue today", "the sky is gray today");
        assert!(overlap >= UPDATE_OVERLAP && overlap < DUPLICATE_OVERLAP);
        assert_eq!(classify(overlap), Some(ConflictKind::Update));
    }

    #[test]
    fn diverging_claims_are_contradictions() {
        // One shared token of three: overlap 1/3.
        let overlap = jaccard("sky blue", "sky red");
        assert!(overlap >= CONTRADICTION_OVERLAP && overlap < UPDATE_OVERLAP);
        assert_eq!(classify(overlap), Some(ConflictKind::Contradiction));
    }

    #[test]
    fn unrelated_values_do_not_conflict() {
        let overlap = jaccard("the sky is blue", "rust has ownership");
        assert_eq!(classify(overlap), None);
    }

    #[test]
    fn empty_values_never_conflict() {
        assert_eq!(jaccard("", ""), 0.0);
        assert_eq!(jaccard("a", ""), 0.0);
    }
}
