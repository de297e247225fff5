//! Three-tier deduplication: bloom filter, exact concept-key index, LSH.
//!
//! Admission walks the tiers cheapest-first. A bloom negative is
//! conclusive. A bloom positive is confirmed against the exact index; only
//! a confirmed concept-key match refuses admission. New blocks land in all
//! three tiers (LSH only when a summary is present).

pub mod bloom;
pub mod lsh;

use std::collections::{HashMap, HashSet};

use serde_derive::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::config::MemoryConfig;
use crate::dedup::bloom::BloomFilter;
use crate::dedup::lsh::LshIndex;

/// Outcome of offering a block to the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The block is new and has been indexed.
    Admitted,
    /// A block with the same concept key already exists; nothing changed.
    Duplicate(BlockId),
}

/// Operational counters. They never affect correctness.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    pub lookups: u64,
    pub hits: u64,
    pub candidates_returned: u64,
    pub lsh_buckets: usize,
    pub lsh_entries: usize,
    /// Mean entries per non-empty LSH bucket.
    pub avg_bucket_depth: f64,
}

pub struct Deduplicator {
    bloom: BloomFilter,
    exact: HashMap<String, BlockId>,
    lsh: LshIndex,
    similarity_threshold: f32,
    lookups: u64,
    hits: u64,
    candidates_returned: u64,
}

impl Deduplicator {
    pub fn new(config: &MemoryConfig) -> Self {
        Deduplicator {
            bloom: BloomFilter::new(config.bloom_bits, config.bloom_hashes),
            exact: HashMap::new(),
            lsh: LshIndex::new(
                config.summary_dim,
                config.lsh_tables,
                config.lsh_planes,
                config.lsh_seed,
            ),
            similarity_threshold: config.similarity_threshold,
            lookups: 0,
            hits: 0,
            candidates_returned: 0,
        }
    }

    /// Offers a block for admission by concept key.
    pub fn admit(&mut self, key: &str, id: BlockId, summary: Option<&[f32]>) -> Admission {
        if key.is_empty() {
            return Admission::Admitted;
        }
        self.lookups += 1;

        // Tier 1: a bloom negative is conclusive.
        if self.bloom.maybe_contains(key) {
            // Tier 2: confirm against the exact index.
            if let Some(&existing) = self.exact.get(key) {
                self.hits += 1;
                return Admission::Duplicate(existing);
            }
        }

        self.bloom.insert(key);
        self.exact.insert(key.to_string(), id);
        if let Some(summary) = summary {
            self.lsh.insert(id, summary);
        }
        Admission::Admitted
    }

    /// Exact concept-key lookup.
    pub fn find_exact(&mut self, key: &str) -> Option<BlockId> {
        if key.is_empty() {
            return None;
        }
        self.lookups += 1;
        if !self.bloom.maybe_contains(key) {
            return None;
        }
        let found = self.exact.get(key).copied();
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    /// Approximate-nearest-neighbor search: LSH candidates re-scored by
    /// cosine similarity against `query`, descending.
    pub fn find_similar(
        &mut self,
        query: &[f32],
        summaries: impl Fn(BlockId) -> Option<Vec<f32>>,
    ) -> Vec<(BlockId, f32)> {
        if query.is_empty() {
            return Vec::new();
        }
        self.lookups += 1;
        let mut scored: Vec<(BlockId, f32)> = self
            .lsh
            .candidates(query)
            .into_iter()
            .filter_map(|id| summaries(id).map(|s| (id, cosine(query, &s))))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        self.candidates_returned += scored.len() as u64;
        if !scored.is_empty() {
            self.hits += 1;
        }
        scored
    }

    /// The best candidate at or above the similarity threshold, if any.
    pub fn semantic_duplicate(
        &mut self,
        query: &[f32],
        summaries: impl Fn(BlockId) -> Option<Vec<f32>>,
    ) -> Option<(BlockId, f32)> {
        let threshold = self.similarity_threshold;
        self.find_similar(query, summaries)
            .into_iter()
            .next()
            .filter(|(_, sim)| *sim >= threshold)
    }

    /// Replay-only: re-enters a block's summary into the LSH tables
    /// without touching the key tiers (every version of a concept keeps
    /// its bucket entries; the active-version filter hides stale ones).
    pub(crate) fn restore_block(&mut self, id: BlockId, summary: Option<&[f32]>) {
        if let Some(summary) = summary {
            self.lsh.insert(id, summary);
        }
    }

    /// Repoints a concept key at a new block (version updates). The old
    /// block's LSH entries stay; the active-version filter hides them.
    pub fn reindex(&mut self, key: &str, id: BlockId, summary: Option<&[f32]>) {
        if key.is_empty() {
            return;
        }
        self.bloom.insert(key);
        self.exact.insert(key.to_string(), id);
        if let Some(summary) = summary {
            self.lsh.insert(id, summary);
        }
    }

    /// Removes an exact-index entry. The bloom keeps its bits; LSH entries
    /// are reconciled by [`Deduplicator::purge`].
    pub fn remove(&mut self, key: &str) -> Option<BlockId> {
        self.exact.remove(key)
    }

    /// Drops archived ids from every LSH bucket.
    pub fn purge(&mut self, ids: &HashSet<BlockId>) {
        self.lsh.purge(ids);
    }

    pub fn stats(&self) -> DedupStats {
        let (lsh_buckets, lsh_entries) = self.lsh.bucket_stats();
        DedupStats {
            lookups: self.lookups,
            hits: self.hits,
            candidates_returned: self.candidates_returned,
            lsh_buckets,
            lsh_entries,
            avg_bucket_depth: if lsh_buckets == 0 {
                0.0
            } else {
                lsh_entries as f64 / lsh_buckets as f64
            },
        }
    }
}

/// Cosine similarity; a vanishing denominator yields 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let denom = a.iter().map(|x| x * x).sum::<f32>().sqrt()
        * b.iter().map(|y| y * y).sum::<f32>().sqrt();
    if denom <= 1e-8 {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MemoryConfig {
        MemoryConfig { summary_dim: 4, lsh_seed: Some(7), ..MemoryConfig::default() }
    }

    #[test]
    fn admission_is_idempotent() {
        let mut dedup = Deduplicator::new(&config());
        let summary = [1.0, 0.0, 0.0, 0.0];

        assert_eq!(dedup.admit("fact:sky_color=blue", 1, Some(&summary)), Admission::Admitted);
        assert_eq!(
            dedup.admit("fact:sky_color=blue", 2, Some(&summary)),
            Admission::Duplicate(1)
        );
        assert_eq!(
            dedup.admit("fact:sky_color=blue", 3, Some(&summary)),
            Admission::Duplicate(1)
        );
        assert_eq!(dedup.find_exact("fact:sky_color=blue"), Some(1));
    }

    #[test]
    fn distinct_keys_are_admitted() {
        let mut dedup = Deduplicator::new(&config());
        assert_eq!(dedup.admit("fact:a", 1, None), Admission::Admitted);
        assert_eq!(dedup.admit("fact:b", 2, None), Admission::Admitted);
        assert_eq!(dedup.find_exact("fact:a"), Some(1));
        assert_eq!(dedup.find_exact("fact:b"), Some(2));
        assert_eq!(dedup.find_exact("fact:c"), None);
    }

    #[test]
    fn find_similar_rescored_and_ordered() {
        let mut dedup = Deduplicator::new(&config());
        dedup.admit("a", 1, Some(&[1.0, 0.0, 0.0, 0.0]));
        dedup.admit("b", 2, Some(&[0.9, 0.1, 0.0, 0.0]));
        dedup.admit("c", 3, Some(&[0.0, 1.0, 0.0, 0.0]));

        let store: HashMap<BlockId, Vec<f32>> = [
            (1, vec![1.0, 0.0, 0.0, 0.0]),
            (2, vec![0.9, 0.1, 0.0, 0.0]),
            (3, vec![0.0, 1.0, 0.0, 0.0]),
        ]
        .into_iter()
        .collect();

        let hits = dedup.find_similar(&[1.0, 0.0, 0.0, 0.0], |id| store.get(&id).cloned());
        assert!(!hits.is_empty());
        // Descending similarity, best first.
        for pair in hits.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 > 0.999);
    }

    #[test]
    fn semantic_duplicate_respects_threshold() {
        let mut dedup = Deduplicator::new(&config());
        dedup.admit("a", 1, Some(&[1.0, 0.0, 0.0, 0.0]));
        let store = |id: BlockId| (id == 1).then(|| vec![1.0, 0.0, 0.0, 0.0]);

        assert_eq!(dedup.semantic_duplicate(&[1.0, 0.0, 0.0, 0.0], store), Some((1, 1.0)));
        assert_eq!(dedup.semantic_duplicate(&[0.0, 0.0, 1.0, 0.0], store), None);
    }

    #[test]
    fn empty_inputs_are_silent() {
        let mut dedup = Deduplicator::new(&config());
        assert_eq!(dedup.find_exact(""), None);
        assert!(dedup.find_similar(&[], |_| None).is_empty());
        let stats = dedup.stats();
        assert_eq!(stats.lookups, 0);
    }

    #[test]
    fn cosine_zero_denominator() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn stats_track_bucket_depth() {
        let mut dedup = Deduplicator::new(&config());
        dedup.admit("a", 1, Some(&[1.0, 0.0, 0.0, 0.0]));
        dedup.admit("b", 2, Some(&[1.0, 0.0, 0.0, 0.0]));
        let stats = dedup.stats();
        assert!(stats.lsh_entries >= stats.lsh_buckets);
        assert!(stats.avg_bucket_depth >= 1.0);
    }
}
