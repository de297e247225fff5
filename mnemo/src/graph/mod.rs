//! The correlation graph: weighted undirected edges over blocks,
//! reinforced on co-retrieval and decayed over time.
//!
//! The graph is an arena of per-block metadata records addressed through a
//! `BlockId → index` map. Neighbor lists store ids, never references, so
//! the naturally cyclic structure stays trivially serializable and
//! eviction is a retain. Every undirected edge is mirrored on both
//! endpoints with identical weight/count/step fields.
//!
//! Per-block state is bounded: at most `max_edges` neighbors (weakest
//! evicted first) and `max_snapshots` summary snapshots (oldest evicted
//! first). The bounds are the lifetime; nothing here refcounts.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_derive::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::config::MemoryConfig;
use crate::error::{Error, MResult};

/// Patch reasons are clamped like concept keys.
const MAX_REASON_BYTES: usize = 63;

/// One directed half of an undirected correlation edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEdge {
    pub peer: BlockId,
    /// Strength in `[0, 1]`.
    pub weight: f32,
    /// Lifetime co-retrieval count.
    pub count: u64,
    /// Step of the last reinforcement.
    pub last_step: u64,
}

/// A versioned summary snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummarySnapshot {
    pub version: u32,
    pub step: u64,
    pub reason: String,
    pub vector: Vec<f32>,
}

/// Per-block graph-side metadata.
#[derive(Clone, Debug)]
pub struct BlockMeta {
    pub id: BlockId,
    snapshots: VecDeque<SummarySnapshot>,
    neighbors: Vec<CorrelationEdge>,
    /// Cumulative Euclidean drift across applied patches.
    pub drift: f32,
    pub is_stable: bool,
    last_patch_step: u64,
    next_version: u32,
}

impl BlockMeta {
    /// Latest snapshot taken at or before `step`; falls back to the oldest
    /// retained one.
    fn snapshot_at(&self, step: u64) -> Option<&SummarySnapshot> {
        self.snapshots.iter().rev().find(|s| s.step <= step).or_else(|| self.snapshots.front())
    }

    fn current(&self) -> Option<&SummarySnapshot> {
        self.snapshots.back()
    }
}

/// Aggregate graph counters for the stats surface.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub blocks: usize,
    pub edges: usize,
    pub stable_blocks: usize,
    pub snapshots: usize,
}

pub struct CorrelationGraph {
    arena: Vec<BlockMeta>,
    index: HashMap<BlockId, usize>,
    max_edges: usize,
    max_snapshots: usize,
    boost: f32,
    decay: f32,
    prune_epsilon: f32,
    patch_weight_min: f32,
    drift_max: f32,
    stability_threshold: f32,
}

impl CorrelationGraph {
    pub fn new(config: &MemoryConfig) -> Self {
        CorrelationGraph {
            arena: Vec::new(),
            index: HashMap::new(),
            max_edges: config.max_edges,
            max_snapshots: config.max_snapshots,
            boost: config.co_retrieval_boost,
            decay: config.edge_decay,
            prune_epsilon: config.edge_prune_epsilon,
            patch_weight_min: config.patch_weight_min,
            drift_max: config.drift_max,
            stability_threshold: config.stability_threshold,
        }
    }

    /// Registers a block with its initial summary (version 0 snapshot, no
    /// edges) and returns the arena index. A block may not be registered
    /// twice.
    pub fn register_block(&mut self, id: BlockId, initial_summary: Vec<f32>) -> MResult<usize> {
        if self.index.contains_key(&id) {
            return Err(Error::Value(format!("block {} already in graph", id)));
        }
        let mut snapshots = VecDeque::with_capacity(self.max_snapshots);
        snapshots.push_back(SummarySnapshot {
            version: 0,
            step: 0,
            reason: "initial".to_string(),
            vector: initial_summary,
        });
        let idx = self.arena.len();
        self.arena.push(BlockMeta {
            id,
            snapshots,
            neighbors: Vec::new(),
            drift: 0.0,
            is_stable: false,
            last_patch_step: 0,
            next_version: 1,
        });
        self.index.insert(id, idx);
        Ok(idx)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.index.contains_key(&id)
    }

    fn meta(&self, id: BlockId) -> Option<&BlockMeta> {
        self.index.get(&id).map(|&i| &self.arena[i])
    }

    fn meta_mut(&mut self, id: BlockId) -> Option<&mut BlockMeta> {
        let i = *self.index.get(&id)?;
        Some(&mut self.arena[i])
    }

    /// Reinforces every unordered pair in `ids`. Unregistered ids and
    /// self-pairs are skipped silently.
    pub fn record_co_retrieval(&mut self, ids: &[BlockId], step: u64) {
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (a, b) = (ids[i], ids[j]);
                if a == b || !self.contains(a) || !self.contains(b) {
                    continue;
                }
                self.ensure_edge(a, b);
                self.reinforce_half(a, b, step);
                self.reinforce_half(b, a, step);
            }
        }
    }

    fn reinforce_half(&mut self, from: BlockId, to: BlockId, step: u64) {
        let boost = self.boost;
        let meta = self.meta_mut(from).expect("registered endpoint");
        if let Some(edge) = meta.neighbors.iter_mut().find(|e| e.peer == to) {
            edge.weight = (edge.weight + boost).min(1.0);
            edge.count += 1;
            edge.last_step = step;
        }
    }

    /// Makes sure an `a`/`b` edge exists on both endpoints, evicting the
    /// weakest edge (oldest `last_step` on ties) at capacity.
    fn ensure_edge(&mut self, a: BlockId, b: BlockId) {
        if self.meta(a).map(|m| m.neighbors.iter().any(|e| e.peer == b)).unwrap_or(false) {
            return;
        }
        self.make_room(a);
        self.make_room(b);
        let half = |peer| CorrelationEdge { peer, weight: 0.0, count: 0, last_step: 0 };
        self.meta_mut(a).expect("endpoint a").neighbors.push(half(b));
        self.meta_mut(b).expect("endpoint b").neighbors.push(half(a));
    }

    fn make_room(&mut self, id: BlockId) {
        let max_edges = self.max_edges;
        let evict = {
            let meta = self.meta(id).expect("registered endpoint");
            if meta.neighbors.len() < max_edges {
                return;
            }
            meta.neighbors
                .iter()
                .min_by(|x, y| {
                    x.weight
                        .partial_cmp(&y.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(x.last_step.cmp(&y.last_step))
                })
                .map(|e| e.peer)
                .expect("non-empty neighbor list")
        };
        self.remove_edge(id, evict);
    }

    fn remove_edge(&mut self, a: BlockId, b: BlockId) {
        if let Some(meta) = self.meta_mut(a) {
            meta.neighbors.retain(|e| e.peer != b);
        }
        if let Some(meta) = self.meta_mut(b) {
            meta.neighbors.retain(|e| e.peer != a);
        }
    }

    /// One decay pass over every edge. Edges falling below the prune
    /// epsilon are removed from both endpoints.
    pub fn decay_edges(&mut self) {
        let decay = self.decay;
        let epsilon = self.prune_epsilon;
        for meta in &mut self.arena {
            for edge in &mut meta.neighbors {
                edge.weight *= decay;
            }
            meta.neighbors.retain(|e| e.weight >= epsilon);
        }
    }

    pub fn neighbors(&self, id: BlockId) -> &[CorrelationEdge] {
        self.meta(id).map(|m| m.neighbors.as_slice()).unwrap_or(&[])
    }

    /// The block's current summary snapshot.
    pub fn current_summary(&self, id: BlockId) -> Option<&[f32]> {
        self.meta(id)?.current().map(|s| s.vector.as_slice())
    }

    pub fn snapshots(&self, id: BlockId) -> impl Iterator<Item = &SummarySnapshot> {
        self.meta(id).into_iter().flat_map(|m| m.snapshots.iter())
    }

    /// Whether the weighted drift of strong neighbors since this block's
    /// last patch crosses the patch threshold.
    pub fn should_patch(&self, id: BlockId) -> bool {
        let meta = match self.meta(id) {
            Some(meta) => meta,
            None => return false,
        };
        if meta.is_stable {
            return false;
        }
        let mut weighted_drift = 0.0f32;
        for edge in &meta.neighbors {
            if edge.weight < self.patch_weight_min {
                continue;
            }
            let peer = match self.meta(edge.peer) {
                Some(peer) => peer,
                None => continue,
            };
            let (then, now) = match (peer.snapshot_at(meta.last_patch_step), peer.current()) {
                (Some(then), Some(now)) => (then, now),
                _ => continue,
            };
            weighted_drift += edge.weight * euclidean(&then.vector, &now.vector);
        }
        weighted_drift > self.drift_max
    }

    /// `(original + Σ wᵢ·nᵢ) / (1 + Σ wᵢ)` over strong neighbors' current
    /// snapshots.
    pub fn compute_patch(&self, id: BlockId) -> Option<Vec<f32>> {
        let meta = self.meta(id)?;
        let original = &meta.current()?.vector;
        let mut patched = original.clone();
        let mut weight_sum = 0.0f32;
        for edge in &meta.neighbors {
            if edge.weight < self.patch_weight_min {
                continue;
            }
            let neighbor = self.meta(edge.peer).and_then(|m| m.current());
            if let Some(snapshot) = neighbor {
                if snapshot.vector.len() == patched.len() {
                    for (acc, v) in patched.iter_mut().zip(&snapshot.vector) {
                        *acc += edge.weight * v;
                    }
                    weight_sum += edge.weight;
                }
            }
        }
        for v in &mut patched {
            *v /= 1.0 + weight_sum;
        }
        Some(patched)
    }

    /// Appends a new summary snapshot. Stable blocks refuse non-forced
    /// patches; returns whether the patch was applied.
    pub fn apply_patch(
        &mut self,
        id: BlockId,
        summary: Vec<f32>,
        reason: &str,
        step: u64,
        forced: bool,
    ) -> MResult<bool> {
        let max_snapshots = self.max_snapshots;
        let stability_threshold = self.stability_threshold;
        let meta = self
            .meta_mut(id)
            .ok_or_else(|| Error::Value(format!("block {} not in graph", id)))?;
        if meta.is_stable && !forced {
            return Ok(false);
        }

        let step_drift =
            meta.current().map(|s| euclidean(&s.vector, &summary)).unwrap_or(0.0);
        let mut reason = reason.to_string();
        reason.truncate(floor_char_boundary(&reason, MAX_REASON_BYTES));

        meta.snapshots.push_back(SummarySnapshot {
            version: meta.next_version,
            step,
            reason,
            vector: summary,
        });
        meta.next_version += 1;
        while meta.snapshots.len() > max_snapshots {
            meta.snapshots.pop_front();
        }
        meta.drift += step_drift;
        meta.last_patch_step = step;
        meta.is_stable = window_is_stable(meta, max_snapshots, stability_threshold);
        Ok(true)
    }

    /// Depth-1 BFS over edges at or above `min_correlation`, seeds first,
    /// expansions in descending edge weight, capped at `cap` unique ids.
    pub fn expand_retrieval_set(
        &self,
        seeds: &[BlockId],
        min_correlation: f32,
        cap: usize,
    ) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for &seed in seeds {
            if out.len() >= cap {
                return out;
            }
            if seen.insert(seed) {
                out.push(seed);
            }
        }

        let mut frontier: Vec<&CorrelationEdge> = seeds
            .iter()
            .filter_map(|&seed| self.meta(seed))
            .flat_map(|m| m.neighbors.iter())
            .filter(|e| e.weight >= min_correlation)
            .collect();
        // Stable order: strongest edge first, ties by peer id.
        frontier.sort_by(|x, y| {
            y.weight
                .partial_cmp(&x.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(x.peer.cmp(&y.peer))
        });
        for edge in frontier {
            if out.len() >= cap {
                break;
            }
            if seen.insert(edge.peer) {
                out.push(edge.peer);
            }
        }
        out
    }

    /// Periodic sweep recomputing the stability flag for every block.
    pub fn recompute_stability(&mut self) {
        let max_snapshots = self.max_snapshots;
        let threshold = self.stability_threshold;
        for meta in &mut self.arena {
            meta.is_stable = window_is_stable(meta, max_snapshots, threshold);
        }
    }

    /// Drops every edge incident to the given (archived) blocks.
    pub fn purge_edges(&mut self, ids: &HashSet<BlockId>) {
        for meta in &mut self.arena {
            if ids.contains(&meta.id) {
                meta.neighbors.clear();
            } else {
                meta.neighbors.retain(|e| !ids.contains(&e.peer));
            }
        }
    }

    /// Reinstates a replayed edge with its persisted fields. Respects the
    /// fan-out cap like a live edge.
    pub(crate) fn restore_edge(
        &mut self,
        a: BlockId,
        b: BlockId,
        weight: f32,
        count: u64,
        last_step: u64,
    ) {
        if a == b || !self.contains(a) || !self.contains(b) {
            return;
        }
        self.ensure_edge(a, b);
        for (from, to) in [(a, b), (b, a)] {
            if let Some(meta) = self.meta_mut(from) {
                if let Some(edge) = meta.neighbors.iter_mut().find(|e| e.peer == to) {
                    edge.weight = weight.clamp(0.0, 1.0);
                    edge.count = count;
                    edge.last_step = last_step;
                }
            }
        }
    }

    /// Every undirected edge exactly once, as `(a, b, edge)` with `a < b`.
    pub fn edges(&self) -> Vec<(BlockId, BlockId, &CorrelationEdge)> {
        let mut out = Vec::new();
        for meta in &self.arena {
            for edge in &meta.neighbors {
                if meta.id < edge.peer {
                    out.push((meta.id, edge.peer, edge));
                }
            }
        }
        out
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            blocks: self.arena.len(),
            edges: self.arena.iter().map(|m| m.neighbors.len()).sum::<usize>() / 2,
            stable_blocks: self.arena.iter().filter(|m| m.is_stable).count(),
            snapshots: self.arena.iter().map(|m| m.snapshots.len()).sum(),
        }
    }
}

/// Drift accumulated across the retained snapshot window, compared to the
/// stability threshold once the window is full.
fn window_is_stable(meta: &BlockMeta, max_snapshots: usize, threshold: f32) -> bool {
    if meta.snapshots.len() < max_snapshots {
        return meta.is_stable;
    }
    let mut drift = 0.0f32;
    let mut prev: Option<&SummarySnapshot> = None;
    for snapshot in &meta.snapshots {
        if let Some(prev) = prev {
            drift += euclidean(&prev.vector, &snapshot.vector);
        }
        prev = Some(snapshot);
    }
    drift < threshold
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}
