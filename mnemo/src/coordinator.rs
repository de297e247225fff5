//! The coordinator owns the block store and all four engines and enforces
//! the single-writer discipline: one logical writer mutates the
//! deduplicator, version chain and correlation graph; readers see a
//! consistent snapshot through [`SharedMemory`]'s coarse lock.
//!
//! Ingestion: sublimator → deduplicator → block store → version chain →
//! correlation graph. Query: LSH candidates → cosine verification → graph
//! expansion → active-version filter → rank → co-retrieval bookkeeping.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_derive::{Deserialize, Serialize};

use crate::block::{BlockId, DraftBlock, MemoryBlock};
use crate::cancel::CancelToken;
use crate::config::MemoryConfig;
use crate::dedup::{cosine, Admission, DedupStats, Deduplicator};
use crate::error::{Error, MResult};
use crate::graph::{CorrelationGraph, GraphStats};
use crate::persist::{EdgeRecord, Manifest, Store, SyncReport, VersionRecord};
use crate::sublimate::{KvStateSource, SublimateRequest, Sublimator};
use crate::version::conflict::Conflict;
use crate::version::{VersionChain, VersionNode};

/// Result of offering a block for admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inserted {
    New(BlockId),
    /// A block with the same concept key already existed; nothing changed.
    Duplicate(BlockId),
}

impl Inserted {
    pub fn id(&self) -> BlockId {
        match self {
            Inserted::New(id) | Inserted::Duplicate(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Inserted::New(_))
    }
}

/// One ranked query result.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryHit {
    pub id: BlockId,
    pub similarity: f32,
}

/// Aggregated counters across the engines.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub blocks: usize,
    pub chains: usize,
    pub versions: usize,
    pub next_block_id: BlockId,
    pub step: u64,
    pub dedup: DedupStats,
    pub graph: GraphStats,
}

pub struct MemoryCoordinator {
    config: MemoryConfig,
    blocks: BTreeMap<BlockId, MemoryBlock>,
    next_block_id: BlockId,
    /// Retrieval step counter; advanced by every query.
    step: u64,
    sublimator: Sublimator,
    dedup: Deduplicator,
    chain: VersionChain,
    graph: CorrelationGraph,
    store: Option<Store>,
}

impl MemoryCoordinator {
    /// Builds a coordinator, opening and replaying the persistent store
    /// when the config names a root.
    pub fn new(config: MemoryConfig) -> MResult<Self> {
        config.validate()?;
        let mut coordinator = MemoryCoordinator {
            sublimator: Sublimator::new(config.summary_dim),
            dedup: Deduplicator::new(&config),
            chain: VersionChain::new(),
            graph: CorrelationGraph::new(&config),
            blocks: BTreeMap::new(),
            next_block_id: 1,
            step: 0,
            store: None,
            config,
        };
        if let Some(root) = coordinator.config.storage_root.clone() {
            let store = Store::open(root)?;
            coordinator.replay(&store);
            coordinator.store = Some(store);
        }
        Ok(coordinator)
    }

    /// Rebuilds every in-memory index from the store.
    fn replay(&mut self, store: &Store) {
        let state = store.load();

        // First block seen per concept key, in case a chain never made it
        // to disk.
        let mut first_seen: BTreeMap<String, BlockId> = BTreeMap::new();

        for persisted in state.blocks {
            let summary =
                if persisted.summary.is_empty() { None } else { Some(persisted.summary.clone()) };
            self.dedup.restore_block(persisted.id, summary.as_deref());
            if let Err(err) = self.graph.register_block(persisted.id, persisted.summary) {
                log::warn!("replay: block {} skipped in graph: {}", persisted.id, err);
            }
            if !persisted.concept_key.is_empty() {
                first_seen.entry(persisted.concept_key.clone()).or_insert(persisted.id);
            }
            self.blocks.insert(
                persisted.id,
                MemoryBlock {
                    id: persisted.id,
                    keys: Vec::new(),
                    values: Vec::new(),
                    positions: Vec::new(),
                    n_tokens: 0,
                    n_embd_k: 0,
                    n_embd_v: 0,
                    summary,
                    concept_key: persisted.concept_key,
                    created_step: 0,
                },
            );
            self.next_block_id = self.next_block_id.max(persisted.id + 1);
        }

        for (record, _summary) in state.versions {
            let id = record.node_id;
            if let Err(err) = self.chain.restore_node(record.into_node()) {
                log::warn!("replay: version node {} skipped: {}", id, err);
            }
            self.next_block_id = self.next_block_id.max(id + 1);
        }

        // Key tiers point at the newest version of each concept, exactly
        // where the last live update left them.
        for (key, fallback) in first_seen {
            let id = self.chain.history(&key).last().map(|n| n.node_id).unwrap_or(fallback);
            self.dedup.reindex(&key, id, None);
        }

        for edge in state.edges {
            self.graph.restore_edge(edge.a, edge.b, edge.weight, edge.count, edge.last_step);
        }

        if let Some(manifest) = state.manifest {
            self.next_block_id = self.next_block_id.max(manifest.next_block_id);
            self.step = manifest.step;
        }
        log::info!(
            "replayed {} blocks, {} chains from {}",
            self.blocks.len(),
            self.chain.chain_count(),
            store.root().display()
        );
    }

    /// Sublimates a per-sequence KV slice and admits the result. `Ok(None)`
    /// means there was nothing usable to extract.
    pub fn sublimate_kv(
        &mut self,
        source: &dyn KvStateSource,
        request: &SublimateRequest,
    ) -> MResult<Option<Inserted>> {
        self.sublimate_kv_with_cancel(source, request, &CancelToken::new())
    }

    pub fn sublimate_kv_with_cancel(
        &mut self,
        source: &dyn KvStateSource,
        request: &SublimateRequest,
        cancel: &CancelToken,
    ) -> MResult<Option<Inserted>> {
        match self.sublimator.sublimate(source, request, cancel)? {
            None => Ok(None),
            Some(draft) => self.insert(draft).map(Some),
        }
    }

    /// Admits a draft block built outside the sublimator, forcing its
    /// summary vector.
    pub fn insert_with_summary(
        &mut self,
        mut draft: DraftBlock,
        summary: Vec<f32>,
    ) -> MResult<Inserted> {
        draft.summary = Some(summary);
        self.insert(draft)
    }

    /// The admission pipeline: dedup, block store, version chain, graph.
    pub fn insert(&mut self, draft: DraftBlock) -> MResult<Inserted> {
        if let Some(summary) = &draft.summary {
            if summary.len() != self.config.summary_dim {
                return Err(Error::InvalidInput(format!(
                    "summary has {} dims, config says {}",
                    summary.len(),
                    self.config.summary_dim
                )));
            }
        }
        let id = self.next_block_id;
        let block = draft.into_block(id, self.step);

        match self.dedup.admit(&block.concept_key, id, block.summary.as_deref()) {
            Admission::Duplicate(existing) => {
                log::info!(
                    "refusing duplicate of {:?} (block {})",
                    block.concept_key,
                    existing
                );
                return Ok(Inserted::Duplicate(existing));
            }
            Admission::Admitted => {}
        }
        if !block.concept_key.is_empty() {
            if let Err(err) = self.chain.register(id, &block.concept_key, now_secs()) {
                // Undo the dedup entry so the failed admission leaves no trace.
                self.dedup.remove(&block.concept_key);
                return Err(err);
            }
        }
        self.next_block_id += 1;
        self.graph.register_block(id, block.summary.clone().unwrap_or_default())?;
        self.blocks.insert(id, block);
        Ok(Inserted::New(id))
    }

    /// Appends a new version of an existing concept. The exact index is
    /// repointed at the new block so key lookups find the active version.
    pub fn update_concept(
        &mut self,
        draft: DraftBlock,
        reason: &str,
        confidence_delta: f32,
    ) -> MResult<BlockId> {
        let id = self.next_block_id;
        let block = draft.into_block(id, self.step);
        self.chain.update(id, &block.concept_key, reason, confidence_delta, now_secs())?;
        self.next_block_id += 1;

        self.dedup.reindex(&block.concept_key, id, block.summary.as_deref());
        self.graph.register_block(id, block.summary.clone().unwrap_or_default())?;
        self.blocks.insert(id, block);
        Ok(id)
    }

    /// Ranked approximate search over block summaries.
    ///
    /// Takes `&mut self` for co-retrieval reinforcement and stats; the
    /// engines' data structures are otherwise read-only here.
    pub fn query(&mut self, vector: &[f32], k: usize) -> Vec<QueryHit> {
        if vector.is_empty() || k == 0 {
            return Vec::new();
        }

        let graph = &self.graph;
        let blocks = &self.blocks;
        let candidates = self.dedup.find_similar(vector, |id| {
            graph
                .current_summary(id)
                .map(|s| s.to_vec())
                .or_else(|| blocks.get(&id).and_then(|b| b.summary.clone()))
        });

        let seeds: Vec<BlockId> = candidates.iter().map(|(id, _)| *id).collect();
        let expanded = self.graph.expand_retrieval_set(
            &seeds,
            self.config.expansion_min_correlation,
            (4 * k).max(k),
        );

        let mut hits: Vec<QueryHit> = expanded
            .into_iter()
            .filter(|&id| self.chain.passes_active_filter(id))
            .map(|id| QueryHit {
                id,
                similarity: self.summary_of(id).map(|s| cosine(vector, s)).unwrap_or(0.0),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);

        let step = self.step;
        let returned: Vec<BlockId> = hits.iter().map(|h| h.id).collect();
        self.graph.record_co_retrieval(&returned, step);
        self.step += 1;
        hits
    }

    /// Read-only view of a block.
    pub fn block(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.blocks.get(&id)
    }

    /// The block's current summary: its latest patched snapshot, falling
    /// back to the admission-time vector. This is the surface an on-device
    /// injection kernel pairs with.
    pub fn summary_of(&self, id: BlockId) -> Option<&[f32]> {
        self.graph
            .current_summary(id)
            .filter(|s| !s.is_empty())
            .or_else(|| self.blocks.get(&id).and_then(|b| b.summary.as_deref()))
    }

    pub fn find_exact(&mut self, concept_key: &str) -> Option<BlockId> {
        self.dedup.find_exact(concept_key)
    }

    /// Retracts the current version of a concept.
    pub fn retract(&mut self, concept_key: &str, reason: &str) -> MResult<()> {
        let id = self
            .chain
            .current(concept_key)
            .map(|n| n.node_id)
            .ok_or_else(|| Error::Value(format!("no active version for {:?}", concept_key)))?;
        self.chain.retract(id, reason)
    }

    pub fn rollback(&mut self, concept_key: &str, reason: &str) -> MResult<BlockId> {
        self.chain.rollback(concept_key, reason)
    }

    pub fn rollback_to(&mut self, concept_key: &str, version: u32, reason: &str) -> MResult<BlockId> {
        self.chain.rollback_to(concept_key, version, reason)
    }

    pub fn merge(&mut self, sources: &[BlockId], target: BlockId, reason: &str) -> MResult<()> {
        self.chain.merge(sources, target, reason)
    }

    pub fn check_conflict(&self, concept_key: &str, new_value: &str) -> Vec<Conflict> {
        self.chain.check_conflict(concept_key, new_value)
    }

    pub fn set_value(&mut self, id: BlockId, value: &str) -> MResult<()> {
        self.chain.set_value(id, value)
    }

    pub fn current(&self, concept_key: &str) -> Option<&VersionNode> {
        self.chain.current(concept_key)
    }

    pub fn history(&self, concept_key: &str) -> Vec<&VersionNode> {
        self.chain.history(concept_key)
    }

    /// One multiplicative decay pass over every correlation edge. The
    /// caller owns the cadence (e.g. every 100 retrieval rounds).
    pub fn decay_edges(&mut self) {
        self.graph.decay_edges();
    }

    /// Applies neighbor-drift patches wherever the graph asks for one.
    /// Returns the number of patches applied.
    pub fn run_patch_sweep(&mut self) -> usize {
        let ids: Vec<BlockId> = self.blocks.keys().copied().collect();
        let step = self.step;
        let mut patched = 0;
        for id in ids {
            if !self.graph.should_patch(id) {
                continue;
            }
            if let Some(summary) = self.graph.compute_patch(id) {
                match self.graph.apply_patch(id, summary, "neighbor drift", step, false) {
                    Ok(true) => patched += 1,
                    Ok(false) => {}
                    Err(err) => log::warn!("patch of block {} failed: {}", id, err),
                }
            }
        }
        patched
    }

    pub fn recompute_stability(&mut self) {
        self.graph.recompute_stability();
    }

    /// Archives superseded versions older than `max_age` seconds (at most
    /// `cap` per call), dropping their hot K/V arrays and reconciling the
    /// LSH buckets and graph edges. Ids stay valid.
    pub fn archive_old(&mut self, max_age: i64, cap: usize, cancel: &CancelToken) -> usize {
        let archived = self.chain.archive_old(max_age, cap, now_secs(), cancel);
        if archived.is_empty() {
            return 0;
        }
        let ids: HashSet<BlockId> = archived.iter().copied().collect();
        self.dedup.purge(&ids);
        self.graph.purge_edges(&ids);
        for &id in &archived {
            if let Some(block) = self.blocks.get_mut(&id) {
                // Cold storage: the arrays can be re-sublimated on demand.
                block.keys = Vec::new();
                block.values = Vec::new();
            }
        }
        archived.len()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            blocks: self.blocks.len(),
            chains: self.chain.chain_count(),
            versions: self.chain.node_count(),
            next_block_id: self.next_block_id,
            step: self.step,
            dedup: self.dedup.stats(),
            graph: self.graph.stats(),
        }
    }

    /// Flushes every block, edge and version to the store. I/O failures
    /// are logged and counted; in-memory state stays authoritative and the
    /// next sync retries.
    pub fn sync(&mut self) -> MResult<SyncReport> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(SyncReport::default()),
        };
        let mut report = SyncReport::default();

        for block in self.blocks.values() {
            let summary = self
                .graph
                .current_summary(block.id)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_vec())
                .or_else(|| block.summary.clone())
                .unwrap_or_default();
            match store.write_block(block.id, &summary, &block.concept_key) {
                Ok(()) => report.written += 1,
                Err(err) => {
                    log::error!("sync: block {} not written: {}", block.id, err);
                    report.failed += 1;
                }
            }
        }

        for (a, b, edge) in self.graph.edges() {
            let record = EdgeRecord {
                a,
                b,
                weight: edge.weight,
                count: edge.count,
                last_step: edge.last_step,
            };
            match store.write_edge(&record) {
                Ok(()) => report.written += 1,
                Err(err) => {
                    log::error!("sync: edge {}_{} not written: {}", a, b, err);
                    report.failed += 1;
                }
            }
        }

        let records: Vec<(VersionRecord, Vec<f32>)> = self
            .blocks
            .keys()
            .filter_map(|&id| self.chain.get(id))
            .map(|node| {
                let summary = self.summary_of(node.node_id).map(|s| s.to_vec()).unwrap_or_default();
                (VersionRecord::from_node(node), summary)
            })
            .collect();
        for (record, summary) in records {
            match store.write_version(&record, &summary) {
                Ok(()) => report.written += 1,
                Err(err) => {
                    log::error!("sync: version {} not written: {}", record.node_id, err);
                    report.failed += 1;
                }
            }
        }

        let manifest = Manifest {
            next_block_id: self.next_block_id,
            step: self.step,
            summary_dim: self.config.summary_dim,
        };
        match store.write_manifest(&manifest) {
            Ok(()) => report.written += 1,
            Err(err) => {
                log::error!("sync: manifest not written: {}", err);
                report.failed += 1;
            }
        }

        log::info!("sync: {} written, {} failed", report.written, report.failed);
        Ok(report)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Coarse reader-writer wrapper over the coordinator: the single-writer
/// discipline without per-engine locks.
#[derive(Clone)]
pub struct SharedMemory {
    inner: Arc<RwLock<MemoryCoordinator>>,
}

impl SharedMemory {
    pub fn new(coordinator: MemoryCoordinator) -> Self {
        SharedMemory { inner: Arc::new(RwLock::new(coordinator)) }
    }

    pub fn read<R>(&self, f: impl FnOnce(&MemoryCoordinator) -> R) -> R {
        f(&self.inner.read().expect("memory lock poisoned"))
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut MemoryCoordinator) -> R) -> R {
        f(&mut self.inner.write().expect("memory lock poisoned"))
    }
}
