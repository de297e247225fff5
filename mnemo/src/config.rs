use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, MResult};

/// Tuning knobs for the whole memory layer.
///
/// The defaults match a small deployment; every bound that shapes a data
/// structure (summary dimension, LSH geometry, fan-out and history caps) is
/// fixed at init and frozen afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Dimension `D` of block summary vectors.
    pub summary_dim: usize,

    /// Number of independent LSH tables.
    pub lsh_tables: usize,

    /// Hyperplanes per LSH table; also the bucket index width in bits.
    pub lsh_planes: usize,

    /// Optional seed for the hyperplane RNG. `None` draws from the thread
    /// RNG; tests set it for reproducible buckets.
    pub lsh_seed: Option<u64>,

    /// Bloom filter size in bits.
    pub bloom_bits: usize,

    /// Bloom hash count `K`.
    pub bloom_hashes: usize,

    /// Cosine similarity at or above which a candidate counts as a
    /// semantic duplicate.
    pub similarity_threshold: f32,

    /// Per-block correlation fan-out cap.
    pub max_edges: usize,

    /// Per-block summary snapshot history cap.
    pub max_snapshots: usize,

    /// Edge weight added on each co-retrieval.
    pub co_retrieval_boost: f32,

    /// Multiplicative edge decay factor per decay pass.
    pub edge_decay: f32,

    /// Edges decayed below this weight are lazily removed.
    pub edge_prune_epsilon: f32,

    /// Minimum edge weight for a neighbor to participate in patching.
    pub patch_weight_min: f32,

    /// Weighted neighbor drift that triggers a summary patch.
    pub drift_max: f32,

    /// Cumulative drift under which a block is marked stable.
    pub stability_threshold: f32,

    /// Minimum edge weight followed during query expansion.
    pub expansion_min_correlation: f32,

    /// Storage root for the persistent store. `None` keeps the layer
    /// purely in memory.
    pub storage_root: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            summary_dim: 64,
            lsh_tables: 8,
            lsh_planes: 16,
            lsh_seed: None,
            bloom_bits: 1 << 20,
            bloom_hashes: 4,
            similarity_threshold: 0.85,
            max_edges: 32,
            max_snapshots: 16,
            co_retrieval_boost: 0.1,
            edge_decay: 0.95,
            edge_prune_epsilon: 0.01,
            patch_weight_min: 0.3,
            drift_max: 1.5,
            stability_threshold: 0.05,
            expansion_min_correlation: 0.5,
            storage_root: None,
        }
    }
}

impl MemoryConfig {
    /// Rejects configurations that cannot produce a working layer.
    pub fn validate(&self) -> MResult<()> {
        if self.summary_dim == 0 {
            return Err(Error::InvalidInput("summary_dim must be > 0".to_string()));
        }
        if self.lsh_tables == 0 || self.lsh_planes == 0 {
            return Err(Error::InvalidInput(
                "lsh_tables and lsh_planes must be > 0".to_string(),
            ));
        }
        if self.lsh_planes > 32 {
            return Err(Error::InvalidInput(
                "lsh_planes must fit a 32-bit bucket index".to_string(),
            ));
        }
        if self.bloom_bits == 0 || self.bloom_hashes == 0 {
            return Err(Error::InvalidInput(
                "bloom_bits and bloom_hashes must be > 0".to_string(),
            ));
        }
        if self.max_edges == 0 || self.max_snapshots == 0 {
            return Err(Error::InvalidInput(
                "max_edges and max_snapshots must be > 0".to_string(),
            ));
        }
        for (name, v) in [
            ("similarity_threshold", self.similarity_threshold),
            ("co_retrieval_boost", self.co_retrieval_boost),
            ("edge_decay", self.edge_decay),
            ("edge_prune_epsilon", self.edge_prune_epsilon),
            ("patch_weight_min", self.patch_weight_min),
            ("expansion_min_correlation", self.expansion_min_correlation),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::InvalidInput(format!("{} must be in [0, 1]", name)));
            }
        }
        if self.drift_max < 0.0 || self.stability_threshold < 0.0 {
            return Err(Error::InvalidInput(
                "drift_max and stability_threshold must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}
