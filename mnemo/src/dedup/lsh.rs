use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::block::BlockId;

/// Signed-random-projection LSH over block summary vectors.
///
/// Each of the `T` tables holds `B` Gaussian hyperplanes in R^D, sampled
/// once at construction and frozen. A vector's bucket in a table is the
/// `B`-bit word whose `i`-th bit is set iff the dot product with plane `i`
/// is `>= 0`; the zero vector therefore lands in the all-ones bucket. The
/// planes are not re-normalized since only the sign of the projection
/// matters.
pub struct LshIndex {
    dim: usize,
    tables: Vec<LshTable>,
}

struct LshTable {
    /// `B` hyperplanes, each of dimension `D`, row-major.
    planes: Vec<f32>,
    buckets: HashMap<u32, Vec<BlockId>>,
}

impl LshIndex {
    /// Samples `tables × planes` hyperplanes. A seed makes the geometry
    /// reproducible; `None` draws from the thread RNG.
    pub fn new(dim: usize, tables: usize, planes: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(rand::thread_rng()).expect("thread rng"),
        };
        let tables = (0..tables)
            .map(|_| LshTable {
                planes: (0..planes * dim).map(|_| gaussian(&mut rng)).collect(),
                buckets: HashMap::new(),
            })
            .collect();
        LshIndex { dim, tables }
    }

    /// The bucket index of `vector` in table `t`.
    fn bucket_of(&self, t: usize, vector: &[f32]) -> u32 {
        let table = &self.tables[t];
        let planes = table.planes.len() / self.dim;
        let mut bucket = 0u32;
        for i in 0..planes {
            let plane = &table.planes[i * self.dim..(i + 1) * self.dim];
            let dot: f32 = plane.iter().zip(vector).map(|(p, x)| p * x).sum();
            if dot >= 0.0 {
                bucket |= 1 << i;
            }
        }
        bucket
    }

    /// Inserts a block id into its bucket in every table.
    pub fn insert(&mut self, id: BlockId, vector: &[f32]) {
        if vector.len() != self.dim {
            return;
        }
        for t in 0..self.tables.len() {
            let bucket = self.bucket_of(t, vector);
            self.tables[t].buckets.entry(bucket).or_default().push(id);
        }
    }

    /// Unions the bucket contents of all tables, deduplicated in
    /// first-seen order.
    pub fn candidates(&self, vector: &[f32]) -> Vec<BlockId> {
        if vector.len() != self.dim {
            return Vec::new();
        }
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for t in 0..self.tables.len() {
            let bucket = self.bucket_of(t, vector);
            if let Some(ids) = self.tables[t].buckets.get(&bucket) {
                for &id in ids {
                    if seen.insert(id) {
                        out.push(id);
                    }
                }
            }
        }
        out
    }

    /// Drops the given ids from every bucket. Entries are not removed on
    /// the hot path; archival sweeps call this to reconcile.
    pub fn purge(&mut self, ids: &std::collections::HashSet<BlockId>) {
        for table in &mut self.tables {
            for bucket in table.buckets.values_mut() {
                bucket.retain(|id| !ids.contains(id));
            }
            table.buckets.retain(|_, bucket| !bucket.is_empty());
        }
    }

    /// (non-empty bucket count, total entries across them) over all tables.
    pub fn bucket_stats(&self) -> (usize, usize) {
        let mut buckets = 0;
        let mut entries = 0;
        for table in &self.tables {
            buckets += table.buckets.len();
            entries += table.buckets.values().map(Vec::len).sum::<usize>();
        }
        (buckets, entries)
    }
}

/// One standard normal sample via Box-Muller on the uniform source.
fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f64 = loop {
        let u: f64 = rng.gen();
        if u > 0.0 {
            break u;
        }
    };
    let u2: f64 = rng.gen();
    ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
}
