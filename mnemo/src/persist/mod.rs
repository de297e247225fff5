//! The on-disk store: three sibling directories of per-entity files under
//! a configurable root, plus a manifest and an exclusive lock.
//!
//! Layout:
//!
//! - `blocks/<id>.bin`: `block_id:i64, dim:i32` then `dim × f32`, all
//!   little-endian.
//! - `texts/<id>.txt`: the concept key, UTF-8.
//! - `edges/<a>_<b>.bin`: the full edge record (bincode), `a < b`.
//! - `versions/<id>_v<version>.bin`: the version record without its
//!   pointer fields (bincode), then `dim:i32` and `dim × f32`.
//! - `manifest.json`: counters needed to resume id assignment.
//!
//! Writes truncate-and-rewrite whole files and never fsync; replay on open
//! rebuilds every in-memory index, so a torn file costs one entry, not the
//! store. I/O failures are logged and skipped; in-memory state stays
//! authoritative and the next sync retries.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs4::FileExt;
use serde_derive::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::error::{Error, MResult};
use crate::version::{VersionNode, VersionStatus};

const LOCK_FILE: &str = "LOCK";
const MANIFEST_FILE: &str = "manifest.json";

/// A persisted undirected edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub a: BlockId,
    pub b: BlockId,
    pub weight: f32,
    pub count: u64,
    pub last_step: u64,
}

/// A version node without its history pointers; replay rebuilds those from
/// the per-concept version ordering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub node_id: BlockId,
    pub concept_key: String,
    pub version: u32,
    pub status: VersionStatus,
    pub created_at: i64,
    pub superseded_at: Option<i64>,
    pub superseded_by: Option<BlockId>,
    pub merged_into: Option<BlockId>,
    pub reason: Option<String>,
    pub confidence: f32,
    pub value: Option<String>,
}

impl VersionRecord {
    pub fn from_node(node: &VersionNode) -> Self {
        VersionRecord {
            node_id: node.node_id,
            concept_key: node.concept_key.clone(),
            version: node.version,
            status: node.status,
            created_at: node.created_at,
            superseded_at: node.superseded_at,
            superseded_by: node.superseded_by,
            merged_into: node.merged_into,
            reason: node.reason.clone(),
            confidence: node.confidence,
            value: node.value.clone(),
        }
    }

    pub fn into_node(self) -> VersionNode {
        VersionNode {
            node_id: self.node_id,
            concept_key: self.concept_key,
            version: self.version,
            status: self.status,
            created_at: self.created_at,
            superseded_at: self.superseded_at,
            superseded_by: self.superseded_by,
            prev_version: None,
            next_version: None,
            merged_into: self.merged_into,
            reason: self.reason,
            confidence: self.confidence,
            value: self.value,
        }
    }
}

/// Resume counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub next_block_id: BlockId,
    pub step: u64,
    pub summary_dim: usize,
}

/// A block as replayed from disk: summary and key only; the K/V arrays
/// stay cold until re-sublimated.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistedBlock {
    pub id: BlockId,
    pub summary: Vec<f32>,
    pub concept_key: String,
}

/// Everything `load` could recover from the root.
#[derive(Debug, Default)]
pub struct StoreState {
    pub manifest: Option<Manifest>,
    pub blocks: Vec<PersistedBlock>,
    pub edges: Vec<EdgeRecord>,
    pub versions: Vec<(VersionRecord, Vec<f32>)>,
}

/// Outcome of one sync pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: usize,
    pub failed: usize,
}

pub struct Store {
    root: PathBuf,
    /// Held for the lifetime of the store; a second opener fails.
    _lock: File,
}

impl Store {
    /// Opens (or creates) a store root, taking the exclusive lock.
    pub fn open(root: impl Into<PathBuf>) -> MResult<Store> {
        let root = root.into();
        for dir in ["blocks", "texts", "edges", "versions"] {
            std::fs::create_dir_all(root.join(dir)).map_err(|err| {
                Error::Io(format!("creating {}: {}", root.join(dir).display(), err))
            })?;
        }
        let lock = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|err| Error::Io(format!("store already locked: {}", err)))?;
        Ok(Store { root, _lock: lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes one block's summary file and concept-key text. Idempotent.
    pub fn write_block(&self, id: BlockId, summary: &[f32], concept_key: &str) -> MResult<()> {
        let path = self.root.join("blocks").join(format!("{}.bin", id));
        let mut file = File::create(&path)?;
        file.write_i64::<LittleEndian>(id)?;
        file.write_i32::<LittleEndian>(summary.len() as i32)?;
        for &v in summary {
            file.write_f32::<LittleEndian>(v)?;
        }

        let text_path = self.root.join("texts").join(format!("{}.txt", id));
        std::fs::write(text_path, concept_key.as_bytes())?;
        Ok(())
    }

    pub fn write_edge(&self, record: &EdgeRecord) -> MResult<()> {
        let (a, b) = if record.a < record.b { (record.a, record.b) } else { (record.b, record.a) };
        let path = self.root.join("edges").join(format!("{}_{}.bin", a, b));
        let bytes = bincode::serialize(record)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn write_version(&self, record: &VersionRecord, summary: &[f32]) -> MResult<()> {
        let path = self
            .root
            .join("versions")
            .join(format!("{}_v{}.bin", record.node_id, record.version));
        let mut file = File::create(&path)?;
        let bytes = bincode::serialize(record)?;
        file.write_u32::<LittleEndian>(bytes.len() as u32)?;
        file.write_all(&bytes)?;
        file.write_i32::<LittleEndian>(summary.len() as i32)?;
        for &v in summary {
            file.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> MResult<()> {
        let path = self.root.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(manifest)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Replays the whole root. Unreadable entries are logged and skipped;
    /// replay is idempotent.
    pub fn load(&self) -> StoreState {
        let mut state = StoreState::default();

        match std::fs::read_to_string(self.root.join(MANIFEST_FILE)) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(manifest) => state.manifest = Some(manifest),
                Err(err) => log::warn!("skipping bad manifest: {}", err),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("manifest unreadable: {}", err),
        }

        for path in list_dir(&self.root.join("blocks"), "bin") {
            match self.read_block(&path) {
                Ok(block) => state.blocks.push(block),
                Err(err) => log::warn!("skipping block {}: {}", path.display(), err),
            }
        }
        state.blocks.sort_by_key(|b| b.id);

        for path in list_dir(&self.root.join("edges"), "bin") {
            match read_edge(&path) {
                Ok(edge) => state.edges.push(edge),
                Err(err) => log::warn!("skipping edge {}: {}", path.display(), err),
            }
        }

        for path in list_dir(&self.root.join("versions"), "bin") {
            match read_version(&path) {
                Ok(version) => state.versions.push(version),
                Err(err) => log::warn!("skipping version {}: {}", path.display(), err),
            }
        }
        // Replay order: per concept, ascending version.
        state
            .versions
            .sort_by(|(x, _), (y, _)| x.concept_key.cmp(&y.concept_key).then(x.version.cmp(&y.version)));

        state
    }

    fn read_block(&self, path: &Path) -> MResult<PersistedBlock> {
        let mut file = File::open(path)?;
        let id = file.read_i64::<LittleEndian>()?;
        let dim = file.read_i32::<LittleEndian>()?;
        if dim < 0 {
            return Err(Error::Parse(format!("negative dim {}", dim)));
        }
        let mut summary = Vec::with_capacity(dim as usize);
        for _ in 0..dim {
            summary.push(file.read_f32::<LittleEndian>()?);
        }
        let text_path = self.root.join("texts").join(format!("{}.txt", id));
        let concept_key = match std::fs::read_to_string(&text_path) {
            Ok(text) => text,
            Err(err) => {
                log::warn!("block {} has no text file: {}", id, err);
                String::new()
            }
        };
        Ok(PersistedBlock { id, summary, concept_key })
    }
}

fn list_dir(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("cannot list {}: {}", dir.display(), err);
            return Vec::new();
        }
    };
    let mut out: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == ext).unwrap_or(false))
        .collect();
    out.sort();
    out
}

fn read_edge(path: &Path) -> MResult<EdgeRecord> {
    let bytes = std::fs::read(path)?;
    Ok(bincode::deserialize(&bytes)?)
}

fn read_version(path: &Path) -> MResult<(VersionRecord, Vec<f32>)> {
    let mut file = File::open(path)?;
    let len = file.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0; len];
    file.read_exact(&mut bytes)?;
    let record: VersionRecord = bincode::deserialize(&bytes)?;
    let dim = file.read_i32::<LittleEndian>()?;
    if dim < 0 {
        return Err(Error::Parse(format!("negative dim {}", dim)));
    }
    let mut summary = Vec::with_capacity(dim as usize);
    for _ in 0..dim {
        summary.push(file.read_f32::<LittleEndian>()?);
    }
    Ok((record, summary))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(id: BlockId, key: &str, version: u32, status: VersionStatus) -> VersionRecord {
        VersionRecord {
            node_id: id,
            concept_key: key.to_string(),
            version,
            status,
            created_at: 1000 + id,
            superseded_at: None,
            superseded_by: None,
            merged_into: None,
            reason: None,
            confidence: 1.0,
            value: None,
        }
    }

    #[test]
    fn round_trips_every_entity() {
        let dir = tempdir::TempDir::new("mnemo").unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();

        store.write_block(1, &[1.0, 0.5], "fact:a").unwrap();
        store.write_block(2, &[0.0, 1.0], "fact:b").unwrap();
        store
            .write_edge(&EdgeRecord { a: 2, b: 1, weight: 0.7, count: 3, last_step: 11 })
            .unwrap();
        store.write_version(&record(1, "fact:a", 1, VersionStatus::Superseded), &[1.0, 0.5]).unwrap();
        store.write_version(&record(2, "fact:a", 2, VersionStatus::Active), &[0.0, 1.0]).unwrap();
        store.write_manifest(&Manifest { next_block_id: 3, step: 9, summary_dim: 2 }).unwrap();

        let state = store.load();
        assert_eq!(state.manifest.unwrap().next_block_id, 3);
        assert_eq!(state.blocks.len(), 2);
        assert_eq!(state.blocks[0].id, 1);
        assert_eq!(state.blocks[0].summary, vec![1.0, 0.5]);
        assert_eq!(state.blocks[0].concept_key, "fact:a");
        assert_eq!(state.edges.len(), 1);
        // Unordered pairs are stored normalized.
        assert_eq!((state.edges[0].a, state.edges[0].b), (1, 2));
        assert_eq!(state.versions.len(), 2);
        assert_eq!(state.versions[0].0.version, 1);
        assert_eq!(state.versions[1].0.version, 2);
    }

    #[test]
    fn rewrites_are_idempotent() {
        let dir = tempdir::TempDir::new("mnemo").unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        for _ in 0..3 {
            store.write_block(1, &[1.0], "fact:a").unwrap();
        }
        assert_eq!(store.load().blocks.len(), 1);
    }

    #[test]
    fn second_opener_is_locked_out() {
        let dir = tempdir::TempDir::new("mnemo").unwrap();
        let path = dir.path().join("store");
        let store = Store::open(path.clone()).unwrap();
        assert!(Store::open(path.clone()).is_err());
        drop(store);
        assert!(Store::open(path).is_ok());
    }

    #[test]
    fn corrupt_files_are_skipped_not_fatal() {
        let dir = tempdir::TempDir::new("mnemo").unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        store.write_block(1, &[1.0], "fact:a").unwrap();
        std::fs::write(store.root().join("blocks").join("2.bin"), b"xx").unwrap();
        std::fs::write(store.root().join("edges").join("1_2.bin"), b"junk").unwrap();

        let state = store.load();
        assert_eq!(state.blocks.len(), 1);
        assert!(state.edges.is_empty());
    }

    #[test]
    fn empty_root_loads_empty_state() {
        let dir = tempdir::TempDir::new("mnemo").unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let state = store.load();
        assert!(state.manifest.is_none());
        assert!(state.blocks.is_empty());
        assert!(state.edges.is_empty());
        assert!(state.versions.is_empty());
    }
}
