//! Version chains: the append-only history of each conceptual fact.
//!
//! A chain is the ordered sequence of blocks sharing a concept key. Every
//! node carries a status and pointers to its neighbors in history; a chain
//! holds at most one `Active` node at any time, and status transitions
//! become visible atomically under the coordinator's single-writer
//! discipline.
//!
//! The version lattice for one concept looks like:
//!
//! v1 ── superseded_by ──> v2 ── superseded_by ──> v3 (Active)
//!
//! `update` appends at the tail; `rollback`/`rollback_to` move the Active
//! pointer along the chain without deleting history; `retract`, `merge`
//! and `archive_old` park nodes in terminal states.

pub mod conflict;

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::cancel::CancelToken;
use crate::error::{Error, MResult};
use crate::version::conflict::{classify, jaccard, Conflict};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionStatus {
    Active,
    Superseded,
    Retracted,
    Merged,
    Archived,
}

/// One version of a conceptual fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionNode {
    pub node_id: BlockId,
    pub concept_key: String,

    /// 1 for the chain head, +1 per update.
    pub version: u32,

    pub status: VersionStatus,
    pub created_at: i64,

    pub superseded_at: Option<i64>,
    pub superseded_by: Option<BlockId>,

    /// History pointers; ids, never references.
    pub prev_version: Option<BlockId>,
    pub next_version: Option<BlockId>,

    pub merged_into: Option<BlockId>,

    /// Why the node left the Active state (or why it exists, for updates).
    pub reason: Option<String>,

    /// Accumulated confidence; updates carry a delta relative to the
    /// version they supersede.
    pub confidence: f32,

    /// Stored value for conflict detection, when the caller provides one.
    pub value: Option<String>,
}

#[derive(Clone, Debug)]
struct ChainInfo {
    head: BlockId,
    tail: BlockId,
    active: Option<BlockId>,
    count: u32,
}

/// Chain store for every concept key.
#[derive(Default)]
pub struct VersionChain {
    nodes: HashMap<BlockId, VersionNode>,
    chains: HashMap<String, ChainInfo>,
}

impl VersionChain {
    pub fn new() -> Self {
        VersionChain::default()
    }

    /// Starts a new chain. Returns the version number (always 1).
    pub fn register(&mut self, node_id: BlockId, concept_key: &str, created_at: i64) -> MResult<u32> {
        if self.nodes.contains_key(&node_id) {
            return Err(Error::Value(format!("node {} already registered", node_id)));
        }
        if self.chains.contains_key(concept_key) {
            return Err(Error::Value(format!("chain for {:?} already exists", concept_key)));
        }
        self.nodes.insert(
            node_id,
            VersionNode {
                node_id,
                concept_key: concept_key.to_string(),
                version: 1,
                status: VersionStatus::Active,
                created_at,
                superseded_at: None,
                superseded_by: None,
                prev_version: None,
                next_version: None,
                merged_into: None,
                reason: None,
                confidence: 1.0,
                value: None,
            },
        );
        self.chains.insert(
            concept_key.to_string(),
            ChainInfo { head: node_id, tail: node_id, active: Some(node_id), count: 1 },
        );
        Ok(1)
    }

    /// Appends a new version, superseding the current Active node. Returns
    /// the new version number.
    pub fn update(
        &mut self,
        new_node_id: BlockId,
        concept_key: &str,
        reason: &str,
        confidence_delta: f32,
        created_at: i64,
    ) -> MResult<u32> {
        if self.nodes.contains_key(&new_node_id) {
            return Err(Error::Value(format!("node {} already registered", new_node_id)));
        }
        let chain = self
            .chains
            .get(concept_key)
            .cloned()
            .ok_or_else(|| Error::Value(format!("no chain for {:?}", concept_key)))?;

        let tail = &self.nodes[&chain.tail];
        let version = tail.version + 1;
        let base_confidence = tail.confidence;

        if let Some(active_id) = chain.active {
            let active = self.nodes.get_mut(&active_id).expect("chain active node");
            active.status = VersionStatus::Superseded;
            active.superseded_at = Some(created_at);
            active.superseded_by = Some(new_node_id);
            active.reason = Some(reason.to_string());
        }
        self.nodes.get_mut(&chain.tail).expect("chain tail").next_version = Some(new_node_id);

        self.nodes.insert(
            new_node_id,
            VersionNode {
                node_id: new_node_id,
                concept_key: concept_key.to_string(),
                version,
                status: VersionStatus::Active,
                created_at,
                superseded_at: None,
                superseded_by: None,
                prev_version: Some(chain.tail),
                next_version: None,
                merged_into: None,
                reason: None,
                confidence: base_confidence + confidence_delta,
                value: None,
            },
        );

        let chain = self.chains.get_mut(concept_key).expect("chain");
        chain.tail = new_node_id;
        chain.active = Some(new_node_id);
        chain.count += 1;
        Ok(version)
    }

    /// Retracts a node. Only the current Active node of its chain can be
    /// retracted.
    pub fn retract(&mut self, node_id: BlockId, reason: &str) -> MResult<()> {
        let node = self
            .nodes
            .get(&node_id)
            .ok_or_else(|| Error::Value(format!("no node {}", node_id)))?;
        if node.status != VersionStatus::Active {
            return Err(Error::Value(format!("node {} is not active", node_id)));
        }
        let key = node.concept_key.clone();
        let node = self.nodes.get_mut(&node_id).expect("node");
        node.status = VersionStatus::Retracted;
        node.reason = Some(reason.to_string());
        self.chains.get_mut(&key).expect("chain").active = None;
        Ok(())
    }

    /// Merges the source nodes into `target`. Every source must be Active;
    /// nothing changes if any check fails.
    pub fn merge(&mut self, sources: &[BlockId], target: BlockId, reason: &str) -> MResult<()> {
        let target_node = self
            .nodes
            .get(&target)
            .ok_or_else(|| Error::Value(format!("no merge target {}", target)))?;
        if target_node.status != VersionStatus::Active {
            return Err(Error::Value(format!("merge target {} is not active", target)));
        }
        for &source in sources {
            if source == target {
                return Err(Error::Value("merge target listed as source".to_string()));
            }
            let node = self
                .nodes
                .get(&source)
                .ok_or_else(|| Error::Value(format!("no merge source {}", source)))?;
            if node.status != VersionStatus::Active {
                return Err(Error::Value(format!("merge source {} is not active", source)));
            }
        }
        for &source in sources {
            let key = self.nodes[&source].concept_key.clone();
            let node = self.nodes.get_mut(&source).expect("merge source");
            node.status = VersionStatus::Merged;
            node.merged_into = Some(target);
            node.reason = Some(reason.to_string());
            self.chains.get_mut(&key).expect("chain").active = None;
        }
        Ok(())
    }

    fn active_of(&self, concept_key: &str) -> MResult<BlockId> {
        let chain = self
            .chains
            .get(concept_key)
            .ok_or_else(|| Error::Value(format!("no chain for {:?}", concept_key)))?;
        chain
            .active
            .ok_or_else(|| Error::Value(format!("{:?} has no active version", concept_key)))
    }

    /// Moves the Active pointer one version back. Returns the new Active id.
    pub fn rollback(&mut self, concept_key: &str, reason: &str) -> MResult<BlockId> {
        let active_id = self.active_of(concept_key)?;
        let prev = self.nodes[&active_id]
            .prev_version
            .ok_or_else(|| Error::Value(format!("{:?} has no earlier version", concept_key)))?;
        let target_version = self.nodes[&prev].version;
        self.rollback_to(concept_key, target_version, reason)
    }

    /// Makes `version` the Active node, superseding the current one.
    /// Idempotent when the target is already Active.
    pub fn rollback_to(
        &mut self,
        concept_key: &str,
        version: u32,
        reason: &str,
    ) -> MResult<BlockId> {
        let chain = self
            .chains
            .get(concept_key)
            .cloned()
            .ok_or_else(|| Error::Value(format!("no chain for {:?}", concept_key)))?;

        // Walk back from the tail to the requested version.
        let mut cursor = Some(chain.tail);
        let mut target = None;
        while let Some(id) = cursor {
            let node = &self.nodes[&id];
            if node.version == version {
                target = Some(id);
                break;
            }
            cursor = node.prev_version;
        }
        let target = target
            .ok_or_else(|| Error::Value(format!("{:?} has no version {}", concept_key, version)))?;

        match self.nodes[&target].status {
            VersionStatus::Active => return Ok(target), // already current
            VersionStatus::Superseded => {}
            status => {
                return Err(Error::Value(format!(
                    "cannot roll back to version {} in state {:?}",
                    version, status
                )))
            }
        }

        if let Some(active_id) = chain.active {
            let active = self.nodes.get_mut(&active_id).expect("active node");
            active.status = VersionStatus::Superseded;
            active.reason = Some(reason.to_string());
        }
        let node = self.nodes.get_mut(&target).expect("rollback target");
        node.status = VersionStatus::Active;
        node.superseded_at = None;
        node.superseded_by = None;
        self.chains.get_mut(concept_key).expect("chain").active = Some(target);
        Ok(target)
    }

    /// Scans the chain for stored values that overlap `new_value`.
    pub fn check_conflict(&self, concept_key: &str, new_value: &str) -> Vec<Conflict> {
        let mut out = Vec::new();
        if new_value.is_empty() {
            return out;
        }
        for node in self.history(concept_key) {
            if let Some(value) = &node.value {
                let overlap = jaccard(new_value, value);
                if let Some(kind) = classify(overlap) {
                    out.push(Conflict { node_id: node.node_id, kind, overlap });
                }
            }
        }
        out
    }

    /// Attaches a comparable value to a node for conflict detection.
    pub fn set_value(&mut self, node_id: BlockId, value: &str) -> MResult<()> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| Error::Value(format!("no node {}", node_id)))?;
        node.value = Some(value.to_string());
        Ok(())
    }

    /// The Active node of a chain, if the chain exists and has one.
    pub fn current(&self, concept_key: &str) -> Option<&VersionNode> {
        let chain = self.chains.get(concept_key)?;
        chain.active.and_then(|id| self.nodes.get(&id))
    }

    /// The chain's history, oldest to newest.
    pub fn history(&self, concept_key: &str) -> Vec<&VersionNode> {
        let mut out = Vec::new();
        let chain = match self.chains.get(concept_key) {
            Some(chain) => chain,
            None => return out,
        };
        let mut cursor = Some(chain.head);
        while let Some(id) = cursor {
            let node = &self.nodes[&id];
            out.push(node);
            cursor = node.next_version;
        }
        out
    }

    pub fn get(&self, node_id: BlockId) -> Option<&VersionNode> {
        self.nodes.get(&node_id)
    }

    pub fn is_current(&self, node_id: BlockId) -> bool {
        self.nodes
            .get(&node_id)
            .map(|n| n.status == VersionStatus::Active)
            .unwrap_or(false)
    }

    pub fn prev(&self, node_id: BlockId) -> Option<&VersionNode> {
        self.nodes.get(&node_id)?.prev_version.and_then(|id| self.nodes.get(&id))
    }

    /// Whether a block participates in any chain.
    pub fn contains(&self, node_id: BlockId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// A block passes the active-version filter when it is Active, or when
    /// it never entered a chain at all.
    pub fn passes_active_filter(&self, node_id: BlockId) -> bool {
        match self.nodes.get(&node_id) {
            Some(node) => node.status == VersionStatus::Active,
            None => true,
        }
    }

    /// Moves Superseded nodes older than `max_age` seconds to Archived,
    /// at most `cap` per call. Returns the archived ids.
    pub fn archive_old(
        &mut self,
        max_age: i64,
        cap: usize,
        now: i64,
        cancel: &CancelToken,
    ) -> Vec<BlockId> {
        let mut candidates: Vec<BlockId> = self
            .nodes
            .values()
            .filter(|n| n.status == VersionStatus::Superseded)
            .filter(|n| n.superseded_at.map(|at| now - at >= max_age).unwrap_or(false))
            .map(|n| n.node_id)
            .collect();
        candidates.sort_unstable();
        candidates.truncate(cap);

        let mut archived = Vec::new();
        for id in candidates {
            if cancel.is_cancelled() {
                log::info!("archival sweep cancelled after {} nodes", archived.len());
                break;
            }
            self.nodes.get_mut(&id).expect("archive candidate").status = VersionStatus::Archived;
            archived.push(id);
        }
        if !archived.is_empty() {
            log::info!("archived {} superseded versions", archived.len());
        }
        archived
    }

    /// Reinstates a replayed node. Callers feed nodes in ascending version
    /// order per concept; pointers and chain bookkeeping are rebuilt here.
    pub(crate) fn restore_node(&mut self, mut node: VersionNode) -> MResult<()> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(Error::Value(format!("node {} already restored", node.node_id)));
        }
        node.prev_version = None;
        node.next_version = None;
        match self.chains.get_mut(&node.concept_key) {
            None => {
                self.chains.insert(
                    node.concept_key.clone(),
                    ChainInfo {
                        head: node.node_id,
                        tail: node.node_id,
                        active: (node.status == VersionStatus::Active).then_some(node.node_id),
                        count: 1,
                    },
                );
            }
            Some(chain) => {
                let tail = chain.tail;
                node.prev_version = Some(tail);
                if node.status == VersionStatus::Active {
                    chain.active = Some(node.node_id);
                }
                chain.tail = node.node_id;
                chain.count += 1;
                self.nodes.get_mut(&tail).expect("restored tail").next_version =
                    Some(node.node_id);
            }
        }
        self.nodes.insert(node.node_id, node);
        Ok(())
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
