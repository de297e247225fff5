//! The memory block data model.

/// Stable identifier of a memory block, assigned monotonically by the
/// coordinator within a session.
pub type BlockId = i64;

/// Concept keys are capped at 63 bytes so they fit the NUL-terminated
/// serialized form.
pub const MAX_CONCEPT_KEY_BYTES: usize = 63;

/// One unit of sublimated attention state plus its summary vector.
///
/// The key/value/position arrays are immutable once the block is admitted;
/// only the summary evolves, and it is versioned through the correlation
/// graph's snapshot history. Blocks replayed from cold storage carry empty
/// key/value arrays until re-sublimated; the id stays valid.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryBlock {
    pub id: BlockId,

    /// Rows of the dequantized key matrix, `n_tokens × n_embd_k`, row-major.
    pub keys: Vec<f32>,

    /// Rows of the dequantized value matrix, `n_tokens × n_embd_v`.
    pub values: Vec<f32>,

    /// Token positions, in original sequence order.
    pub positions: Vec<i32>,

    pub n_tokens: usize,
    pub n_embd_k: usize,
    pub n_embd_v: usize,

    /// Summary vector of the configured dimension, if one was available at
    /// admission. Blocks without one are findable by exact key only.
    pub summary: Option<Vec<f32>>,

    /// Human-readable concept key shared by every version of a fact.
    pub concept_key: String,

    /// Coordinator step counter at creation.
    pub created_step: u64,
}

/// A block that has not been admitted yet: everything but the id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DraftBlock {
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
    pub positions: Vec<i32>,
    pub n_tokens: usize,
    pub n_embd_k: usize,
    pub n_embd_v: usize,
    pub summary: Option<Vec<f32>>,
    pub concept_key: String,
}

impl DraftBlock {
    pub fn into_block(self, id: BlockId, created_step: u64) -> MemoryBlock {
        MemoryBlock {
            id,
            keys: self.keys,
            values: self.values,
            positions: self.positions,
            n_tokens: self.n_tokens,
            n_embd_k: self.n_embd_k,
            n_embd_v: self.n_embd_v,
            summary: self.summary,
            concept_key: clamp_concept_key(&self.concept_key),
            created_step,
        }
    }
}

/// Truncates a concept key to [`MAX_CONCEPT_KEY_BYTES`] on a char boundary.
pub fn clamp_concept_key(key: &str) -> String {
    if key.len() <= MAX_CONCEPT_KEY_BYTES {
        return key.to_string();
    }
    let mut end = MAX_CONCEPT_KEY_BYTES;
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    key[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_keys_pass_through() {
        assert_eq!(clamp_concept_key("fact:sky_color=blue"), "fact:sky_color=blue");
    }

    #[test]
    fn long_keys_truncate_to_63_bytes() {
        let long = "k".repeat(100);
        let clamped = clamp_concept_key(&long);
        assert_eq!(clamped.len(), MAX_CONCEPT_KEY_BYTES);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 31 two-byte chars = 62 bytes; one more would split a char at 63.
        let key = "é".repeat(40);
        let clamped = clamp_concept_key(&key);
        assert!(clamped.len() <= MAX_CONCEPT_KEY_BYTES);
        assert!(clamped.is_char_boundary(clamped.len()));
        assert_eq!(clamped, "é".repeat(31));
    }

    #[test]
    fn draft_becomes_block() {
        let draft = DraftBlock {
            concept_key: "fact:x".to_string(),
            summary: Some(vec![1.0, 0.0]),
            ..DraftBlock::default()
        };
        let block = draft.into_block(7, 3);
        assert_eq!(block.id, 7);
        assert_eq!(block.created_step, 3);
        assert_eq!(block.concept_key, "fact:x");
    }
}
