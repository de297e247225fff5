/// The inference-runtime collaborator the sublimator reads from.
///
/// The runtime owns the KV cache; this trait exposes just enough to copy a
/// per-sequence slice of serialized state out of it, plus the model
/// dimensions needed to interpret that state. The serialized layout is the
/// wire format decoded by [`crate::sublimate::state::SeqState`].
pub trait KvStateSource {
    /// Number of transformer layers.
    fn n_layer(&self) -> usize;

    /// Embedding width of a key/value row.
    fn n_embd(&self) -> usize;

    /// Number of KV heads (grouped-query attention).
    fn n_head_kv(&self) -> usize;

    /// Serialized byte size of the state held for `seq_id`.
    fn state_seq_size(&self, seq_id: u32) -> usize;

    /// Copies the serialized state for `seq_id` into `buf`, returning the
    /// number of bytes written (0 on failure or absent sequence).
    fn state_seq_copy(&self, seq_id: u32, buf: &mut [u8]) -> usize;

    /// Current token embeddings, when the runtime exposes them. Used as a
    /// fallback summary source.
    fn embeddings(&self) -> Option<&[f32]> {
        None
    }
}
