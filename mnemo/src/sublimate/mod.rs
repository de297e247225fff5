//! KV sublimation: turning a per-sequence slice of the runtime's KV cache
//! into one memory block.
//!
//! The runtime's serialized state is copied out, decoded as the wire
//! format, dequantized per layer, optionally reduced across layers and
//! filtered by position range, and paired with a summary vector. Every
//! failure path (empty state, truncation, empty range, cancellation)
//! releases its partials and yields the `Ok(None)` sentinel; sublimation
//! is never fatal to the caller.

pub mod dequant;
pub mod source;
pub mod state;

pub use source::KvStateSource;

use crate::block::DraftBlock;
use crate::cancel::CancelToken;
use crate::error::MResult;
use crate::sublimate::dequant::TensorDtype;
use crate::sublimate::state::{SeqState, ValueLayout};

/// Which layer's K/V lands in the block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LayerSelect {
    /// Per-coordinate float32 mean across all layers.
    #[default]
    MeanAll,
    /// A single layer, verbatim.
    Layer(usize),
}

/// Parameters of one sublimation.
#[derive(Clone, Debug, Default)]
pub struct SublimateRequest {
    pub seq_id: u32,
    pub concept_key: String,
    /// Keep only rows whose position lies in `[start, end)`.
    pub range: Option<(i32, i32)>,
    pub layer: LayerSelect,
    /// Caller-supplied summary; falls back to runtime embeddings.
    pub summary: Option<Vec<f32>>,
}

impl SublimateRequest {
    pub fn new(seq_id: u32, concept_key: impl Into<String>) -> Self {
        SublimateRequest { seq_id, concept_key: concept_key.into(), ..Default::default() }
    }

    pub fn with_range(mut self, start: i32, end: i32) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_layer(mut self, layer: usize) -> Self {
        self.layer = LayerSelect::Layer(layer);
        self
    }

    pub fn with_summary(mut self, summary: Vec<f32>) -> Self {
        self.summary = Some(summary);
        self
    }
}

/// The sublimation engine. Stateless apart from the configured summary
/// dimension; the coordinator owns one.
pub struct Sublimator {
    summary_dim: usize,
}

/// One dequantized layer, `cell_count × n_embd` row-major.
struct Matrix {
    data: Vec<f32>,
    n_embd: usize,
}

impl Sublimator {
    pub fn new(summary_dim: usize) -> Self {
        Sublimator { summary_dim }
    }

    /// Extracts a draft block from the runtime, or `None` when there is
    /// nothing usable to extract.
    pub fn sublimate(
        &self,
        source: &dyn KvStateSource,
        request: &SublimateRequest,
        cancel: &CancelToken,
    ) -> MResult<Option<DraftBlock>> {
        let size = source.state_seq_size(request.seq_id);
        if size == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; size];
        let copied = source.state_seq_copy(request.seq_id, &mut buf);
        if copied == 0 {
            return Ok(None);
        }
        buf.truncate(copied);

        let state = match SeqState::decode(&buf) {
            Ok(state) => state,
            Err(err) => {
                log::warn!("abandoning sublimation of seq {}: {}", request.seq_id, err);
                return Ok(None);
            }
        };
        if state.cell_count() == 0 {
            return Ok(None);
        }

        let fallback_embd = source.n_embd();
        let cell_count = state.cell_count();
        let keys = match dequantize_rows(&state.keys, cell_count, fallback_embd, cancel, "key") {
            Some(keys) => keys,
            None => return Ok(None),
        };
        let values = match dequantize_values(&state, fallback_embd, cancel) {
            Some(values) => values,
            None => return Ok(None),
        };

        let key_mat = match reduce(&keys, request.layer) {
            Some(m) => m,
            None => return Ok(None),
        };
        let value_mat = match reduce(&values, request.layer) {
            Some(m) => m,
            None => return Ok(None),
        };

        let positions: Vec<i32> = state.cells.iter().map(|c| c.pos).collect();
        let (keys, values, positions) =
            match filter_range(key_mat, value_mat, positions, request.range) {
                Some(filtered) => filtered,
                None => return Ok(None),
            };

        let summary = self.pick_summary(request, source);

        let n_tokens = positions.len();
        Ok(Some(DraftBlock {
            n_embd_k: if n_tokens == 0 { 0 } else { keys.data.len() / n_tokens },
            n_embd_v: if n_tokens == 0 { 0 } else { values.data.len() / n_tokens },
            keys: keys.data,
            values: values.data,
            positions,
            n_tokens,
            summary,
            concept_key: request.concept_key.clone(),
        }))
    }

    /// Summary selection order: caller, runtime embeddings, none.
    fn pick_summary(
        &self,
        request: &SublimateRequest,
        source: &dyn KvStateSource,
    ) -> Option<Vec<f32>> {
        if let Some(summary) = &request.summary {
            if summary.len() >= self.summary_dim {
                return Some(summary[..self.summary_dim].to_vec());
            }
            log::warn!(
                "caller summary has {} dims, need {}; falling back",
                summary.len(),
                self.summary_dim
            );
        }
        source
            .embeddings()
            .filter(|e| e.len() >= self.summary_dim)
            .map(|e| e[..self.summary_dim].to_vec())
    }
}

/// Dequantizes a run of row-major layers.
fn dequantize_rows(
    layers: &[crate::sublimate::state::TensorRows],
    cell_count: usize,
    fallback_embd: usize,
    cancel: &CancelToken,
    what: &str,
) -> Option<Vec<Matrix>> {
    let mut out = Vec::with_capacity(layers.len());
    for (i, layer) in layers.iter().enumerate() {
        if cancel.is_cancelled() {
            log::info!("sublimation cancelled at {} layer {}", what, i);
            return None;
        }
        let dtype = TensorDtype::from_tag(layer.dtype);
        if let TensorDtype::Unknown(tag) = dtype {
            log::warn!("unknown {} dtype {} in layer {}; zero-filling", what, tag, i);
        }
        let n_embd = dtype.row_elements(layer.bytes_per_row).unwrap_or(fallback_embd);
        let mut data = vec![0.0f32; cell_count * n_embd];
        let bpr = layer.bytes_per_row as usize;
        for c in 0..cell_count {
            // A short payload zero-fills; decode() guarantees full rows.
            let src = layer.payload.get(c * bpr..(c + 1) * bpr).unwrap_or(&[]);
            dtype.dequantize_row(src, &mut data[c * n_embd..(c + 1) * n_embd]);
        }
        out.push(Matrix { data, n_embd });
    }
    Some(out)
}

/// Dequantizes the value layers, transposing on the fly when needed.
fn dequantize_values(
    state: &SeqState,
    fallback_embd: usize,
    cancel: &CancelToken,
) -> Option<Vec<Matrix>> {
    let cell_count = state.cell_count();
    match &state.values {
        ValueLayout::RowMajor(rows) => {
            dequantize_rows(rows, cell_count, fallback_embd, cancel, "value")
        }
        ValueLayout::Transposed(layers) => {
            let mut out = Vec::with_capacity(layers.len());
            for (i, layer) in layers.iter().enumerate() {
                if cancel.is_cancelled() {
                    log::info!("sublimation cancelled at value layer {}", i);
                    return None;
                }
                let dtype = TensorDtype::from_tag(layer.dtype);
                if let TensorDtype::Unknown(tag) = dtype {
                    log::warn!("unknown value dtype {} in layer {}; zero-filling", tag, i);
                }
                let n_embd = layer.n_embd as usize;
                let row_bytes = cell_count * layer.bytes_per_element as usize;
                let mut data = vec![0.0f32; cell_count * n_embd];
                let mut row = vec![0.0f32; cell_count];
                for e in 0..n_embd {
                    let src = layer.payload.get(e * row_bytes..(e + 1) * row_bytes).unwrap_or(&[]);
                    dtype.dequantize_row(src, &mut row);
                    for c in 0..cell_count {
                        data[c * n_embd + e] = row[c];
                    }
                }
                out.push(Matrix { data, n_embd });
            }
            Some(out)
        }
    }
}

/// Selects one layer or the float32 mean across all of them.
fn reduce(layers: &[Matrix], select: LayerSelect) -> Option<Matrix> {
    match select {
        LayerSelect::Layer(i) => {
            let layer = match layers.get(i) {
                Some(layer) => layer,
                None => {
                    log::warn!("layer {} out of range ({} layers)", i, layers.len());
                    return None;
                }
            };
            Some(Matrix { data: layer.data.clone(), n_embd: layer.n_embd })
        }
        LayerSelect::MeanAll => {
            let first = layers.first()?;
            if layers.iter().any(|l| l.n_embd != first.n_embd || l.data.len() != first.data.len())
            {
                log::warn!("inconsistent layer shapes; abandoning reduction");
                return None;
            }
            let mut data = vec![0.0f32; first.data.len()];
            for layer in layers {
                for (acc, v) in data.iter_mut().zip(&layer.data) {
                    *acc += v;
                }
            }
            let n = layers.len() as f32;
            for acc in &mut data {
                *acc /= n;
            }
            Some(Matrix { data, n_embd: first.n_embd })
        }
    }
}

/// Applies the `[start, end)` position filter, preserving original order.
fn filter_range(
    keys: Matrix,
    values: Matrix,
    positions: Vec<i32>,
    range: Option<(i32, i32)>,
) -> Option<(Matrix, Matrix, Vec<i32>)> {
    let (start, end) = match range {
        None => return Some((keys, values, positions)),
        Some(range) => range,
    };
    let picked: Vec<usize> =
        (0..positions.len()).filter(|&i| positions[i] >= start && positions[i] < end).collect();
    if picked.is_empty() {
        return None;
    }
    let gather = |m: &Matrix| Matrix {
        data: picked
            .iter()
            .flat_map(|&i| m.data[i * m.n_embd..(i + 1) * m.n_embd].iter().copied())
            .collect(),
        n_embd: m.n_embd,
    };
    let filtered_positions = picked.iter().map(|&i| positions[i]).collect();
    Some((gather(&keys), gather(&values), filtered_positions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sublimate::dequant::{encode_f32, TAG_F32};
    use crate::sublimate::state::{CellMeta, TensorRows};

    /// A runtime stand-in backed by a pre-encoded state buffer.
    struct MockSource {
        bytes: Vec<u8>,
        n_embd: usize,
        embeddings: Option<Vec<f32>>,
    }

    impl KvStateSource for MockSource {
        fn n_layer(&self) -> usize {
            3
        }
        fn n_embd(&self) -> usize {
            self.n_embd
        }
        fn n_head_kv(&self) -> usize {
            1
        }
        fn state_seq_size(&self, _seq_id: u32) -> usize {
            self.bytes.len()
        }
        fn state_seq_copy(&self, _seq_id: u32, buf: &mut [u8]) -> usize {
            let n = buf.len().min(self.bytes.len());
            buf[..n].copy_from_slice(&self.bytes[..n]);
            n
        }
        fn embeddings(&self) -> Option<&[f32]> {
            self.embeddings.as_deref()
        }
    }

    fn layer(rows: &[f32]) -> TensorRows {
        TensorRows { dtype: TAG_F32, bytes_per_row: 8, payload: encode_f32(rows) }
    }

    /// Three layers, two tokens, two dims; layer constants 1, 3, 5.
    fn three_layer_source() -> MockSource {
        let state = SeqState {
            cells: vec![
                CellMeta { pos: 0, seq_ids: vec![0] },
                CellMeta { pos: 1, seq_ids: vec![0] },
            ],
            keys: vec![
                layer(&[1.0, 1.0, 1.0, 1.0]),
                layer(&[3.0, 3.0, 3.0, 3.0]),
                layer(&[5.0, 5.0, 5.0, 5.0]),
            ],
            values: ValueLayout::RowMajor(vec![
                layer(&[1.0, 1.0, 1.0, 1.0]),
                layer(&[3.0, 3.0, 3.0, 3.0]),
                layer(&[5.0, 5.0, 5.0, 5.0]),
            ]),
        };
        MockSource { bytes: state.encode(), n_embd: 2, embeddings: None }
    }

    #[test]
    fn mean_across_layers() {
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:mean");
        let block = sublimator
            .sublimate(&three_layer_source(), &request, &CancelToken::new())
            .unwrap()
            .unwrap();

        assert_eq!(block.n_tokens, 2);
        assert_eq!(block.keys, vec![3.0, 3.0, 3.0, 3.0]);
        assert_eq!(block.values, vec![3.0, 3.0, 3.0, 3.0]);
        assert_eq!(block.positions, vec![0, 1]);
    }

    #[test]
    fn single_layer_verbatim() {
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:layer2").with_layer(2);
        let block = sublimator
            .sublimate(&three_layer_source(), &request, &CancelToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(block.keys, vec![5.0, 5.0, 5.0, 5.0]);
    }

    #[test]
    fn out_of_range_layer_is_sentinel() {
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:bad").with_layer(9);
        let block =
            sublimator.sublimate(&three_layer_source(), &request, &CancelToken::new()).unwrap();
        assert!(block.is_none());
    }

    #[test]
    fn range_filter_preserves_order() {
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:ranged").with_range(1, 2);
        let block = sublimator
            .sublimate(&three_layer_source(), &request, &CancelToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(block.positions, vec![1]);
        assert_eq!(block.n_tokens, 1);
        assert_eq!(block.keys.len(), 2);
    }

    #[test]
    fn empty_range_is_sentinel() {
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:empty").with_range(100, 200);
        let block =
            sublimator.sublimate(&three_layer_source(), &request, &CancelToken::new()).unwrap();
        assert!(block.is_none());
    }

    #[test]
    fn caller_summary_wins_over_embeddings() {
        let mut source = three_layer_source();
        source.embeddings = Some(vec![9.0, 9.0]);
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:s").with_summary(vec![1.0, 0.0]);
        let block =
            sublimator.sublimate(&source, &request, &CancelToken::new()).unwrap().unwrap();
        assert_eq!(block.summary, Some(vec![1.0, 0.0]));
    }

    #[test]
    fn embeddings_fallback_then_none() {
        let mut source = three_layer_source();
        source.embeddings = Some(vec![9.0, 8.0, 7.0]);
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:s");
        let block =
            sublimator.sublimate(&source, &request, &CancelToken::new()).unwrap().unwrap();
        assert_eq!(block.summary, Some(vec![9.0, 8.0]));

        let source = three_layer_source();
        let block =
            sublimator.sublimate(&source, &request, &CancelToken::new()).unwrap().unwrap();
        assert_eq!(block.summary, None);
    }

    #[test]
    fn truncated_state_is_sentinel() {
        let mut source = three_layer_source();
        source.bytes.truncate(source.bytes.len() / 2);
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:trunc");
        assert!(sublimator
            .sublimate(&source, &request, &CancelToken::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn zero_cells_is_sentinel() {
        let state = SeqState {
            cells: vec![],
            keys: vec![TensorRows { dtype: TAG_F32, bytes_per_row: 8, payload: vec![] }],
            values: ValueLayout::RowMajor(vec![TensorRows {
                dtype: TAG_F32,
                bytes_per_row: 8,
                payload: vec![],
            }]),
        };
        let source = MockSource { bytes: state.encode(), n_embd: 2, embeddings: None };
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:none");
        assert!(sublimator
            .sublimate(&source, &request, &CancelToken::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn cancellation_yields_no_block() {
        let source = three_layer_source();
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:c");
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(sublimator.sublimate(&source, &request, &cancel).unwrap().is_none());
    }

    #[test]
    fn transposed_values_match_row_major() {
        // Row-major values [[1,2],[3,4]] stored transposed as dim rows
        // [1,3] and [2,4].
        let cells = vec![
            CellMeta { pos: 0, seq_ids: vec![0] },
            CellMeta { pos: 1, seq_ids: vec![0] },
        ];
        let keys = vec![layer(&[0.0, 0.0, 0.0, 0.0])];
        let state = SeqState {
            cells,
            keys: keys.clone(),
            values: ValueLayout::Transposed(vec![
                crate::sublimate::state::TransposedRows {
                    dtype: TAG_F32,
                    bytes_per_element: 4,
                    n_embd: 2,
                    payload: encode_f32(&[1.0, 3.0, 2.0, 4.0]),
                },
            ]),
        };
        let source = MockSource { bytes: state.encode(), n_embd: 2, embeddings: None };
        let sublimator = Sublimator::new(2);
        let request = SublimateRequest::new(0, "fact:t").with_layer(0);
        let block =
            sublimator.sublimate(&source, &request, &CancelToken::new()).unwrap().unwrap();
        assert_eq!(block.values, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
