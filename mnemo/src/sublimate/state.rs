//! The serialized per-sequence KV state, treated as a wire format.
//!
//! The layout must stay byte-for-byte compatible with the runtime's own
//! writer, so this module carries both the decoder and an encoder and the
//! two are exact mirrors. All integers are little-endian.
//!
//! Layout:
//!
//! - `n_stream` as u32; only stream 0 is consumed.
//! - `cell_count` as u32.
//! - per cell: `pos` i32, `n_seq_id` u32, `n_seq_id × i32` seq ids.
//! - `v_transposed` as u32 (0 row-major, 1 transposed).
//! - `n_layer` as u32.
//! - per layer, keys: `dtype` i32, `bytes_per_row` u64,
//!   `cell_count × bytes_per_row` payload bytes.
//! - per layer, values: same as keys when row-major; when transposed,
//!   `dtype` i32, `bytes_per_element` u32, `n_embd_v_gqa` u32, then
//!   `n_embd_v_gqa` rows of `cell_count × bytes_per_element` bytes.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::error::{Error, MResult};

/// Per-cell metadata. The seq ids are carried for encode symmetry but are
/// not consumed by sublimation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CellMeta {
    pub pos: i32,
    pub seq_ids: Vec<i32>,
}

/// One layer's rows in the row-major encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorRows {
    pub dtype: i32,
    pub bytes_per_row: u64,
    /// `cell_count × bytes_per_row` bytes.
    pub payload: Vec<u8>,
}

/// One layer's values in the transposed encoding: `n_embd` rows of
/// `cell_count × bytes_per_element` bytes each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransposedRows {
    pub dtype: i32,
    pub bytes_per_element: u32,
    pub n_embd: u32,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueLayout {
    RowMajor(Vec<TensorRows>),
    Transposed(Vec<TransposedRows>),
}

/// A decoded per-sequence KV state (stream 0 only).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeqState {
    pub cells: Vec<CellMeta>,
    pub keys: Vec<TensorRows>,
    pub values: ValueLayout,
}

impl SeqState {
    pub fn n_layer(&self) -> usize {
        self.keys.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn v_transposed(&self) -> bool {
        matches!(self.values, ValueLayout::Transposed(_))
    }

    /// Decodes a serialized state buffer. Truncation and inconsistent
    /// counts are parse errors; unknown dtypes are not (they surface later
    /// as zero-filled rows).
    pub fn decode(buf: &[u8]) -> MResult<SeqState> {
        let mut r = Cursor::new(buf);

        let n_stream = read_u32(&mut r, "n_stream")?;
        if n_stream == 0 {
            return Err(Error::Parse("state has no streams".to_string()));
        }

        let cell_count = read_u32(&mut r, "cell_count")? as usize;
        let mut cells = Vec::with_capacity(cell_count.min(1 << 20));
        for _ in 0..cell_count {
            let pos = read_i32(&mut r, "cell pos")?;
            let n_seq_id = read_u32(&mut r, "n_seq_id")? as usize;
            let mut seq_ids = Vec::with_capacity(n_seq_id.min(1 << 10));
            for _ in 0..n_seq_id {
                seq_ids.push(read_i32(&mut r, "seq id")?);
            }
            cells.push(CellMeta { pos, seq_ids });
        }

        let v_transposed = read_u32(&mut r, "v_transposed")? != 0;
        let n_layer = read_u32(&mut r, "n_layer")? as usize;
        if n_layer == 0 {
            return Err(Error::Parse("state has no layers".to_string()));
        }

        let mut keys = Vec::with_capacity(n_layer);
        for _ in 0..n_layer {
            keys.push(read_tensor_rows(&mut r, cell_count)?);
        }

        let values = if v_transposed {
            let mut layers = Vec::with_capacity(n_layer);
            for _ in 0..n_layer {
                let dtype = read_i32(&mut r, "value dtype")?;
                let bytes_per_element = read_u32(&mut r, "bytes_per_element")?;
                let n_embd = read_u32(&mut r, "n_embd_v_gqa")?;
                let len = n_embd as usize * cell_count * bytes_per_element as usize;
                let payload = read_bytes(&mut r, len, "transposed values")?;
                layers.push(TransposedRows { dtype, bytes_per_element, n_embd, payload });
            }
            ValueLayout::Transposed(layers)
        } else {
            let mut layers = Vec::with_capacity(n_layer);
            for _ in 0..n_layer {
                layers.push(read_tensor_rows(&mut r, cell_count)?);
            }
            ValueLayout::RowMajor(layers)
        };

        Ok(SeqState { cells, keys, values })
    }

    /// Encodes the state back into the wire layout. `decode(encode(s)) == s`
    /// and byte streams round-trip exactly.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_hint());

        buf.put_u32_le(1); // n_stream
        buf.put_u32_le(self.cells.len() as u32);
        for cell in &self.cells {
            buf.put_i32_le(cell.pos);
            buf.put_u32_le(cell.seq_ids.len() as u32);
            for &id in &cell.seq_ids {
                buf.put_i32_le(id);
            }
        }

        buf.put_u32_le(self.v_transposed() as u32);
        buf.put_u32_le(self.keys.len() as u32);
        for layer in &self.keys {
            put_tensor_rows(&mut buf, layer);
        }
        match &self.values {
            ValueLayout::RowMajor(layers) => {
                for layer in layers {
                    put_tensor_rows(&mut buf, layer);
                }
            }
            ValueLayout::Transposed(layers) => {
                for layer in layers {
                    buf.put_i32_le(layer.dtype);
                    buf.put_u32_le(layer.bytes_per_element);
                    buf.put_u32_le(layer.n_embd);
                    buf.put_slice(&layer.payload);
                }
            }
        }

        buf.to_vec()
    }

    fn encoded_hint(&self) -> usize {
        let cells = self.cells.iter().map(|c| 8 + 4 * c.seq_ids.len()).sum::<usize>();
        let keys = self.keys.iter().map(|l| 12 + l.payload.len()).sum::<usize>();
        let values = match &self.values {
            ValueLayout::RowMajor(layers) => {
                layers.iter().map(|l| 12 + l.payload.len()).sum::<usize>()
            }
            ValueLayout::Transposed(layers) => {
                layers.iter().map(|l| 12 + l.payload.len()).sum::<usize>()
            }
        };
        16 + cells + keys + values
    }
}

fn read_u32(r: &mut Cursor<&[u8]>, what: &str) -> MResult<u32> {
    r.read_u32::<LittleEndian>()
        .map_err(|_| Error::Parse(format!("state truncated reading {}", what)))
}

fn read_i32(r: &mut Cursor<&[u8]>, what: &str) -> MResult<i32> {
    r.read_i32::<LittleEndian>()
        .map_err(|_| Error::Parse(format!("state truncated reading {}", what)))
}

fn read_bytes(r: &mut Cursor<&[u8]>, len: usize, what: &str) -> MResult<Vec<u8>> {
    let remaining = r.get_ref().len().saturating_sub(r.position() as usize);
    if remaining < len {
        return Err(Error::Parse(format!(
            "state truncated reading {}: need {} bytes, have {}",
            what, len, remaining
        )));
    }
    let mut bytes = vec![0; len];
    r.read_exact(&mut bytes)
        .map_err(|_| Error::Parse(format!("state truncated reading {}", what)))?;
    Ok(bytes)
}

fn read_tensor_rows(r: &mut Cursor<&[u8]>, cell_count: usize) -> MResult<TensorRows> {
    let dtype = read_i32(r, "key dtype")?;
    let bytes_per_row = r
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::Parse("state truncated reading bytes_per_row".to_string()))?;
    let payload = read_bytes(r, cell_count * bytes_per_row as usize, "tensor rows")?;
    Ok(TensorRows { dtype, bytes_per_row, payload })
}

fn put_tensor_rows(buf: &mut BytesMut, layer: &TensorRows) {
    buf.put_i32_le(layer.dtype);
    buf.put_u64_le(layer.bytes_per_row);
    buf.put_slice(&layer.payload);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sublimate::dequant::{encode_f32, TAG_F32};

    fn f32_state(v_transposed: bool) -> SeqState {
        // Two cells, two layers, two elements per row.
        let cells = vec![
            CellMeta { pos: 0, seq_ids: vec![0] },
            CellMeta { pos: 1, seq_ids: vec![0, 3] },
        ];
        let keys = vec![
            TensorRows { dtype: TAG_F32, bytes_per_row: 8, payload: encode_f32(&[1.0, 2.0, 3.0, 4.0]) },
            TensorRows { dtype: TAG_F32, bytes_per_row: 8, payload: encode_f32(&[5.0, 6.0, 7.0, 8.0]) },
        ];
        let values = if v_transposed {
            ValueLayout::Transposed(
                (0..2)
                    .map(|l| TransposedRows {
                        dtype: TAG_F32,
                        bytes_per_element: 4,
                        n_embd: 2,
                        // Rows are embedding dims: [v(c0,e), v(c1,e)].
                        payload: encode_f32(&[l as f32, 10.0, 20.0, 30.0]),
                    })
                    .collect(),
            )
        } else {
            ValueLayout::RowMajor(keys.clone())
        };
        SeqState { cells, keys, values }
    }

    #[test]
    fn encode_decode_round_trip() {
        for transposed in [false, true] {
            let state = f32_state(transposed);
            let bytes = state.encode();
            let decoded = SeqState::decode(&bytes).unwrap();
            assert_eq!(decoded, state);
            // Byte-for-byte stability.
            assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn truncation_is_a_parse_error_at_every_prefix() {
        let bytes = f32_state(false).encode();
        for len in 0..bytes.len() {
            assert!(SeqState::decode(&bytes[..len]).is_err(), "prefix {} decoded", len);
        }
        assert!(SeqState::decode(&bytes).is_ok());
    }

    #[test]
    fn zero_layers_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1); // n_stream
        buf.put_u32_le(0); // cell_count
        buf.put_u32_le(0); // v_transposed
        buf.put_u32_le(0); // n_layer
        assert!(SeqState::decode(&buf).is_err());
    }

    #[test]
    fn zero_streams_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        assert!(SeqState::decode(&buf).is_err());
    }

    #[test]
    fn empty_cells_decode_to_empty_state() {
        let state = SeqState {
            cells: vec![],
            keys: vec![TensorRows { dtype: TAG_F32, bytes_per_row: 8, payload: vec![] }],
            values: ValueLayout::RowMajor(vec![TensorRows {
                dtype: TAG_F32,
                bytes_per_row: 8,
                payload: vec![],
            }]),
        };
        let decoded = SeqState::decode(&state.encode()).unwrap();
        assert_eq!(decoded.cell_count(), 0);
    }
}
