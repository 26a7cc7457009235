//! Build-row byte layout.
//!
//! [`TableMeta`] is the pure description of how one build row is stored in a
//! segment arena. It is computed once per join from the build schema, the
//! key schema, and the residual-predicate column set, and carries no runtime
//! state.
//!
//! Row bytes, contiguous:
//!
//! ```text
//! [null_map (one bit per column, row order, padded to bytes)]
//! [when keys are not inlined: key_len (4B LE) | serialized_key]
//! [row_data: columns in row order; fixed = 8 raw bytes,
//!  variable = 4B LE length + bytes]
//! ```
//!
//! Columns are reordered inside `row_data` so that the bytes the probe needs
//! first come first: inlined key columns, then residual-predicate columns,
//! then the rest in schema order.

use strata_batch::{Batch, ColumnBuilder, ColumnSpec, DataType, JoinKeySchema, SerializedKeys};
use strata_error::{Result, StrataError};

/// How probe keys are compared against stored rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Single fixed-width integer key; an 8-byte compare.
    OneInt,
    /// Concatenated serialized keys of fixed total width.
    FixedSerialized { width: usize },
    /// At least one variable-width key column; blobs carry length prefixes.
    VariableSerialized,
}

/// Width of one fixed-size cell in `row_data`.
const FIXED_CELL: usize = 8;

/// Pure description of the build-row layout plus its encode/decode/compare
/// operations.
#[derive(Debug, Clone)]
pub struct TableMeta {
    key_mode: KeyMode,
    joinkeys_inlined: bool,
    null_map_len: usize,
    /// `row_data` position -> build schema column index.
    row_columns_order: Vec<usize>,
    /// Build schema column index -> `row_data` position.
    column_pos_in_row: Vec<usize>,
    /// Cell width by `row_data` position; `None` marks a variable column.
    columns_size: Vec<Option<usize>>,
    /// Column type by `row_data` position.
    column_types: Vec<DataType>,
}

impl TableMeta {
    /// Derive the layout for one join.
    pub fn new(
        build_schema: &[ColumnSpec],
        build_keys: &JoinKeySchema,
        predicate_cols: &[usize],
    ) -> Self {
        let key_mode = derive_key_mode(build_keys);
        let joinkeys_inlined = derive_inlined(build_keys);

        let key_cols: Vec<usize> = build_keys.columns().iter().map(|k| k.column).collect();
        let mut order: Vec<usize> = Vec::with_capacity(build_schema.len());
        let mut placed = vec![false; build_schema.len()];
        let mut place = |order: &mut Vec<usize>, placed: &mut Vec<bool>, col: usize| {
            if !placed[col] {
                placed[col] = true;
                order.push(col);
            }
        };

        if joinkeys_inlined {
            for &col in &key_cols {
                place(&mut order, &mut placed, col);
            }
        }
        if !predicate_cols.is_empty() {
            for &col in predicate_cols {
                place(&mut order, &mut placed, col);
            }
        }
        for col in 0..build_schema.len() {
            place(&mut order, &mut placed, col);
        }

        let mut column_pos_in_row = vec![0usize; build_schema.len()];
        for (pos, &col) in order.iter().enumerate() {
            column_pos_in_row[col] = pos;
        }
        let columns_size: Vec<Option<usize>> = order
            .iter()
            .map(|&col| build_schema[col].dtype.fixed_size())
            .collect();
        let column_types: Vec<DataType> =
            order.iter().map(|&col| build_schema[col].dtype).collect();

        Self {
            key_mode,
            joinkeys_inlined,
            null_map_len: build_schema.len().div_ceil(8),
            row_columns_order: order,
            column_pos_in_row,
            columns_size,
            column_types,
        }
    }

    pub fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    pub fn joinkeys_inlined(&self) -> bool {
        self.joinkeys_inlined
    }

    /// Number of columns in `row_data`.
    pub fn column_count(&self) -> usize {
        self.row_columns_order.len()
    }

    /// Build-schema column stored at a `row_data` position.
    pub fn column_at_position(&self, pos: usize) -> usize {
        self.row_columns_order[pos]
    }

    // ── Encode ─────────────────────────────────────────────────────────────

    /// Append row `row` of `batch` to `arena` in this layout.
    pub(crate) fn encode_row(
        &self,
        batch: &Batch,
        row: usize,
        keys: &SerializedKeys,
        arena: &mut Vec<u8>,
    ) -> Result<()> {
        let null_map_start = arena.len();
        arena.resize(null_map_start + self.null_map_len, 0);
        for (pos, &col) in self.row_columns_order.iter().enumerate() {
            if !batch.column(col)?.validity.is_valid(row) {
                arena[null_map_start + pos / 8] |= 1 << (pos % 8);
            }
        }

        if !self.joinkeys_inlined {
            let key = keys.key(row);
            arena.extend_from_slice(&(key.len() as u32).to_le_bytes());
            arena.extend_from_slice(key);
        }

        for (pos, &col) in self.row_columns_order.iter().enumerate() {
            let column = batch.column(col)?;
            let is_null = !column.validity.is_valid(row);
            match self.columns_size[pos] {
                Some(_) => {
                    if is_null {
                        arena.extend_from_slice(&[0u8; FIXED_CELL]);
                    } else {
                        arena.extend_from_slice(&column.fixed_le_bytes(row)?);
                    }
                }
                None => {
                    if is_null {
                        arena.extend_from_slice(&0u32.to_le_bytes());
                    } else {
                        let cell = column.var_bytes(row)?;
                        arena.extend_from_slice(&(cell.len() as u32).to_le_bytes());
                        arena.extend_from_slice(cell);
                    }
                }
            }
        }
        Ok(())
    }

    // ── Key access ─────────────────────────────────────────────────────────

    /// The stored key bytes of a row, comparable to a probe row's serialized
    /// key.
    pub(crate) fn key_bytes<'a>(&self, row_bytes: &'a [u8]) -> Result<&'a [u8]> {
        if self.joinkeys_inlined {
            let start = self.null_map_len;
            match self.key_mode {
                KeyMode::OneInt => slice_at(row_bytes, start, FIXED_CELL),
                KeyMode::FixedSerialized { width } => slice_at(row_bytes, start, width),
                KeyMode::VariableSerialized => {
                    // Single variable key column stored first; its
                    // length-prefixed cell is exactly the serialized form.
                    let len = read_u32(row_bytes, start)? as usize;
                    slice_at(row_bytes, start, 4 + len)
                }
            }
        } else {
            let len = read_u32(row_bytes, self.null_map_len)? as usize;
            slice_at(row_bytes, self.null_map_len + 4, len)
        }
    }

    /// Compare a stored row's key against a probe row's serialized key.
    pub(crate) fn keys_match(&self, row_bytes: &[u8], probe_key: &[u8]) -> Result<bool> {
        match self.key_mode {
            KeyMode::OneInt => {
                let stored = slice_at(row_bytes, self.null_map_len, FIXED_CELL)?;
                if probe_key.len() != FIXED_CELL {
                    return Ok(false);
                }
                Ok(u64::from_le_bytes(stored.try_into().expect("8-byte slice"))
                    == u64::from_le_bytes(probe_key.try_into().expect("8-byte slice")))
            }
            KeyMode::FixedSerialized { .. } | KeyMode::VariableSerialized => {
                // Slice equality compares lengths first, then bytes.
                Ok(self.key_bytes(row_bytes)? == probe_key)
            }
        }
    }

    // ── Decode ─────────────────────────────────────────────────────────────

    /// Where `row_data` starts within a row.
    fn row_data_start(&self, row_bytes: &[u8]) -> Result<usize> {
        if self.joinkeys_inlined {
            Ok(self.null_map_len)
        } else {
            let key_len = read_u32(row_bytes, self.null_map_len)? as usize;
            Ok(self.null_map_len + 4 + key_len)
        }
    }

    pub(crate) fn is_null_at_position(&self, row_bytes: &[u8], pos: usize) -> bool {
        row_bytes[pos / 8] & (1 << (pos % 8)) != 0
    }

    /// Decode selected cells into column builders.
    ///
    /// `positions` pairs a `row_data` position with the index of the builder
    /// that receives it, and must be sorted by position; see
    /// [`TableMeta::decode_plan`]. The walk stops as soon as every requested
    /// position has been served, which is why the layout front-loads the
    /// columns the probe touches most.
    pub(crate) fn decode_positions(
        &self,
        row_bytes: &[u8],
        positions: &[(usize, usize)],
        builders: &mut [ColumnBuilder],
    ) -> Result<()> {
        let mut wanted = positions.iter().peekable();
        let mut offset = self.row_data_start(row_bytes)?;
        for pos in 0..self.row_columns_order.len() {
            let Some(&&(next_pos, builder_idx)) = wanted.peek() else {
                break;
            };
            let is_null = self.is_null_at_position(row_bytes, pos);
            let cell_len = match self.columns_size[pos] {
                Some(width) => width,
                None => {
                    if is_null {
                        4
                    } else {
                        4 + read_u32(row_bytes, offset)? as usize
                    }
                }
            };
            if pos == next_pos {
                wanted.next();
                let builder = &mut builders[builder_idx];
                if is_null {
                    builder.append_null();
                } else {
                    match self.columns_size[pos] {
                        Some(width) => {
                            let cell = slice_at(row_bytes, offset, width)?;
                            builder.append_fixed_le_bytes(
                                cell.try_into().expect("fixed cell is 8 bytes"),
                            );
                        }
                        None => {
                            let cell = slice_at(row_bytes, offset + 4, cell_len - 4)?;
                            builder.append_var_bytes(cell);
                        }
                    }
                }
            }
            offset += cell_len;
        }
        if wanted.peek().is_some() {
            return Err(StrataError::InvariantViolated(
                "decode plan requests a position past the row layout".into(),
            ));
        }
        Ok(())
    }

    /// Precompute the `(position, builder index)` pairs for a set of schema
    /// columns, where `cols[i]` decodes into `builders[i]`.
    pub(crate) fn decode_plan(&self, cols: impl Iterator<Item = usize>) -> Vec<(usize, usize)> {
        let mut plan: Vec<(usize, usize)> = cols
            .enumerate()
            .map(|(builder_idx, col)| (self.column_pos_in_row[col], builder_idx))
            .collect();
        plan.sort_unstable();
        plan
    }
}

fn derive_key_mode(keys: &JoinKeySchema) -> KeyMode {
    let cols = keys.columns();
    if cols.len() == 1 && cols[0].dtype == DataType::Int && !cols[0].null_eq_null {
        return KeyMode::OneInt;
    }
    match keys.fixed_serialized_width() {
        Some(width) => KeyMode::FixedSerialized { width },
        None => KeyMode::VariableSerialized,
    }
}

/// Keys are inlined when the stored `row_data` bytes of the key columns are
/// byte-identical to the serialized key:
///
/// - every key column is an integer (floats normalize `-0.0` during
///   serialization, so their raw storage differs), or
/// - the key is a single variable-width column, whose stored
///   length-prefixed cell equals its serialized form.
///
/// A `null_eq_null` column adds marker bytes to the serialized key that the
/// raw row bytes do not have, so it always forces a stored key blob.
fn derive_inlined(keys: &JoinKeySchema) -> bool {
    if keys.has_null_eq_null() {
        return false;
    }
    let cols = keys.columns();
    if cols.iter().all(|k| k.dtype == DataType::Int) {
        return true;
    }
    cols.len() == 1 && !cols[0].dtype.is_fixed()
}

fn slice_at(bytes: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    bytes.get(start..start + len).ok_or_else(|| {
        StrataError::InvariantViolated(format!(
            "row access [{start}, {}) outside row of {} bytes",
            start + len,
            bytes.len()
        ))
    })
}

fn read_u32(bytes: &[u8], start: usize) -> Result<u32> {
    let raw = slice_at(bytes, start, 4)?;
    Ok(u32::from_le_bytes(raw.try_into().expect("4-byte slice")))
}
