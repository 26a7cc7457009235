//! Join-key serialization and hashing.
//!
//! The engine keys a join on an ordered tuple of columns. Each key column is
//! serialized to a binary form chosen so that byte equality coincides with
//! semantic equality:
//!
//! - integers: 8-byte little-endian
//! - floats: IEEE bit pattern, little-endian, with `-0.0` folded to `+0.0`
//! - text/binary: `u32` little-endian length prefix, then the bytes
//! - a column with `null_eq_null` gains a leading marker byte (`0` = null,
//!   `1` = value) so that null compares equal to null and unequal to any
//!   value
//!
//! The length prefix keeps composite keys unambiguous: `("x", "y")` and
//! `("xy", "")` serialize to different byte strings.

use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use crate::batch::{Batch, BatchFormatError};
use crate::value::DataType;

/// One column of the join key tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColumn {
    /// Index of the column in its side's schema.
    pub column: usize,
    pub dtype: DataType,
    /// Treat null as a key value equal to itself. Default join semantics
    /// (null never matches) leave this unset.
    pub null_eq_null: bool,
}

impl KeyColumn {
    #[must_use]
    pub fn new(column: usize, dtype: DataType) -> Self {
        Self {
            column,
            dtype,
            null_eq_null: false,
        }
    }

    #[must_use]
    pub fn with_null_eq_null(mut self) -> Self {
        self.null_eq_null = true;
        self
    }

    /// Serialized width of one cell, when constant.
    #[must_use]
    fn serialized_width(&self) -> Option<usize> {
        let marker = usize::from(self.null_eq_null);
        self.dtype.fixed_size().map(|w| w + marker)
    }
}

/// Ordered key tuple of one join side.
///
/// The build and probe sides each carry their own schema (their column
/// indexes differ); the two must agree position by position on type and
/// null semantics for serialized keys to be comparable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKeySchema {
    columns: SmallVec<[KeyColumn; 4]>,
}

impl JoinKeySchema {
    #[must_use]
    pub fn new(columns: Vec<KeyColumn>) -> Self {
        Self {
            columns: SmallVec::from_vec(columns),
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[KeyColumn] {
        &self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn has_null_eq_null(&self) -> bool {
        self.columns.iter().any(|c| c.null_eq_null)
    }

    /// Total serialized width when every key column serializes to a fixed
    /// number of bytes; `None` as soon as one column is variable-width.
    #[must_use]
    pub fn fixed_serialized_width(&self) -> Option<usize> {
        self.columns
            .iter()
            .map(KeyColumn::serialized_width)
            .try_fold(0usize, |acc, w| w.map(|w| acc + w))
    }

    /// Serialize and hash the key tuple of every row in `batch`.
    ///
    /// # Errors
    ///
    /// Returns an error when a key column index is out of bounds or its type
    /// does not match the schema.
    pub fn serialize(&self, batch: &Batch) -> Result<SerializedKeys, BatchFormatError> {
        for key in &self.columns {
            let column = batch.column(key.column)?;
            if column.spec.dtype != key.dtype {
                return Err(BatchFormatError::TypeMismatch {
                    column: column.spec.name.clone(),
                    expected: key.dtype.to_string(),
                });
            }
        }

        let rows = batch.num_rows();
        let mut out = SerializedKeys {
            offsets: Vec::with_capacity(rows + 1),
            bytes: Vec::new(),
            valid: vec![true; rows],
            hashes: Vec::with_capacity(rows),
        };
        out.offsets.push(0);

        for row in 0..rows {
            for key in &self.columns {
                let column = batch.column(key.column)?;
                let is_null = !column.validity.is_valid(row);
                if is_null && !key.null_eq_null {
                    out.valid[row] = false;
                    continue;
                }
                if key.null_eq_null {
                    out.bytes.push(u8::from(!is_null));
                    if is_null {
                        // Width must stay constant for fixed keys; a null
                        // cell contributes zero bytes of value.
                        if let Some(width) = key.dtype.fixed_size() {
                            out.bytes.extend(std::iter::repeat_n(0u8, width));
                        } else {
                            out.bytes.extend_from_slice(&0u32.to_le_bytes());
                        }
                        continue;
                    }
                }
                match key.dtype {
                    DataType::Int => {
                        out.bytes.extend_from_slice(&column.fixed_le_bytes(row)?);
                    }
                    DataType::Float => {
                        let raw = column.fixed_le_bytes(row)?;
                        let bits = normalize_float_bits(u64::from_le_bytes(raw));
                        out.bytes.extend_from_slice(&bits.to_le_bytes());
                    }
                    DataType::Text | DataType::Binary => {
                        let cell = column.var_bytes(row)?;
                        out.bytes.extend_from_slice(&(cell.len() as u32).to_le_bytes());
                        out.bytes.extend_from_slice(cell);
                    }
                }
            }
            let start = *out.offsets.last().unwrap_or(&0);
            out.hashes.push(xxh3_64(&out.bytes[start..]));
            out.offsets.push(out.bytes.len());
        }
        Ok(out)
    }
}

/// Fold `-0.0` into `+0.0` so the two equal floats share one bit pattern.
fn normalize_float_bits(bits: u64) -> u64 {
    const NEG_ZERO: u64 = 0x8000_0000_0000_0000;
    if bits == NEG_ZERO { 0 } else { bits }
}

/// Per-row serialized key blobs, validity, and hashes for one batch.
#[derive(Debug, Clone)]
pub struct SerializedKeys {
    offsets: Vec<usize>,
    bytes: Vec<u8>,
    valid: Vec<bool>,
    hashes: Vec<u64>,
}

impl SerializedKeys {
    #[must_use]
    pub fn len(&self) -> usize {
        self.valid.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    /// Serialized key bytes of one row.
    #[must_use]
    pub fn key(&self, row: usize) -> &[u8] {
        &self.bytes[self.offsets[row]..self.offsets[row + 1]]
    }

    /// False when the row's key contains a disqualifying null.
    #[must_use]
    pub fn is_valid(&self, row: usize) -> bool {
        self.valid[row]
    }

    /// 64-bit hash of the row's serialized key.
    #[must_use]
    pub fn hash(&self, row: usize) -> u64 {
        self.hashes[row]
    }
}
