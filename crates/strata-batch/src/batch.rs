//! Column batches: validity bitmaps, typed column storage, batch assembly.

pub use strata_error::BatchFormatError;

use crate::value::{DataType, Value};

// ── NullBitmap ─────────────────────────────────────────────────────────────

/// Byte-packed validity bitmap; one bit per row, set = valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NullBitmap {
    bytes: Vec<u8>,
    len: usize,
}

impl NullBitmap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A bitmap of `len` rows, all valid.
    #[must_use]
    pub fn new_valid(len: usize) -> Self {
        Self {
            bytes: vec![0xFF; len.div_ceil(8)],
            len,
        }
    }

    #[must_use]
    pub fn from_bools(bits: &[bool]) -> Self {
        let mut bitmap = Self::new();
        for &valid in bits {
            bitmap.push(valid);
        }
        bitmap
    }

    pub fn push(&mut self, valid: bool) {
        let bit = self.len % 8;
        if bit == 0 {
            self.bytes.push(0);
        }
        if valid {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << bit;
        }
        self.len += 1;
    }

    /// Validity of `row`. Rows past the end read as invalid.
    #[must_use]
    pub fn is_valid(&self, row: usize) -> bool {
        if row >= self.len {
            return false;
        }
        self.bytes[row / 8] & (1 << (row % 8)) != 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of valid rows.
    #[must_use]
    pub fn count_valid(&self) -> usize {
        (0..self.len).filter(|&row| self.is_valid(row)).count()
    }
}

// ── Columns ────────────────────────────────────────────────────────────────

/// Column name and logical type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub dtype: DataType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Typed column storage. Variable-width variants keep `rows + 1` offsets
/// into a shared byte buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Text { offsets: Vec<u32>, bytes: Vec<u8> },
    Binary { offsets: Vec<u32>, bytes: Vec<u8> },
}

impl ColumnData {
    /// Empty storage for a column of type `dtype`.
    #[must_use]
    pub fn empty(dtype: DataType) -> Self {
        match dtype {
            DataType::Int => Self::Int(Vec::new()),
            DataType::Float => Self::Float(Vec::new()),
            DataType::Text => Self::Text {
                offsets: vec![0],
                bytes: Vec::new(),
            },
            DataType::Binary => Self::Binary {
                offsets: vec![0],
                bytes: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int(_) => DataType::Int,
            Self::Float(_) => DataType::Float,
            Self::Text { .. } => DataType::Text,
            Self::Binary { .. } => DataType::Binary,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(values) => values.len(),
            Self::Float(values) => values.len(),
            Self::Text { offsets, .. } | Self::Binary { offsets, .. } => offsets.len() - 1,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One column of a batch: spec, storage, and per-row validity.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub spec: ColumnSpec,
    pub data: ColumnData,
    pub validity: NullBitmap,
}

impl Column {
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read one cell as an owned [`Value`]. Invalid rows read as null.
    pub fn value(&self, row: usize) -> Result<Value, BatchFormatError> {
        if row >= self.len() {
            return Err(BatchFormatError::RowIndexOutOfBounds {
                row,
                rows: self.len(),
            });
        }
        if !self.validity.is_valid(row) {
            return Ok(Value::Null);
        }
        Ok(match &self.data {
            ColumnData::Int(values) => Value::Int(values[row]),
            ColumnData::Float(values) => Value::Float(values[row]),
            ColumnData::Text { .. } => {
                let bytes = self.var_bytes(row)?;
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
            ColumnData::Binary { .. } => Value::Binary(self.var_bytes(row)?.to_vec()),
        })
    }

    /// Fixed-width cell as its 8-byte little-endian storage form.
    ///
    /// Integers are stored as `i64` little-endian, floats as their IEEE bit
    /// pattern little-endian. Only meaningful for valid rows of fixed-width
    /// columns.
    pub fn fixed_le_bytes(&self, row: usize) -> Result<[u8; 8], BatchFormatError> {
        match &self.data {
            ColumnData::Int(values) => values
                .get(row)
                .map(|v| v.to_le_bytes())
                .ok_or(BatchFormatError::RowIndexOutOfBounds {
                    row,
                    rows: self.len(),
                }),
            ColumnData::Float(values) => values
                .get(row)
                .map(|v| v.to_bits().to_le_bytes())
                .ok_or(BatchFormatError::RowIndexOutOfBounds {
                    row,
                    rows: self.len(),
                }),
            ColumnData::Text { .. } | ColumnData::Binary { .. } => {
                Err(BatchFormatError::TypeMismatch {
                    column: self.spec.name.clone(),
                    expected: self.spec.dtype.to_string(),
                })
            }
        }
    }

    /// Byte slice of one variable-width cell.
    pub fn var_bytes(&self, row: usize) -> Result<&[u8], BatchFormatError> {
        let (offsets, bytes) = match &self.data {
            ColumnData::Text { offsets, bytes } | ColumnData::Binary { offsets, bytes } => {
                (offsets, bytes)
            }
            ColumnData::Int(_) | ColumnData::Float(_) => {
                return Err(BatchFormatError::TypeMismatch {
                    column: self.spec.name.clone(),
                    expected: self.spec.dtype.to_string(),
                });
            }
        };
        if row + 1 >= offsets.len() {
            return Err(BatchFormatError::RowIndexOutOfBounds {
                row,
                rows: offsets.len().saturating_sub(1),
            });
        }
        let start = offsets[row] as usize;
        let end = offsets[row + 1] as usize;
        if start > end || end > bytes.len() {
            return Err(BatchFormatError::OffsetOutOfBounds {
                column: self.spec.name.clone(),
                row,
                start,
                end,
                bytes_len: bytes.len(),
            });
        }
        Ok(&bytes[start..end])
    }
}

// ── Batch ──────────────────────────────────────────────────────────────────

/// An immutable set of equal-length columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    columns: Vec<Column>,
    num_rows: usize,
}

impl Batch {
    /// Assemble a batch from finished columns.
    ///
    /// # Errors
    ///
    /// Returns an error when column lengths disagree.
    pub fn new(columns: Vec<Column>) -> Result<Self, BatchFormatError> {
        let num_rows = columns.first().map_or(0, Column::len);
        for column in &columns {
            if column.len() != num_rows {
                return Err(BatchFormatError::ColumnLengthMismatch {
                    column: column.spec.name.clone(),
                    expected: num_rows,
                    actual: column.len(),
                });
            }
        }
        Ok(Self { columns, num_rows })
    }

    /// An empty batch with the given schema.
    #[must_use]
    pub fn empty(specs: &[ColumnSpec]) -> Self {
        let columns = specs
            .iter()
            .map(|spec| Column {
                spec: spec.clone(),
                data: ColumnData::empty(spec.dtype),
                validity: NullBitmap::new(),
            })
            .collect();
        Self {
            columns,
            num_rows: 0,
        }
    }

    /// Build a batch row-by-row; the usual construction path in tests.
    ///
    /// # Errors
    ///
    /// Returns an error when a row is ragged or a value does not fit its
    /// column type.
    pub fn from_rows(specs: &[ColumnSpec], rows: &[Vec<Value>]) -> Result<Self, BatchFormatError> {
        let mut builders: Vec<crate::ColumnBuilder> = specs
            .iter()
            .map(|spec| crate::ColumnBuilder::new(spec.clone()))
            .collect();
        for row in rows {
            if row.len() != specs.len() {
                return Err(BatchFormatError::SchemaMismatch {
                    expected_columns: specs.len(),
                    actual_columns: row.len(),
                });
            }
            for (builder, value) in builders.iter_mut().zip(row) {
                builder.append_value(value)?;
            }
        }
        Self::new(builders.into_iter().map(crate::ColumnBuilder::finish).collect())
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by index.
    pub fn column(&self, index: usize) -> Result<&Column, BatchFormatError> {
        self.columns
            .get(index)
            .ok_or(BatchFormatError::ColumnIndexOutOfBounds {
                index,
                count: self.columns.len(),
            })
    }

    /// Read one cell as an owned [`Value`].
    pub fn value(&self, column: usize, row: usize) -> Result<Value, BatchFormatError> {
        self.column(column)?.value(row)
    }

    /// One full row as owned values.
    pub fn row(&self, row: usize) -> Result<Vec<Value>, BatchFormatError> {
        self.columns
            .iter()
            .map(|column| column.value(row))
            .collect()
    }
}
