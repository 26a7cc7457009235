//! Mutable column construction.

use crate::batch::{BatchFormatError, Column, ColumnData, ColumnSpec, NullBitmap};
use crate::value::{DataType, Value};

/// Append-only builder for one column.
///
/// The join engine appends decoded build-side cells through the typed and
/// raw-byte entry points; tests go through [`ColumnBuilder::append_value`].
#[derive(Debug)]
pub struct ColumnBuilder {
    spec: ColumnSpec,
    data: ColumnData,
    validity: NullBitmap,
}

impl ColumnBuilder {
    #[must_use]
    pub fn new(spec: ColumnSpec) -> Self {
        let data = ColumnData::empty(spec.dtype);
        Self {
            spec,
            data,
            validity: NullBitmap::new(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &ColumnSpec {
        &self.spec
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.validity.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an owned value, null included.
    ///
    /// # Errors
    ///
    /// Returns an error when the value does not fit the column type.
    pub fn append_value(&mut self, value: &Value) -> Result<(), BatchFormatError> {
        if !value.fits(self.spec.dtype) {
            return Err(BatchFormatError::TypeMismatch {
                column: self.spec.name.clone(),
                expected: self.spec.dtype.to_string(),
            });
        }
        match value {
            Value::Null => self.append_null(),
            Value::Int(v) => self.append_int(*v),
            Value::Float(v) => self.append_float(*v),
            Value::Text(v) => self.append_var_bytes(v.as_bytes()),
            Value::Binary(v) => self.append_var_bytes(v),
        }
        Ok(())
    }

    /// Append a null; storage receives a placeholder so offsets stay dense.
    pub fn append_null(&mut self) {
        match &mut self.data {
            ColumnData::Int(values) => values.push(0),
            ColumnData::Float(values) => values.push(0.0),
            ColumnData::Text { offsets, bytes } | ColumnData::Binary { offsets, bytes } => {
                offsets.push(bytes.len() as u32);
            }
        }
        self.validity.push(false);
    }

    pub fn append_int(&mut self, v: i64) {
        match &mut self.data {
            ColumnData::Int(values) => values.push(v),
            _ => unreachable!("append_int on non-int column is guarded by append_value"),
        }
        self.validity.push(true);
    }

    pub fn append_float(&mut self, v: f64) {
        match &mut self.data {
            ColumnData::Float(values) => values.push(v),
            _ => unreachable!("append_float on non-float column is guarded by append_value"),
        }
        self.validity.push(true);
    }

    /// Append a fixed-width cell from its 8-byte little-endian storage form.
    /// The inverse of [`Column::fixed_le_bytes`](crate::Column::fixed_le_bytes).
    pub fn append_fixed_le_bytes(&mut self, raw: [u8; 8]) {
        match &mut self.data {
            ColumnData::Int(values) => values.push(i64::from_le_bytes(raw)),
            ColumnData::Float(values) => values.push(f64::from_bits(u64::from_le_bytes(raw))),
            ColumnData::Text { .. } | ColumnData::Binary { .. } => {
                unreachable!("append_fixed_le_bytes on variable-width column")
            }
        }
        self.validity.push(true);
    }

    /// Append a variable-width cell from raw bytes.
    pub fn append_var_bytes(&mut self, cell: &[u8]) {
        match &mut self.data {
            ColumnData::Text { offsets, bytes } | ColumnData::Binary { offsets, bytes } => {
                bytes.extend_from_slice(cell);
                offsets.push(bytes.len() as u32);
            }
            ColumnData::Int(_) | ColumnData::Float(_) => {
                unreachable!("append_var_bytes on fixed-width column")
            }
        }
        self.validity.push(true);
    }

    #[must_use]
    pub fn finish(self) -> Column {
        Column {
            spec: self.spec,
            data: self.data,
            validity: self.validity,
        }
    }
}
