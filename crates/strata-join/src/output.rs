//! Output materialization.
//!
//! [`OutputBuilder`] accumulates joined rows up to a configured capacity.
//! Probe-side cells are copied straight out of the probe batch; build-side
//! cells are decoded from row bytes through the table layout. Outer-join
//! null extension appends nulls into the missing side's builders.
//!
//! [`CandidateLayout`] materializes just the residual-predicate columns of
//! buffered `(r, s)` pairs, so the evaluator runs in vector mode before any
//! non-predicate column is touched.

use strata_batch::{Batch, Column, ColumnBuilder, ColumnData, ColumnSpec};
use strata_error::{Result, StrataError};

use crate::desc::{BuildSide, HashJoinDesc};
use crate::layout::TableMeta;
use crate::row_table::{RowPtr, RowTable};

/// Copy one probe-batch cell into a builder.
fn append_cell(builder: &mut ColumnBuilder, column: &Column, row: usize) -> Result<()> {
    if !column.validity.is_valid(row) {
        builder.append_null();
        return Ok(());
    }
    match &column.data {
        ColumnData::Int(values) => builder.append_int(values[row]),
        ColumnData::Float(values) => builder.append_float(values[row]),
        ColumnData::Text { .. } | ColumnData::Binary { .. } => {
            builder.append_var_bytes(column.var_bytes(row)?);
        }
    }
    Ok(())
}

/// Where each side's columns live in the output schema.
#[derive(Debug, Clone, Copy)]
struct SideRanges {
    /// Start of the probe-side columns, when present.
    probe_start: Option<usize>,
    probe_len: usize,
    /// Start of the build-side columns, when present.
    build_start: Option<usize>,
    build_len: usize,
}

impl SideRanges {
    fn from_desc(desc: &HashJoinDesc) -> Self {
        let kind = desc.probe_kind();
        let probe_len = desc.probe_schema.len();
        let build_len = desc.build_schema.len();
        match (kind.output_has_probe_side(), kind.output_has_build_side()) {
            (true, false) => Self {
                probe_start: Some(0),
                probe_len,
                build_start: None,
                build_len: 0,
            },
            (false, true) => Self {
                probe_start: None,
                probe_len: 0,
                build_start: Some(0),
                build_len,
            },
            _ => match desc.build_side {
                BuildSide::Left => Self {
                    probe_start: Some(build_len),
                    probe_len,
                    build_start: Some(0),
                    build_len,
                },
                BuildSide::Right => Self {
                    probe_start: Some(0),
                    probe_len,
                    build_start: Some(probe_len),
                    build_len,
                },
            },
        }
    }
}

/// Accumulates output rows into column builders, capped at a row capacity.
pub(crate) struct OutputBuilder<'a> {
    meta: &'a TableMeta,
    specs: Vec<ColumnSpec>,
    builders: Vec<ColumnBuilder>,
    ranges: SideRanges,
    /// Decode plan for the full build side, absolute builder indexes.
    build_plan: Vec<(usize, usize)>,
    required_rows: usize,
    rows: usize,
}

impl<'a> OutputBuilder<'a> {
    pub(crate) fn new(desc: &HashJoinDesc, meta: &'a TableMeta) -> Self {
        let specs = desc.output_specs();
        let ranges = SideRanges::from_desc(desc);
        let build_plan = ranges.build_start.map_or_else(Vec::new, |start| {
            meta.decode_plan(0..desc.build_schema.len())
                .into_iter()
                .map(|(pos, builder_idx)| (pos, start + builder_idx))
                .collect()
        });
        let builders = specs.iter().cloned().map(ColumnBuilder::new).collect();
        Self {
            meta,
            specs,
            builders,
            ranges,
            build_plan,
            required_rows: desc.output_batch_rows,
            rows: 0,
        }
    }

    pub(crate) fn row_count(&self) -> usize {
        self.rows
    }

    pub(crate) fn is_full(&self) -> bool {
        self.rows >= self.required_rows
    }

    /// Emit a matched `(probe row, build row)` pair.
    pub(crate) fn append_pair(
        &mut self,
        probe_batch: &Batch,
        probe_row: usize,
        row_table: &RowTable,
        build_ptr: RowPtr,
    ) -> Result<()> {
        self.copy_probe_side(probe_batch, probe_row)?;
        let row_bytes = row_table.row_bytes(build_ptr)?;
        self.meta
            .decode_positions(row_bytes, &self.build_plan, &mut self.builders)?;
        self.rows += 1;
        Ok(())
    }

    /// Emit a probe row with the build side null-extended (or absent, for
    /// semi/anti outputs).
    pub(crate) fn append_probe_row(&mut self, probe_batch: &Batch, probe_row: usize) -> Result<()> {
        self.copy_probe_side(probe_batch, probe_row)?;
        if let Some(start) = self.ranges.build_start {
            for builder in &mut self.builders[start..start + self.ranges.build_len] {
                builder.append_null();
            }
        }
        self.rows += 1;
        Ok(())
    }

    /// Emit a build row with the probe side null-extended (or absent).
    pub(crate) fn append_build_row(
        &mut self,
        row_table: &RowTable,
        build_ptr: RowPtr,
    ) -> Result<()> {
        if let Some(start) = self.ranges.probe_start {
            for builder in &mut self.builders[start..start + self.ranges.probe_len] {
                builder.append_null();
            }
        }
        let row_bytes = row_table.row_bytes(build_ptr)?;
        self.meta
            .decode_positions(row_bytes, &self.build_plan, &mut self.builders)?;
        self.rows += 1;
        Ok(())
    }

    /// Take the accumulated rows as a batch and reset.
    pub(crate) fn finish_batch(&mut self) -> Result<Batch> {
        let fresh: Vec<ColumnBuilder> = self.specs.iter().cloned().map(ColumnBuilder::new).collect();
        let finished = std::mem::replace(&mut self.builders, fresh);
        self.rows = 0;
        Ok(Batch::new(
            finished.into_iter().map(ColumnBuilder::finish).collect(),
        )?)
    }

    fn copy_probe_side(&mut self, probe_batch: &Batch, probe_row: usize) -> Result<()> {
        let Some(start) = self.ranges.probe_start else {
            return Ok(());
        };
        for (offset, column) in probe_batch.columns().iter().enumerate() {
            append_cell(&mut self.builders[start + offset], column, probe_row)?;
        }
        Ok(())
    }
}

/// Rough in-memory footprint of a finished batch, for the memory tracker.
pub(crate) fn approx_batch_bytes(batch: &Batch) -> usize {
    batch
        .columns()
        .iter()
        .map(|column| match &column.data {
            ColumnData::Int(values) => values.len() * 8,
            ColumnData::Float(values) => values.len() * 8,
            ColumnData::Text { offsets, bytes } | ColumnData::Binary { offsets, bytes } => {
                offsets.len() * 4 + bytes.len()
            }
        })
        .sum()
}

/// Materializes the residual-predicate columns of buffered pairs.
///
/// The candidate batch's schema is the probe predicate columns (in the
/// order listed in the join description) followed by the build predicate
/// columns; the evaluator is written against that layout.
pub(crate) struct CandidateLayout {
    specs: Vec<ColumnSpec>,
    probe_cols: Vec<usize>,
    /// Build predicate columns as a decode plan; builder indexes follow the
    /// probe columns.
    build_plan: Vec<(usize, usize)>,
}

impl CandidateLayout {
    pub(crate) fn new(desc: &HashJoinDesc, meta: &TableMeta) -> Option<Self> {
        let residual = desc.residual.as_ref()?;
        let mut specs: Vec<ColumnSpec> = residual
            .probe_cols
            .iter()
            .map(|&col| desc.probe_schema[col].clone())
            .collect();
        specs.extend(
            residual
                .build_cols
                .iter()
                .map(|&col| desc.build_schema[col].clone()),
        );
        let offset = residual.probe_cols.len();
        let build_plan = meta
            .decode_plan(residual.build_cols.iter().copied())
            .into_iter()
            .map(|(pos, builder_idx)| (pos, offset + builder_idx))
            .collect();
        Some(Self {
            specs,
            probe_cols: residual.probe_cols.clone(),
            build_plan,
        })
    }

    /// Build the candidate batch for a run of `(probe row, build row)`
    /// pairs.
    pub(crate) fn materialize(
        &self,
        meta: &TableMeta,
        probe_batch: &Batch,
        pairs: &[(u32, RowPtr)],
        row_table: &RowTable,
    ) -> Result<Batch> {
        let mut builders: Vec<ColumnBuilder> =
            self.specs.iter().cloned().map(ColumnBuilder::new).collect();
        for &(probe_row, build_ptr) in pairs {
            for (offset, &col) in self.probe_cols.iter().enumerate() {
                append_cell(
                    &mut builders[offset],
                    probe_batch.column(col)?,
                    probe_row as usize,
                )?;
            }
            let row_bytes = row_table.row_bytes(build_ptr)?;
            meta.decode_positions(row_bytes, &self.build_plan, &mut builders)?;
        }
        Batch::new(builders.into_iter().map(ColumnBuilder::finish).collect())
            .map_err(StrataError::from)
    }
}
