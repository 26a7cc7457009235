//! Join configuration and the probe-relative strategy table.

use strata_batch::{ColumnSpec, JoinKeySchema};
use strata_error::{Result, StrataError};

/// SQL-level join type. Left and right refer to the output sides, not to
/// which input is indexed; that is chosen separately by [`BuildSide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    LeftSemi,
    RightSemi,
    LeftAnti,
    RightAnti,
}

/// Which input the engine consumes fully and indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSide {
    Left,
    Right,
}

/// Join semantics reduced to the probe loop's point of view: `r` is a probe
/// row, `s` a build row.
///
/// The `Probe*` kinds resolve entirely during the probe pass. The `Build*`
/// kinds additionally mark matched build rows and answer from the
/// scan-row-table pass once probing is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeKind {
    /// Emit `(r, s)` for every match.
    Inner,
    /// Emit `(r, s)` for matches; emit `(r, nulls)` when `r` never matches.
    ProbeOuter,
    /// Emit `r` once if it matched at least one `s`.
    ProbeSemi,
    /// Emit `r` once if it matched no `s`.
    ProbeAnti,
    /// Emit `(r, s)` for matches, mark `s`; scan emits `(nulls, s)` for
    /// unmarked rows.
    BuildOuter,
    /// Mark matched `s`; scan emits marked rows.
    BuildSemi,
    /// Mark matched `s`; scan emits unmarked rows.
    BuildAnti,
}

impl ProbeKind {
    pub(crate) fn from_join(join_type: JoinType, build_side: BuildSide) -> Self {
        use BuildSide::{Left, Right};
        match (join_type, build_side) {
            (JoinType::Inner, _) => Self::Inner,
            (JoinType::LeftOuter, Right) | (JoinType::RightOuter, Left) => Self::ProbeOuter,
            (JoinType::LeftOuter, Left) | (JoinType::RightOuter, Right) => Self::BuildOuter,
            (JoinType::LeftSemi, Right) | (JoinType::RightSemi, Left) => Self::ProbeSemi,
            (JoinType::LeftSemi, Left) | (JoinType::RightSemi, Right) => Self::BuildSemi,
            (JoinType::LeftAnti, Right) | (JoinType::RightAnti, Left) => Self::ProbeAnti,
            (JoinType::LeftAnti, Left) | (JoinType::RightAnti, Right) => Self::BuildAnti,
        }
    }

    /// Build rows need a post-probe sweep (and used flags) to finish the
    /// join.
    pub(crate) fn needs_scan_row_table(self) -> bool {
        matches!(self, Self::BuildOuter | Self::BuildSemi | Self::BuildAnti)
    }

    /// The output contains probe-side columns.
    pub(crate) fn output_has_probe_side(self) -> bool {
        !matches!(self, Self::BuildSemi | Self::BuildAnti)
    }

    /// The output contains build-side columns.
    pub(crate) fn output_has_build_side(self) -> bool {
        !matches!(self, Self::ProbeSemi | Self::ProbeAnti)
    }
}

/// Residual (non-equi) predicate shape: which columns of each side the
/// evaluator reads. The candidate batch handed to the evaluator is these
/// probe columns (in the listed order) followed by these build columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResidualDesc {
    pub probe_cols: Vec<usize>,
    pub build_cols: Vec<usize>,
}

/// Full description of one hash join.
#[derive(Debug, Clone)]
pub struct HashJoinDesc {
    pub join_type: JoinType,
    pub build_side: BuildSide,
    pub build_schema: Vec<ColumnSpec>,
    pub probe_schema: Vec<ColumnSpec>,
    pub build_keys: JoinKeySchema,
    pub probe_keys: JoinKeySchema,
    /// Present when the join carries a non-equi residual predicate.
    pub residual: Option<ResidualDesc>,
    /// Worker threads per stage.
    pub concurrency: usize,
    /// Logical partition count; rounded up to a power of two, default
    /// `max(concurrency, 16)`.
    pub partitions: Option<usize>,
    /// Row capacity of output batches handed to the sink.
    pub output_batch_rows: usize,
}

/// Default output batch capacity in rows.
pub const DEFAULT_OUTPUT_BATCH_ROWS: usize = 1024;

const MIN_PARTITIONS: usize = 16;
/// Partition index must fit the row-pointer encoding.
const MAX_PARTITIONS: usize = 1 << 15;

impl HashJoinDesc {
    /// Describe a join with default batching and partitioning.
    pub fn new(
        join_type: JoinType,
        build_side: BuildSide,
        build_schema: Vec<ColumnSpec>,
        probe_schema: Vec<ColumnSpec>,
        build_keys: JoinKeySchema,
        probe_keys: JoinKeySchema,
        concurrency: usize,
    ) -> Self {
        Self {
            join_type,
            build_side,
            build_schema,
            probe_schema,
            build_keys,
            probe_keys,
            residual: None,
            concurrency,
            partitions: None,
            output_batch_rows: DEFAULT_OUTPUT_BATCH_ROWS,
        }
    }

    #[must_use]
    pub fn with_residual(mut self, residual: ResidualDesc) -> Self {
        self.residual = Some(residual);
        self
    }

    #[must_use]
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = Some(partitions);
        self
    }

    #[must_use]
    pub fn with_output_batch_rows(mut self, rows: usize) -> Self {
        self.output_batch_rows = rows;
        self
    }

    pub(crate) fn probe_kind(&self) -> ProbeKind {
        ProbeKind::from_join(self.join_type, self.build_side)
    }

    /// Effective partition count: a power of two, at least
    /// `max(concurrency, 16)` unless overridden.
    pub fn partition_count(&self) -> usize {
        let wanted = self
            .partitions
            .unwrap_or_else(|| self.concurrency.max(MIN_PARTITIONS))
            .clamp(1, MAX_PARTITIONS);
        wanted.next_power_of_two()
    }

    /// Output schema: `left ++ right` for pair-emitting joins, one side's
    /// schema for semi/anti joins.
    pub fn output_specs(&self) -> Vec<ColumnSpec> {
        let kind = self.probe_kind();
        match (kind.output_has_probe_side(), kind.output_has_build_side()) {
            (true, false) => self.probe_schema.clone(),
            (false, true) => self.build_schema.clone(),
            _ => {
                let (left, right) = match self.build_side {
                    BuildSide::Left => (&self.build_schema, &self.probe_schema),
                    BuildSide::Right => (&self.probe_schema, &self.build_schema),
                };
                left.iter().chain(right.iter()).cloned().collect()
            }
        }
    }

    /// Check internal consistency before the engine starts.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(StrataError::InvariantViolated(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.output_batch_rows == 0 {
            return Err(StrataError::InvariantViolated(
                "output_batch_rows must be at least 1".into(),
            ));
        }
        if self.build_keys.is_empty() {
            return Err(StrataError::InvariantViolated(
                "join requires at least one key column".into(),
            ));
        }
        if self.build_keys.len() != self.probe_keys.len() {
            return Err(StrataError::InvariantViolated(format!(
                "build side has {} key columns, probe side has {}",
                self.build_keys.len(),
                self.probe_keys.len()
            )));
        }
        for (build, probe) in self
            .build_keys
            .columns()
            .iter()
            .zip(self.probe_keys.columns())
        {
            if build.dtype != probe.dtype || build.null_eq_null != probe.null_eq_null {
                return Err(StrataError::InvariantViolated(format!(
                    "key column types or null semantics disagree: {:?} vs {:?}",
                    build, probe
                )));
            }
        }
        Self::check_columns(&self.build_schema, self.build_keys.columns().iter().map(|k| k.column))?;
        Self::check_columns(&self.probe_schema, self.probe_keys.columns().iter().map(|k| k.column))?;
        for (key, spec_col) in self
            .build_keys
            .columns()
            .iter()
            .map(|k| (k, &self.build_schema[k.column]))
        {
            if key.dtype != spec_col.dtype {
                return Err(StrataError::InvariantViolated(format!(
                    "build key column {} declared {} but schema says {}",
                    key.column, key.dtype, spec_col.dtype
                )));
            }
        }
        for (key, spec_col) in self
            .probe_keys
            .columns()
            .iter()
            .map(|k| (k, &self.probe_schema[k.column]))
        {
            if key.dtype != spec_col.dtype {
                return Err(StrataError::InvariantViolated(format!(
                    "probe key column {} declared {} but schema says {}",
                    key.column, key.dtype, spec_col.dtype
                )));
            }
        }
        if let Some(residual) = &self.residual {
            Self::check_columns(&self.build_schema, residual.build_cols.iter().copied())?;
            Self::check_columns(&self.probe_schema, residual.probe_cols.iter().copied())?;
        }
        Ok(())
    }

    fn check_columns(schema: &[ColumnSpec], cols: impl Iterator<Item = usize>) -> Result<()> {
        for col in cols {
            if col >= schema.len() {
                return Err(StrataError::InvariantViolated(format!(
                    "column index {col} out of bounds for schema of {} columns",
                    schema.len()
                )));
            }
        }
        Ok(())
    }
}
